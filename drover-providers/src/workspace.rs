//! Google-Workspace-style JSON API adapter
//!
//! Sends through a bearer-token REST endpoint: one JSON POST per message,
//! upstream id returned in the response body.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use drover_common::{
    Message, ProviderConfig,
    provider::BackendConfig,
    tracing::{self, debug},
};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use serde::Deserialize;

use crate::{
    client::{ProviderClient, SendReceipt},
    error::{BuildError, SendError},
};

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Adapter for Workspace-style backends
#[derive(Debug)]
pub struct WorkspaceClient {
    config: ProviderConfig,
    base_url: String,
    http: reqwest::Client,
}

impl WorkspaceClient {
    /// Build an adapter from a provider configuration
    ///
    /// # Errors
    /// If the backend kind does not match or the HTTP client cannot be built
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, BuildError> {
        let BackendConfig::Workspace { base_url, token } = &config.backend else {
            return Err(BuildError::BackendMismatch {
                provider: config.id.to_string(),
                expected: "workspace",
                actual: config.backend.kind(),
            });
        };

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .map_err(|e| BuildError::InvalidCredential {
                    provider: config.id.to_string(),
                    error: format!("{e}"),
                })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            config,
            base_url,
            http,
        })
    }

    fn payload(message: &Message) -> serde_json::Value {
        serde_json::json!({
            "from": message.from,
            "to": message.to,
            "cc": message.cc,
            "bcc": message.bcc,
            "subject": message.subject,
            "text": message.body_text,
            "html": message.body_html,
            "headers": message
                .headers
                .iter()
                .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
                .collect::<Vec<_>>(),
            "attachments": message
                .attachments
                .iter()
                .map(|a| serde_json::json!({
                    "name": a.name,
                    "mime": a.mime,
                    "content": BASE64.encode(&a.bytes),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl ProviderClient for WorkspaceClient {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[tracing::instrument(level = "debug", skip_all, fields(provider = %self.config.id, message_id = %message.id))]
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .json(&Self::payload(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::from_http(status, &body, retry_after));
        }

        let parsed: SendResponse = response.json().await.map_err(|e| {
            SendError::Transient(format!("unparseable send response: {e}"))
        })?;

        debug!(upstream_id = %parsed.id, "workspace accepted message");

        Ok(SendReceipt {
            provider_message_id: parsed.id,
            latency: started.elapsed(),
        })
    }

    async fn health_probe(&self) -> Result<(), SendError> {
        let response = self
            .http
            .get(format!("{}/v1/health", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SendError::from_http(status, &body, None))
        }
    }
}
