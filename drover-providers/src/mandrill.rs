//! Mandrill-style JSON API adapter
//!
//! Single JSON POST with the key embedded in the body; the response is a
//! per-recipient status array. Any rejected or invalid recipient fails the
//! whole message permanently, since partial delivery cannot be retried
//! without duplicating the rest.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use drover_common::{
    Message, ProviderConfig,
    provider::BackendConfig,
    tracing::{self, debug},
};
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;

use crate::{
    client::{ProviderClient, SendReceipt},
    error::{BuildError, SendError},
};

#[derive(Debug, Deserialize)]
struct RecipientResult {
    #[serde(default)]
    email: String,
    status: String,
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

/// Adapter for Mandrill-style backends
#[derive(Debug)]
pub struct MandrillClient {
    config: ProviderConfig,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl MandrillClient {
    /// Build an adapter from a provider configuration
    ///
    /// # Errors
    /// If the backend kind does not match or the HTTP client cannot be built
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, BuildError> {
        let BackendConfig::Mandrill { base_url, api_key } = &config.backend else {
            return Err(BuildError::BackendMismatch {
                provider: config.id.to_string(),
                expected: "mandrill",
                actual: config.backend.kind(),
            });
        };

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let api_key = api_key.clone();

        Ok(Self {
            config,
            base_url,
            api_key,
            http,
        })
    }

    fn payload(&self, message: &Message) -> serde_json::Value {
        let recipients: Vec<_> = message
            .to
            .iter()
            .map(|email| serde_json::json!({ "email": email, "type": "to" }))
            .chain(
                message
                    .cc
                    .iter()
                    .map(|email| serde_json::json!({ "email": email, "type": "cc" })),
            )
            .chain(
                message
                    .bcc
                    .iter()
                    .map(|email| serde_json::json!({ "email": email, "type": "bcc" })),
            )
            .collect();

        let headers: serde_json::Map<String, serde_json::Value> = message
            .headers
            .iter()
            .map(|(name, value)| (name.to_string(), serde_json::Value::from(value)))
            .collect();

        serde_json::json!({
            "key": self.api_key,
            "message": {
                "from_email": message.from,
                "to": recipients,
                "subject": message.subject,
                "text": message.body_text,
                "html": message.body_html,
                "headers": headers,
                "attachments": message
                    .attachments
                    .iter()
                    .map(|a| serde_json::json!({
                        "type": a.mime,
                        "name": a.name,
                        "content": BASE64.encode(&a.bytes),
                    }))
                    .collect::<Vec<_>>(),
            },
        })
    }

    /// Mandrill reports key problems as a JSON error object, usually with a
    /// 500 status; dig the name out so bad credentials do not get retried.
    fn classify_error_body(status: reqwest::StatusCode, body: &str) -> SendError {
        if let Ok(api_error) = serde_json::from_str::<ApiError>(body) {
            if api_error.name == "Invalid_Key" {
                return SendError::Auth(format!("Invalid_Key: {}", api_error.message));
            }
            if api_error.name == "PaymentRequired" {
                return SendError::Permanent(format!("PaymentRequired: {}", api_error.message));
            }
        }

        SendError::from_http(status, body, None)
    }
}

#[async_trait]
impl ProviderClient for MandrillClient {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[tracing::instrument(level = "debug", skip_all, fields(provider = %self.config.id, message_id = %message.id))]
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/api/1.0/messages/send.json", self.base_url))
            .json(&self.payload(message))
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
            if retry_after.is_some() {
                return Err(SendError::from_http(status, &body, retry_after));
            }
            return Err(Self::classify_error_body(status, &body));
        }

        let results: Vec<RecipientResult> = response.json().await.map_err(|e| {
            SendError::Transient(format!("unparseable send response: {e}"))
        })?;

        if let Some(rejected) = results
            .iter()
            .find(|r| matches!(r.status.as_str(), "rejected" | "invalid"))
        {
            return Err(SendError::Permanent(format!(
                "recipient {} {}: {}",
                rejected.email,
                rejected.status,
                rejected.reject_reason.as_deref().unwrap_or("unspecified"),
            )));
        }

        let id = results
            .first()
            .map(|r| r.id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SendError::Transient("empty send response".to_string()))?;

        debug!(upstream_id = %id, "mandrill accepted message");

        Ok(SendReceipt {
            provider_message_id: id,
            latency: started.elapsed(),
        })
    }

    async fn health_probe(&self) -> Result<(), SendError> {
        let response = self
            .http
            .post(format!("{}/api/1.0/users/ping.json", self.base_url))
            .json(&serde_json::json!({ "key": self.api_key }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Self::classify_error_body(status, &body))
        }
    }
}
