//! Mailgun-style HTTP API adapter
//!
//! Form POST to `/v3/{domain}/messages` with HTTP basic auth; attachments
//! switch the request to multipart. Custom headers travel as `h:` fields.

use std::time::{Duration, Instant};

use async_trait::async_trait;
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
struct SendResponse {
    id: String,
}

/// Adapter for Mailgun-style backends
#[derive(Debug)]
pub struct MailgunClient {
    config: ProviderConfig,
    base_url: String,
    api_key: String,
    sending_domain: String,
    http: reqwest::Client,
}

impl MailgunClient {
    /// Build an adapter from a provider configuration
    ///
    /// # Errors
    /// If the backend kind does not match or the HTTP client cannot be built
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, BuildError> {
        let BackendConfig::Mailgun {
            base_url,
            api_key,
            sending_domain,
        } = &config.backend
        else {
            return Err(BuildError::BackendMismatch {
                provider: config.id.to_string(),
                expected: "mailgun",
                actual: config.backend.kind(),
            });
        };

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let api_key = api_key.clone();
        let sending_domain = sending_domain.clone();

        Ok(Self {
            config,
            base_url,
            api_key,
            sending_domain,
            http,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v3/{}/messages", self.base_url, self.sending_domain)
    }

    fn form_fields(message: &Message) -> Vec<(String, String)> {
        let mut fields = vec![
            ("from".to_string(), message.from.clone()),
            ("to".to_string(), message.to.join(",")),
            ("subject".to_string(), message.subject.clone()),
        ];

        if !message.cc.is_empty() {
            fields.push(("cc".to_string(), message.cc.join(",")));
        }
        if !message.bcc.is_empty() {
            fields.push(("bcc".to_string(), message.bcc.join(",")));
        }
        if let Some(text) = &message.body_text {
            fields.push(("text".to_string(), text.clone()));
        }
        if let Some(html) = &message.body_html {
            fields.push(("html".to_string(), html.clone()));
        }
        for (name, value) in message.headers.iter() {
            fields.push((format!("h:{name}"), value.to_string()));
        }

        fields
    }

    async fn post_message(&self, message: &Message) -> Result<reqwest::Response, SendError> {
        let request = self
            .http
            .post(self.messages_url())
            .basic_auth("api", Some(&self.api_key));

        let response = if message.attachments.is_empty() {
            request.form(&Self::form_fields(message)).send().await?
        } else {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in Self::form_fields(message) {
                form = form.text(name, value);
            }
            for attachment in &message.attachments {
                let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.name.clone())
                    .mime_str(&attachment.mime)
                    .map_err(|e| {
                        SendError::Permanent(format!(
                            "attachment '{}' has invalid mime type: {e}",
                            attachment.name
                        ))
                    })?;
                form = form.part("attachment", part);
            }
            request.multipart(form).send().await?
        };

        Ok(response)
    }
}

#[async_trait]
impl ProviderClient for MailgunClient {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[tracing::instrument(level = "debug", skip_all, fields(provider = %self.config.id, message_id = %message.id))]
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        let started = Instant::now();
        let response = self.post_message(message).await?;

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

        debug!(upstream_id = %parsed.id, "mailgun accepted message");

        Ok(SendReceipt {
            provider_message_id: parsed.id,
            latency: started.elapsed(),
        })
    }

    async fn health_probe(&self) -> Result<(), SendError> {
        let response = self
            .http
            .get(format!("{}/v3/domains/{}", self.base_url, self.sending_domain))
            .basic_auth("api", Some(&self.api_key))
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
