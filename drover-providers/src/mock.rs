//! Scripted provider double for tests
//!
//! Outcomes are queued ahead of time; once the script runs dry every send
//! succeeds with a generated upstream id. Wait helpers let tests block until
//! the engine has actually pushed messages through.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use drover_common::{
    Domain, Message, ProviderConfig, ProviderId,
    provider::{BackendConfig, RateLimits},
};
use tokio::sync::Notify;

use crate::{
    client::{ProviderClient, SendReceipt},
    error::SendError,
};

/// In-memory [`ProviderClient`] with scripted outcomes
#[derive(Debug, Clone)]
pub struct MockProvider {
    config: Arc<ProviderConfig>,
    outcomes: Arc<Mutex<VecDeque<Result<SendReceipt, SendError>>>>,
    sent: Arc<Mutex<Vec<Message>>>,
    probe_error: Arc<Mutex<Option<SendError>>>,
    counter: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl MockProvider {
    /// Create a mock provider authoritative for the given domains
    #[must_use]
    pub fn new(id: impl Into<ProviderId>, domains: Vec<Domain>) -> Self {
        let id = id.into();
        let config = ProviderConfig {
            backend: BackendConfig::Workspace {
                base_url: format!("mock://{id}"),
                token: "mock".to_string(),
            },
            id,
            enabled: true,
            priority: 100,
            weight: 1.0,
            domains,
            rate_limits: RateLimits::default(),
            header_rewrites: Vec::new(),
        };

        Self {
            config: Arc::new(config),
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            probe_error: Arc::new(Mutex::new(None)),
            counter: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Replace the provider configuration (limits, weight, rewrites, ...)
    #[must_use]
    pub fn with_config(mut self, f: impl FnOnce(&mut ProviderConfig)) -> Self {
        let mut config = (*self.config).clone();
        f(&mut config);
        self.config = Arc::new(config);
        self
    }

    /// Queue the outcome for the next send
    ///
    /// # Panics
    /// If the script mutex is poisoned
    pub fn push_outcome(&self, outcome: Result<SendReceipt, SendError>) {
        self.outcomes
            .lock()
            .expect("mock outcomes mutex poisoned")
            .push_back(outcome);
    }

    /// Queue `n` consecutive failures with the same error
    pub fn fail_next(&self, n: usize, error: &SendError) {
        for _ in 0..n {
            self.push_outcome(Err(error.clone()));
        }
    }

    /// Script the next health probe to fail
    ///
    /// # Panics
    /// If the probe mutex is poisoned
    pub fn set_probe_error(&self, error: Option<SendError>) {
        *self.probe_error.lock().expect("mock probe mutex poisoned") = error;
    }

    /// Messages that reached a successful or failed send call
    ///
    /// # Panics
    /// If the sent mutex is poisoned
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().expect("mock sent mutex poisoned").clone()
    }

    /// Number of send calls observed
    ///
    /// # Panics
    /// If the sent mutex is poisoned
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.sent.lock().expect("mock sent mutex poisoned").len()
    }

    /// Wait until at least `expected` sends were observed
    ///
    /// # Errors
    /// If the timeout elapses first
    pub async fn wait_for_sends(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.send_count() >= expected {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        self.sent
            .lock()
            .expect("mock sent mutex poisoned")
            .push(message.clone());
        self.notify.notify_waiters();

        let scripted = self
            .outcomes
            .lock()
            .expect("mock outcomes mutex poisoned")
            .pop_front();

        scripted.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(SendReceipt {
                provider_message_id: format!("{}-{n}", self.config.id),
                latency: Duration::ZERO,
            })
        })
    }

    async fn health_probe(&self) -> Result<(), SendError> {
        match self
            .probe_error
            .lock()
            .expect("mock probe mutex poisoned")
            .clone()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use drover_common::SenderAddress;

    use super::*;

    fn message() -> Message {
        Message::new("a@x.com", vec!["b@y.com".to_string()], chrono::Utc::now())
    }

    #[tokio::test]
    async fn test_default_outcome_is_success() {
        let mock = MockProvider::new("p1", vec![Domain::new("x.com")]);
        let receipt = mock.send(&message()).await.unwrap();
        assert_eq!(receipt.provider_message_id, "p1-0");
        assert_eq!(mock.send_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_drain_in_order() {
        let mock = MockProvider::new("p1", vec![Domain::new("x.com")]);
        mock.push_outcome(Err(SendError::Transient("boom".to_string())));

        assert!(mock.send(&message()).await.is_err());
        assert!(mock.send(&message()).await.is_ok());
    }

    #[tokio::test]
    async fn test_can_route_uses_domains() {
        let mock = MockProvider::new("p1", vec![Domain::new("x.com")]);
        assert!(mock.can_route(&SenderAddress::parse("a@x.com").unwrap()));
        assert!(!mock.can_route(&SenderAddress::parse("a@y.com").unwrap()));
    }

    #[tokio::test]
    async fn test_probe_error_scripting() {
        let mock = MockProvider::new("p1", vec![]);
        assert!(mock.health_probe().await.is_ok());

        mock.set_probe_error(Some(SendError::Transient("down".to_string())));
        assert!(mock.health_probe().await.is_err());
    }
}
