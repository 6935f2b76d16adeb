//! The uniform provider contract
//!
//! Every backend kind implements [`ProviderClient`]; the dispatch engine
//! never sees anything more specific. Header rewriting happens before the
//! adapter is called, so adapters serialize headers exactly as given.

use std::time::Duration;

use async_trait::async_trait;
use drover_common::{Message, ProviderConfig, ProviderId, SenderAddress};

use crate::error::SendError;

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// The id the upstream provider assigned to the message
    pub provider_message_id: String,
    /// Wall time the provider call took
    pub latency: Duration,
}

/// A tenant-scoped upstream backend
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// The provider's configuration, including its routing envelope
    fn config(&self) -> &ProviderConfig;

    /// The provider id
    fn id(&self) -> &ProviderId {
        &self.config().id
    }

    /// Whether this provider is authoritative for the sender's domain
    fn can_route(&self, sender: &SenderAddress) -> bool {
        self.config().covers_domain(sender.domain())
    }

    /// Deliver a message through the backend
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError>;

    /// Cheap liveness check, driven by the external probe scheduler
    async fn health_probe(&self) -> Result<(), SendError>;
}
