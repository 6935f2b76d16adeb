#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod address;
pub mod clock;
pub mod domain;
pub mod logging;
pub mod message;
pub mod provider;

pub use address::SenderAddress;
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::Domain;
pub use message::{Headers, Message, MessageId, MessageStatus};
pub use provider::{ProviderConfig, ProviderId, RateLimits};
pub use tracing;

/// Control signal broadcast to every long-running component
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
