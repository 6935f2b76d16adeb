//! Typed error handling for dispatch operations.

use drover_providers::SendError;
use drover_store::StoreError;
use thiserror::Error;

use crate::router::RouteError;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The router could not resolve a provider.
    #[error("routing error: {0}")]
    Route(#[from] RouteError),

    /// A provider send failed.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// The engine was used before `init()`.
    #[error("dispatch engine not initialized: {0}")]
    NotInitialized(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}
