//! Error types for the drover-store crate.
//!
//! Transient failures (I/O, lock poisoning) are retriable; state-machine
//! violations are fatal so a buggy caller surfaces immediately instead of
//! corrupting queue state.

use std::io;

use drover_common::{MessageId, MessageStatus};
use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (record read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Message not found in the store.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A disallowed status transition was requested.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// Store capacity bound reached.
    #[error("Store capacity exceeded: {used}/{capacity} messages")]
    CapacityExceeded { used: usize, capacity: usize },

    /// Store directory validation failed.
    #[error("Store validation error: {0}")]
    Validation(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Internal(_))
    }
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Record data is corrupted or incomplete.
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
