//! The persisted queue record
//!
//! Wraps a [`Message`] with the store-owned bookkeeping that must never be
//! writable by dispatch code directly: the worker lease, the visibility
//! delay, and the defer counter.

use chrono::{DateTime, Utc};
use drover_common::Message;
use serde::{Deserialize, Serialize};

/// A time-bounded exclusive claim on a Processing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker that owns the claim
    pub worker_id: String,
    /// Instant after which the claim no longer protects the message
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A message plus the store's bookkeeping for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    /// Present exactly while status is Processing
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Not-before timestamp for Deferred messages
    #[serde(default)]
    pub next_visible_at: Option<DateTime<Utc>>,
    /// Upstream id returned by the provider on successful send
    #[serde(default)]
    pub provider_message_id: Option<String>,
    /// Rate-limit deferrals, counted separately from retries
    #[serde(default)]
    pub defer_count: u32,
}

impl StoredMessage {
    /// Wrap a freshly enqueued message
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self {
            message,
            lease: None,
            next_visible_at: None,
            provider_message_id: None,
            defer_count: 0,
        }
    }

    /// Whether the record is claimable at `now`
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        use drover_common::MessageStatus::{Deferred, Processing, Queued};

        match self.message.status {
            Queued => self.next_visible_at.is_none_or(|at| at <= now),
            Deferred => self.next_visible_at.is_some_and(|at| at <= now),
            Processing => self.lease.as_ref().is_some_and(|l| l.is_expired(now)),
            _ => false,
        }
    }
}
