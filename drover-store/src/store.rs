//! The durable queue contract
//!
//! Implementations must guarantee exactly-once claiming (no message owned by
//! two workers concurrently) and lease recovery (a message stuck in
//! Processing past its lease becomes claimable again with `retry_count`
//! unchanged). A message that reached Sent is never handed out again.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_common::{Message, MessageId, MessageStatus};

use crate::record::StoredMessage;

/// Which budget a deferral draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferKind {
    /// A transient send failure; increments `retry_count`
    Retry,
    /// A rate-limit denial; increments `defer_count` only
    RateLimit,
}

/// What a `mark_deferred` call actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferOutcome {
    /// The message was deferred with a not-before timestamp
    Deferred,
    /// The retry budget was already exhausted; the message failed instead
    Failed,
}

/// Persistent queue of messages awaiting dispatch
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Insert a message with status Queued
    ///
    /// Idempotent on the message's id: re-enqueueing an id that already
    /// exists returns the id without touching the stored record.
    async fn enqueue(&self, message: Message) -> crate::Result<MessageId>;

    /// Atomically claim up to `max_n` claimable messages for `worker_id`
    ///
    /// Claims Queued rows, visible Deferred rows, and Processing rows whose
    /// lease has expired, oldest `queued_at` first with ties broken by id.
    /// Every returned message has status Processing under a fresh lease.
    async fn claim_batch(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> crate::Result<Vec<Message>>;

    /// Record successful delivery; terminal
    async fn mark_sent(
        &self,
        id: &MessageId,
        provider_message_id: Option<String>,
    ) -> crate::Result<()>;

    /// Record permanent failure; terminal
    async fn mark_failed(&self, id: &MessageId, error: &str) -> crate::Result<()>;

    /// Defer the message until `next_visible_at`
    ///
    /// A `DeferKind::Retry` deferral whose retry budget is already spent
    /// downgrades to `mark_failed` and reports [`DeferOutcome::Failed`].
    async fn mark_deferred(
        &self,
        id: &MessageId,
        error: &str,
        next_visible_at: DateTime<Utc>,
        kind: DeferKind,
    ) -> crate::Result<DeferOutcome>;

    /// Record a credential rejection; requires operator reset
    async fn mark_auth_error(&self, id: &MessageId, error: &str) -> crate::Result<()>;

    /// Operator action: return an `AuthError` message to the queue
    async fn reset_auth_error(&self, id: &MessageId) -> crate::Result<()>;

    /// Cancel a message that has not been claimed yet
    async fn cancel(&self, id: &MessageId) -> crate::Result<()>;

    /// Delete terminal rows with the given statuses processed before `older_than`
    ///
    /// Returns the number of rows removed.
    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[MessageStatus],
    ) -> crate::Result<usize>;

    /// Fetch the full stored record for a message
    async fn get(&self, id: &MessageId) -> crate::Result<StoredMessage>;

    /// All message ids, sorted
    async fn list(&self) -> crate::Result<Vec<MessageId>>;

    /// Message counts by status, for the stats read-through
    async fn counts(&self) -> crate::Result<HashMap<MessageStatus, usize>>;
}
