//! In-memory message store
//!
//! Stores records in a `HashMap` behind an `RwLock`; every mutating
//! operation holds the write guard for its whole critical section, which is
//! what makes `claim_batch` an atomic compare-and-set over the claimable
//! rows. Intended for tests and transient queues, but correct under
//! arbitrary concurrency.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_common::{Clock, Message, MessageId, MessageStatus};

use crate::{
    StoreError,
    record::{Lease, StoredMessage},
    store::{DeferKind, DeferOutcome, MessageStore},
};

const fn default_max_retries() -> u32 {
    5
}

const fn default_max_defers() -> u32 {
    50
}

/// In-memory implementation of [`MessageStore`]
#[derive(Debug, Clone)]
pub struct MemoryMessageStore {
    pub(crate) records: Arc<RwLock<HashMap<MessageId, StoredMessage>>>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    max_defers: u32,
    /// Maximum number of records to hold (None = unbounded)
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    /// Create a new unbounded store
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            clock,
            max_retries: default_max_retries(),
            max_defers: default_max_defers(),
            capacity: None,
        }
    }

    /// Set the retry budget consulted by `mark_deferred`
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the separate budget for rate-limit deferrals
    #[must_use]
    pub const fn with_max_defers(mut self, max_defers: u32) -> Self {
        self.max_defers = max_defers;
        self
    }

    /// Bound the number of records the store will hold
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Number of records currently held
    ///
    /// Recovers gracefully if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a status transition to a record, enforcing the transition table
    fn transition(
        record: &mut StoredMessage,
        to: MessageStatus,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let from = record.message.status;
        if !from.can_transition(to) {
            return Err(StoreError::InvalidTransition {
                id: record.message.id,
                from,
                to,
            });
        }

        record.message.status = to;
        if to.is_terminal() {
            record.message.processed_at = Some(now);
            record.lease = None;
            record.next_visible_at = None;
        }

        Ok(())
    }

    /// Run `f` on the record for `id` under the write lock
    fn with_record<T>(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut StoredMessage) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let mut records = self.records.write()?;
        let record = records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        f(record)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn enqueue(&self, mut message: Message) -> crate::Result<MessageId> {
        let mut records = self.records.write()?;

        // Idempotent on caller-supplied ids
        if records.contains_key(&message.id) {
            return Ok(message.id);
        }

        if let Some(cap) = self.capacity
            && records.len() >= cap
        {
            return Err(StoreError::CapacityExceeded {
                used: records.len(),
                capacity: cap,
            });
        }

        message.status = MessageStatus::Queued;
        message.retry_count = 0;
        message.processed_at = None;
        let id = message.id;
        records.insert(id, StoredMessage::new(message));

        Ok(id)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> crate::Result<Vec<Message>> {
        let now = self.clock.now();
        let mut records = self.records.write()?;

        let mut claimable: Vec<MessageId> = records
            .values()
            .filter(|record| record.is_claimable(now))
            .map(|record| record.message.id)
            .collect();

        // Oldest first, ties broken by id
        claimable.sort_by_key(|id| {
            let record = &records[id];
            (record.message.queued_at, record.message.id)
        });
        claimable.truncate(max_n);

        let expires_at = now
            + chrono::TimeDelta::from_std(lease)
                .map_err(|e| StoreError::Internal(format!("lease out of range: {e}")))?;

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let record = records
                .get_mut(&id)
                .ok_or(StoreError::Internal("claimable id vanished".to_string()))?;

            Self::transition(record, MessageStatus::Processing, now)?;
            record.lease = Some(Lease {
                worker_id: worker_id.to_string(),
                expires_at,
            });
            record.next_visible_at = None;
            claimed.push(record.message.clone());
        }

        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: &MessageId,
        provider_message_id: Option<String>,
    ) -> crate::Result<()> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            Self::transition(record, MessageStatus::Sent, now)?;
            record.provider_message_id = provider_message_id;
            record.message.last_error = None;
            Ok(())
        })
    }

    async fn mark_failed(&self, id: &MessageId, error: &str) -> crate::Result<()> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            Self::transition(record, MessageStatus::Failed, now)?;
            record.message.last_error = Some(error.to_string());
            Ok(())
        })
    }

    async fn mark_deferred(
        &self,
        id: &MessageId,
        error: &str,
        next_visible_at: DateTime<Utc>,
        kind: DeferKind,
    ) -> crate::Result<DeferOutcome> {
        let now = self.clock.now();
        let max_retries = self.max_retries;
        let max_defers = self.max_defers;
        self.with_record(id, |record| {
            match kind {
                DeferKind::Retry => {
                    if record.message.retry_count >= max_retries {
                        Self::transition(record, MessageStatus::Failed, now)?;
                        record.message.last_error = Some(error.to_string());
                        return Ok(DeferOutcome::Failed);
                    }
                    record.message.retry_count += 1;
                }
                DeferKind::RateLimit => {
                    if record.defer_count >= max_defers {
                        Self::transition(record, MessageStatus::Failed, now)?;
                        record.message.last_error =
                            Some(format!("defer budget exhausted: {error}"));
                        return Ok(DeferOutcome::Failed);
                    }
                    record.defer_count += 1;
                }
            }

            Self::transition(record, MessageStatus::Deferred, now)?;
            record.lease = None;
            record.next_visible_at = Some(next_visible_at);
            record.message.last_error = Some(error.to_string());
            Ok(DeferOutcome::Deferred)
        })
    }

    async fn mark_auth_error(&self, id: &MessageId, error: &str) -> crate::Result<()> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            Self::transition(record, MessageStatus::AuthError, now)?;
            record.lease = None;
            record.message.last_error = Some(error.to_string());
            Ok(())
        })
    }

    async fn reset_auth_error(&self, id: &MessageId) -> crate::Result<()> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            Self::transition(record, MessageStatus::Queued, now)?;
            record.message.retry_count = 0;
            record.defer_count = 0;
            record.next_visible_at = None;
            Ok(())
        })
    }

    async fn cancel(&self, id: &MessageId) -> crate::Result<()> {
        let now = self.clock.now();
        self.with_record(id, |record| {
            if !matches!(
                record.message.status,
                MessageStatus::Queued | MessageStatus::Deferred
            ) {
                return Err(StoreError::InvalidTransition {
                    id: record.message.id,
                    from: record.message.status,
                    to: MessageStatus::Failed,
                });
            }

            Self::transition(record, MessageStatus::Failed, now)?;
            record.message.last_error = Some("cancelled".to_string());
            Ok(())
        })
    }

    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[MessageStatus],
    ) -> crate::Result<usize> {
        let mut records = self.records.write()?;
        let before = records.len();

        records.retain(|_, record| {
            let terminal = record.message.status.is_terminal()
                && statuses.contains(&record.message.status);
            let old = record
                .message
                .processed_at
                .is_some_and(|at| at < older_than);
            !(terminal && old)
        });

        Ok(before - records.len())
    }

    async fn get(&self, id: &MessageId) -> crate::Result<StoredMessage> {
        self.records
            .read()?
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        let mut ids: Vec<_> = self.records.read()?.keys().copied().collect();
        // ULIDs sort lexicographically by creation time
        ids.sort();
        Ok(ids)
    }

    async fn counts(&self) -> crate::Result<HashMap<MessageStatus, usize>> {
        let records = self.records.read()?;
        let mut counts = HashMap::new();
        for record in records.values() {
            *counts.entry(record.message.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
