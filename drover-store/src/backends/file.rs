//! File-backed message store
//!
//! One bincode record per message, named `<ulid>.msg`, under a single store
//! directory. Claim atomicity comes from the in-process index (a
//! [`MemoryMessageStore`]); the files are a write-through so queue state
//! survives restarts. Records are written to a temp name and renamed so a
//! crash mid-write never leaves a truncated record behind.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_common::{Clock, Message, MessageId, MessageStatus, internal};

use crate::{
    SerializationError, StoreError,
    backends::memory::MemoryMessageStore,
    record::StoredMessage,
    store::{DeferKind, DeferOutcome, MessageStore},
};

/// Durable implementation of [`MessageStore`]
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    index: MemoryMessageStore,
    path: PathBuf,
}

impl FileMessageStore {
    /// Open (or create) a store directory and load any existing records
    ///
    /// Messages found in Processing are left as-is: their leases will lapse
    /// and the normal claim path recovers them.
    ///
    /// # Errors
    /// If the directory cannot be created or a record cannot be decoded
    pub async fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> crate::Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path).await?;

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_dir() {
            return Err(StoreError::Validation(format!(
                "store path is not a directory: {}",
                path.display()
            )));
        }

        let store = Self {
            index: MemoryMessageStore::new(clock).with_max_retries(max_retries),
            path,
        };
        let recovered = store.load().await?;
        if recovered > 0 {
            internal!("Recovered {recovered} messages from {}", store.path.display());
        }

        Ok(store)
    }

    /// Load every record file into the index
    async fn load(&self) -> crate::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut recovered = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(MessageId::from_filename) else {
                continue;
            };

            let bytes = tokio::fs::read(entry.path()).await?;
            let (record, _): (StoredMessage, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(SerializationError::from)?;

            if record.message.id != id {
                return Err(SerializationError::Corrupted(format!(
                    "record {} holds message id {}",
                    id, record.message.id
                ))
                .into());
            }

            let mut records = self.index.records.write()?;
            records.insert(id, record);
            recovered += 1;
        }

        Ok(recovered)
    }

    fn record_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{id}.msg"))
    }

    /// Write-through a record, atomically via rename
    async fn persist(&self, id: &MessageId) -> crate::Result<()> {
        let record = self.index.get(id).await?;
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(SerializationError::from)?;

        let final_path = self.record_path(id);
        let tmp_path = self.path.join(format!("{id}.msg.tmp"));
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(())
    }

    async fn remove_file(&self, id: &MessageId) -> crate::Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The store directory
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn enqueue(&self, message: Message) -> crate::Result<MessageId> {
        let id = self.index.enqueue(message).await?;
        self.persist(&id).await?;
        Ok(id)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> crate::Result<Vec<Message>> {
        let claimed = self.index.claim_batch(worker_id, max_n, lease).await?;
        for msg in &claimed {
            self.persist(&msg.id).await?;
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: &MessageId,
        provider_message_id: Option<String>,
    ) -> crate::Result<()> {
        self.index.mark_sent(id, provider_message_id).await?;
        self.persist(id).await
    }

    async fn mark_failed(&self, id: &MessageId, error: &str) -> crate::Result<()> {
        self.index.mark_failed(id, error).await?;
        self.persist(id).await
    }

    async fn mark_deferred(
        &self,
        id: &MessageId,
        error: &str,
        next_visible_at: DateTime<Utc>,
        kind: DeferKind,
    ) -> crate::Result<DeferOutcome> {
        let outcome = self
            .index
            .mark_deferred(id, error, next_visible_at, kind)
            .await?;
        self.persist(id).await?;
        Ok(outcome)
    }

    async fn mark_auth_error(&self, id: &MessageId, error: &str) -> crate::Result<()> {
        self.index.mark_auth_error(id, error).await?;
        self.persist(id).await
    }

    async fn reset_auth_error(&self, id: &MessageId) -> crate::Result<()> {
        self.index.reset_auth_error(id).await?;
        self.persist(id).await
    }

    async fn cancel(&self, id: &MessageId) -> crate::Result<()> {
        self.index.cancel(id).await?;
        self.persist(id).await
    }

    async fn purge(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[MessageStatus],
    ) -> crate::Result<usize> {
        let before = self.index.list().await?;
        let removed = self.index.purge(older_than, statuses).await?;

        if removed > 0 {
            let after: std::collections::HashSet<_> =
                self.index.list().await?.into_iter().collect();
            for id in before {
                if !after.contains(&id) {
                    self.remove_file(&id).await?;
                }
            }
        }

        Ok(removed)
    }

    async fn get(&self, id: &MessageId) -> crate::Result<StoredMessage> {
        self.index.get(id).await
    }

    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        self.index.list().await
    }

    async fn counts(&self) -> crate::Result<HashMap<MessageStatus, usize>> {
        self.index.counts().await
    }
}
