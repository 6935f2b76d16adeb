//! Store backend selection
//!
//! Lets the relay configuration pick the backing implementation at runtime:
//!
//! ```ron
//! store: File(path: "/var/spool/drover"),
//! ```
//!
//! or, for tests and transient deployments:
//!
//! ```ron
//! store: Memory(capacity: Some(10000)),
//! ```

use std::{path::PathBuf, sync::Arc};

use drover_common::Clock;
use serde::Deserialize;

use crate::{
    backends::{FileMessageStore, MemoryMessageStore},
    store::MessageStore,
};

/// Configuration for the message store backend
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// File-backed store (production)
    File { path: PathBuf },
    /// Memory-backed store (testing/development)
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/spool/drover"),
        }
    }
}

impl StoreConfig {
    /// Build the configured backend
    ///
    /// # Errors
    /// If a file-backed store cannot be opened or recovered
    pub async fn into_store(
        self,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> crate::Result<Arc<dyn MessageStore>> {
        match self {
            Self::File { path } => {
                let store = FileMessageStore::open(path, clock, max_retries).await?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => {
                let mut store = MemoryMessageStore::new(clock).with_max_retries(max_retries);
                if let Some(capacity) = capacity {
                    store = store.with_capacity(capacity);
                }
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use drover_common::ManualClock;

    use super::*;

    #[tokio::test]
    async fn test_memory_config_builds() {
        let config = StoreConfig::Memory { capacity: Some(10) };
        let store = config
            .into_store(Arc::new(ManualClock::midday()), 5)
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_config_builds() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::File {
            path: dir.path().join("queue"),
        };
        let store = config
            .into_store(Arc::new(ManualClock::midday()), 5)
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
