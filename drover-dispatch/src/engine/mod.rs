//! Dispatch engine orchestration
//!
//! A fixed-size worker pool claims message batches from the store, routes
//! each message, reserves rate-limit headroom, and drives the provider send,
//! recording the outcome back into the store and the reliability layer.

pub mod dispatch;
pub mod worker;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use drover_common::{Clock, MessageStatus, Signal, internal, tracing};
use drover_store::MessageStore;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};

use crate::{
    breaker::CircuitBreaker, error::DispatchError, limiter::RateLimiter, retry::RetryPolicy,
    router::Router,
};

const fn default_workers() -> usize {
    4
}

const fn default_batch_size() -> usize {
    16
}

const fn default_lease_secs() -> u64 {
    300
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_intra_batch_concurrency() -> usize {
    8
}

const fn default_send_timeout_secs() -> u64 {
    30
}

const fn default_min_defer_secs() -> u64 {
    60
}

const fn default_max_failover_attempts() -> u32 {
    2
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

const fn default_purge_interval_secs() -> u64 {
    3600
}

const fn default_purge_retain_secs() -> u64 {
    7 * 86400
}

/// Runtime collaborators, wired up in `init()`
#[derive(Debug, Clone)]
pub(crate) struct EngineRuntime {
    pub store: Arc<dyn MessageStore>,
    pub router: Arc<Router>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: Arc<dyn Clock>,
}

/// Store counts plus engine flags, for the operational read-through
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub counts: HashMap<MessageStatus, usize>,
    pub maintenance: bool,
}

/// The relay's dispatch engine
#[derive(Debug, Deserialize)]
pub struct DispatchEngine {
    /// Number of claim workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Messages claimed per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Exclusive claim duration; expiry returns a message to the queue
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Idle sleep between empty polls (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Concurrent sends within one claimed batch
    #[serde(default = "default_intra_batch_concurrency")]
    pub intra_batch_concurrency: usize,

    /// Deadline for a single provider call (seconds); expiry is transient
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Floor for rate-limit deferral delays (seconds)
    #[serde(default = "default_min_defer_secs")]
    pub min_defer_secs: u64,

    /// Alternate providers tried after a transient failure, per message
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,

    /// Drain window for in-flight messages at shutdown (seconds)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// How often terminal rows are purged (seconds)
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Age at which terminal rows are purged (seconds)
    #[serde(default = "default_purge_retain_secs")]
    pub purge_retain_secs: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Runtime collaborators (initialized in `init()`)
    #[serde(skip)]
    pub(crate) runtime: Option<EngineRuntime>,

    /// While set, workers stop claiming new batches
    #[serde(skip)]
    maintenance: Arc<AtomicBool>,
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            intra_batch_concurrency: default_intra_batch_concurrency(),
            send_timeout_secs: default_send_timeout_secs(),
            min_defer_secs: default_min_defer_secs(),
            max_failover_attempts: default_max_failover_attempts(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            purge_retain_secs: default_purge_retain_secs(),
            retry: RetryPolicy::default(),
            runtime: None,
            maintenance: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DispatchEngine {
    /// Wire up the runtime collaborators
    ///
    /// # Errors
    /// If called with zero workers or batch size
    pub fn init(
        &mut self,
        store: Arc<dyn MessageStore>,
        router: Arc<Router>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Result<(), DispatchError> {
        if self.workers == 0 || self.batch_size == 0 || self.intra_batch_concurrency == 0 {
            return Err(DispatchError::Configuration(
                "workers, batch_size, and intra_batch_concurrency must be positive".to_string(),
            ));
        }

        internal!(
            "Initialising dispatch engine ({} workers, batch {}, lease {}s)",
            self.workers,
            self.batch_size,
            self.lease_secs
        );

        self.runtime = Some(EngineRuntime {
            store,
            router,
            limiter,
            breaker,
            clock,
        });

        Ok(())
    }

    pub(crate) fn runtime(&self) -> Result<&EngineRuntime, DispatchError> {
        self.runtime.as_ref().ok_or_else(|| {
            DispatchError::NotInitialized("dispatch engine not initialized, call init() first".to_string())
        })
    }

    /// Flip maintenance mode; workers stop claiming while it is set
    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
        internal!(level = INFO, "maintenance mode: {on}");
    }

    /// Whether maintenance mode is set
    pub fn maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Store counts plus engine flags
    ///
    /// # Errors
    /// If the engine is uninitialized or the store read fails
    pub async fn stats(&self) -> Result<EngineStats, DispatchError> {
        let runtime = self.runtime()?;
        Ok(EngineStats {
            counts: runtime.store.counts().await?,
            maintenance: self.maintenance(),
        })
    }

    /// Run workers and the purge timer until shutdown
    ///
    /// On shutdown, workers refuse new batches and drain in-flight messages
    /// within the grace period; stragglers are abandoned to lease recovery.
    ///
    /// # Errors
    /// If the engine is uninitialized
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        let runtime = self.runtime()?.clone();
        internal!("Dispatch engine starting");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = tokio::task::JoinSet::new();
        for index in 0..self.workers {
            let engine = Arc::clone(&self);
            let worker_id = format!("worker-{index}");
            let stop = stop_rx.clone();
            workers.spawn(worker::run(engine, worker_id, stop));
        }

        let mut purge_timer =
            tokio::time::interval(Duration::from_secs(self.purge_interval_secs.max(1)));
        purge_timer.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = purge_timer.tick() => {
                    self.purge_terminal(&runtime).await;
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch engine received shutdown signal");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Dispatch engine shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        // Stop claiming, then drain in-flight work within the grace window
        let _ = stop_tx.send(true);
        let grace = Duration::from_secs(self.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                grace_secs = self.shutdown_grace_secs,
                "shutdown grace exceeded, abandoning in-flight messages to lease recovery"
            );
            workers.abort_all();
        }

        internal!("Dispatch engine shutdown complete");
        Ok(())
    }

    async fn purge_terminal(&self, runtime: &EngineRuntime) {
        let retain = i64::try_from(self.purge_retain_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        let cutoff = runtime
            .clock
            .now()
            .checked_sub_signed(chrono::TimeDelta::seconds(retain))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        match runtime
            .store
            .purge(cutoff, &[MessageStatus::Sent, MessageStatus::Failed])
            .await
        {
            Ok(0) => tracing::debug!("purge found nothing to remove"),
            Ok(removed) => tracing::info!(removed, "purged terminal messages"),
            Err(e) => tracing::error!("purge failed: {e}"),
        }
    }
}
