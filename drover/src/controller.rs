//! Top-level controller: wires the store, providers, and dispatch engine
//! from configuration and runs them until a shutdown signal.

use std::{path::PathBuf, sync::Arc, sync::LazyLock, time::Duration};

use drover_common::{
    Clock, Signal, SystemClock, internal, logging,
    tracing::{error, info, warn},
};
use drover_dispatch::{
    BreakerConfig, CircuitBreaker, DispatchEngine, HealthTracker, LimiterConfig, MemoryAudit,
    PoolConfig, RateLimiter, Router, RoutingSnapshot, RoutingTable,
};
use drover_providers::ProviderRegistry;
use drover_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

const fn default_probe_interval_secs() -> u64 {
    60
}

const fn default_reload_interval_secs() -> u64 {
    300
}

/// The relay, as described by its configuration file
#[derive(Debug, Default, Deserialize)]
pub struct Drover {
    #[serde(default)]
    store: StoreConfig,

    #[serde(default)]
    providers: Vec<drover_common::ProviderConfig>,

    #[serde(default)]
    pools: Vec<PoolConfig>,

    #[serde(default)]
    limiter: LimiterConfig,

    #[serde(default)]
    breaker: BreakerConfig,

    #[serde(default, alias = "engine")]
    dispatch: DispatchEngine,

    /// How often provider health probes run (seconds)
    #[serde(default = "default_probe_interval_secs")]
    probe_interval_secs: u64,

    /// How often the provider/pool tables reload from disk (seconds); 0 disables
    #[serde(default = "default_reload_interval_secs")]
    reload_interval_secs: u64,

    #[serde(skip)]
    config_path: Option<PathBuf>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate signal received, shutting down");
        }
    }

    Ok(())
}

impl Drover {
    /// Remember where the configuration came from, enabling periodic reload
    #[must_use]
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Run the relay until shutdown
    ///
    /// # Errors
    /// If any component fails to initialize, or the engine dies
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let send_timeout = Duration::from_secs(self.dispatch.send_timeout_secs);

        let store = self
            .store
            .clone()
            .into_store(Arc::clone(&clock), self.dispatch.retry.max_retries)
            .await?;

        let registry = ProviderRegistry::build(&self.providers, send_timeout)?;
        let snapshot =
            RoutingSnapshot::build(self.providers.clone(), self.pools.clone(), registry)?;
        let table = Arc::new(RoutingTable::new(snapshot));

        let limiter = Arc::new(RateLimiter::new(self.limiter.clone(), Arc::clone(&clock)));
        let breaker = Arc::new(CircuitBreaker::new(self.breaker.clone(), Arc::clone(&clock)));
        let health = Arc::new(HealthTracker::new());
        let audit = Arc::new(MemoryAudit::default());

        let router = Arc::new(Router::new(
            Arc::clone(&table),
            Arc::clone(&limiter),
            Arc::clone(&breaker),
            Arc::clone(&health),
            audit,
            Arc::clone(&clock),
        ));

        self.dispatch
            .init(store, router, limiter, breaker, Arc::clone(&clock))?;
        let engine = Arc::new(self.dispatch);

        let mut engine_task =
            tokio::spawn(Arc::clone(&engine).serve(SHUTDOWN_BROADCAST.subscribe()));

        let probe_task = tokio::spawn(probe_loop(
            Arc::clone(&table),
            Arc::clone(&health),
            Arc::clone(&clock),
            self.probe_interval_secs,
            SHUTDOWN_BROADCAST.subscribe(),
        ));

        let reload_task = tokio::spawn(reload_loop(
            self.config_path.clone(),
            Arc::clone(&table),
            send_timeout,
            self.reload_interval_secs,
            SHUTDOWN_BROADCAST.subscribe(),
        ));

        let ret = tokio::select! {
            r = &mut engine_task => {
                // The engine never exits on its own unless something broke
                error!("Dispatch engine exited unexpectedly");
                return Ok(r??);
            }
            r = shutdown_signal() => r,
        };

        internal!("Shutting down...");
        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        // The engine drains in-flight messages within its grace period
        engine_task.await??;
        probe_task.abort();
        reload_task.abort();

        ret
    }
}

/// Drive provider health probes and feed the tracker
async fn probe_loop(
    table: Arc<RoutingTable>,
    health: Arc<HealthTracker>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let mut timer = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    timer.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let snapshot = table.load();
                for (id, registered) in snapshot.registry().iter() {
                    match registered.client.health_probe().await {
                        Ok(()) => health.record_probe(id, clock.now(), Ok(())),
                        Err(e) => {
                            let detail = e.to_string();
                            health.record_probe(id, clock.now(), Err(detail.as_str()));
                        }
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Periodically re-read providers and pools, installing a fresh snapshot
///
/// A broken configuration file logs and keeps the previous snapshot;
/// in-flight messages always complete against the snapshot they were
/// routed with.
async fn reload_loop(
    config_path: Option<PathBuf>,
    table: Arc<RoutingTable>,
    send_timeout: Duration,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    let Some(path) = config_path else {
        let _ = shutdown.recv().await;
        return;
    };
    if interval_secs == 0 {
        let _ = shutdown.recv().await;
        return;
    }

    let mut timer = tokio::time::interval(Duration::from_secs(interval_secs));
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match reload_snapshot(&path, send_timeout) {
                    Ok(snapshot) => {
                        table.install(snapshot);
                        info!(path = %path.display(), "configuration reloaded");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "configuration reload failed, keeping previous snapshot");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn reload_snapshot(path: &std::path::Path, send_timeout: Duration) -> anyhow::Result<RoutingSnapshot> {
    let content = std::fs::read_to_string(path)?;
    let config: Drover = ron::from_str(&content)?;
    let registry = ProviderRegistry::build(&config.providers, send_timeout)?;
    Ok(RoutingSnapshot::build(
        config.providers,
        config.pools,
        registry,
    )?)
}
