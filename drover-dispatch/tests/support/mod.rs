//! Shared harness for dispatch engine scenarios

use std::{collections::HashMap, sync::Arc, time::Duration};

use drover_common::{
    Clock, Domain, ManualClock, Message, MessageId, MessageStatus, ProviderConfig, ProviderId,
    Signal,
};
use drover_dispatch::{
    BreakerConfig, CircuitBreaker, DispatchEngine, HealthTracker, LimiterConfig, MemoryAudit,
    PoolConfig, RateLimiter, Router, RoutingSnapshot, RoutingTable, SelectionAudit,
};
use drover_providers::{MockProvider, ProviderClient, ProviderRegistry};
use drover_store::{MemoryMessageStore, MessageStore};
use tokio::sync::broadcast;

pub struct Harness {
    pub engine: Arc<DispatchEngine>,
    pub store: Arc<MemoryMessageStore>,
    pub clock: ManualClock,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<HealthTracker>,
    pub audit: Arc<MemoryAudit>,
    pub mocks: HashMap<String, MockProvider>,
    shutdown: broadcast::Sender<Signal>,
    engine_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct HarnessBuilder {
    mocks: Vec<MockProvider>,
    pools: Vec<PoolConfig>,
    breaker: BreakerConfig,
    limiter: LimiterConfig,
    tune: Box<dyn FnOnce(&mut DispatchEngine)>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            mocks: Vec::new(),
            pools: Vec::new(),
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            tune: Box::new(|_| {}),
        }
    }

    pub fn provider(mut self, mock: MockProvider) -> Self {
        self.mocks.push(mock);
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    #[allow(dead_code)]
    pub fn limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn tune(mut self, tune: impl FnOnce(&mut DispatchEngine) + 'static) -> Self {
        self.tune = Box::new(tune);
        self
    }

    pub fn build(self) -> Harness {
        let clock = ManualClock::midday();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

        let mut engine = DispatchEngine::default();
        engine.workers = 1;
        engine.batch_size = 16;
        engine.poll_interval_secs = 1;
        engine.lease_secs = 60;
        engine.send_timeout_secs = 5;
        engine.intra_batch_concurrency = 1;
        (self.tune)(&mut engine);

        let store = Arc::new(
            MemoryMessageStore::new(Arc::clone(&clock_arc))
                .with_max_retries(engine.retry.max_retries),
        );

        let mocks: HashMap<String, MockProvider> = self
            .mocks
            .iter()
            .map(|mock| (mock.id().to_string(), mock.clone()))
            .collect();

        let provider_configs: Vec<ProviderConfig> =
            self.mocks.iter().map(|mock| mock.config().clone()).collect();
        let registry = ProviderRegistry::from_clients(
            self.mocks
                .into_iter()
                .map(|mock| Arc::new(mock) as Arc<dyn ProviderClient>),
        )
        .expect("registry builds");

        let snapshot = RoutingSnapshot::build(provider_configs, self.pools, registry)
            .expect("snapshot builds");
        let table = Arc::new(RoutingTable::new(snapshot));

        let limiter = Arc::new(RateLimiter::new(self.limiter, Arc::clone(&clock_arc)));
        let breaker = Arc::new(CircuitBreaker::new(self.breaker, Arc::clone(&clock_arc)));
        let health = Arc::new(HealthTracker::new());
        let audit = Arc::new(MemoryAudit::default());

        let router = Arc::new(Router::new(
            table,
            Arc::clone(&limiter),
            Arc::clone(&breaker),
            Arc::clone(&health),
            Arc::clone(&audit) as Arc<dyn SelectionAudit>,
            Arc::clone(&clock_arc),
        ));

        engine
            .init(
                Arc::clone(&store) as Arc<dyn MessageStore>,
                router,
                Arc::clone(&limiter),
                Arc::clone(&breaker),
                clock_arc,
            )
            .expect("engine init");

        let (shutdown, _) = broadcast::channel(8);

        Harness {
            engine: Arc::new(engine),
            store,
            clock,
            limiter,
            breaker,
            health,
            audit,
            mocks,
            shutdown,
            engine_task: None,
        }
    }
}

impl Harness {
    pub fn mock(&self, id: &str) -> &MockProvider {
        &self.mocks[id]
    }

    /// Spawn the engine's serve loop
    pub fn start(&mut self) {
        let engine = Arc::clone(&self.engine);
        let receiver = self.shutdown.subscribe();
        self.engine_task = Some(tokio::spawn(async move {
            engine.serve(receiver).await.expect("engine serves");
        }));
    }

    /// Broadcast shutdown and wait for the engine to drain
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        if let Some(task) = self.engine_task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("engine stops within grace")
                .expect("engine task completes");
        }
    }

    pub async fn enqueue_from(&self, from: &str) -> MessageId {
        let message = Message::new(from, vec!["rcpt@dest.example".to_string()], self.clock.now());
        self.store.enqueue(message).await.expect("enqueue")
    }

    pub async fn status(&self, id: &MessageId) -> MessageStatus {
        self.store.get(id).await.expect("message exists").message.status
    }

    /// Poll until the message reaches the wanted status
    pub async fn wait_for_status(&self, id: &MessageId, wanted: MessageStatus, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status(id).await == wanted {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "message {id} never reached {wanted}, currently {}",
                self.status(id).await
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// A mock provider authoritative for one direct domain
pub fn direct_provider(id: &str, domain: &str, workspace_daily: u64, per_user_daily: u64) -> MockProvider {
    MockProvider::new(id, vec![Domain::new(domain)]).with_config(|config| {
        config.rate_limits.workspace_daily = workspace_daily;
        config.rate_limits.per_user_daily = per_user_daily;
    })
}

/// Shorthand for a provider id
pub fn pid(id: &str) -> ProviderId {
    ProviderId::new(id)
}
