//! Sender-to-provider resolution
//!
//! The router resolves a message's sender to a provider: first the message's
//! own provider hint, then pool-based selection for pool-routed domains,
//! then the direct domain map, and finally the default pool as catch-all.
//! Every candidate passes the same eligibility gauntlet: enabled, healthy,
//! breaker-permitting, and with limiter headroom at every level.
//!
//! Configuration lives in an immutable [`RoutingSnapshot`] behind a
//! [`RoutingTable`]; reloads install a fresh snapshot atomically, and
//! in-flight routing keeps the `Arc` it loaded.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use drover_common::{
    Clock, Domain, Message, ProviderConfig, ProviderId, SenderAddress,
    address::AddressError,
    tracing::debug,
};
use drover_providers::registry::{ProviderRegistry, RegisteredProvider};
use thiserror::Error;

use crate::{
    breaker::CircuitBreaker,
    health::HealthTracker,
    limiter::RateLimiter,
    pool::{Candidate, DomainPattern, PoolConfig, PoolSelector, SelectionAudit, SelectionRecord},
};

/// Routing failures surfaced to the dispatch engine.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The sender address could not be parsed.
    #[error("invalid sender address: {0}")]
    InvalidSender(#[from] AddressError),

    /// No enabled, healthy, non-broken provider with headroom was found.
    #[error("no eligible provider for sender {sender}")]
    NoEligibleProvider {
        sender: String,
        /// Whether the shortage was (at least partly) rate-limit headroom
        rate_limited: bool,
    },

    /// Snapshot construction failed.
    #[error("invalid routing configuration: {0}")]
    InvalidConfiguration(String),
}

/// An immutable view of providers, pools, and their adapters
#[derive(Debug)]
pub struct RoutingSnapshot {
    providers: HashMap<ProviderId, Arc<ProviderConfig>>,
    registry: ProviderRegistry,
    direct: HashMap<Domain, Vec<ProviderId>>,
    pools: Vec<Arc<PoolConfig>>,
    pool_index: Vec<(DomainPattern, usize)>,
    default_pool: Option<usize>,
}

impl RoutingSnapshot {
    /// Build a snapshot, validating provider uniqueness and the
    /// single-default-pool invariant
    ///
    /// # Errors
    /// On duplicate provider ids or more than one default pool
    pub fn build(
        provider_configs: Vec<ProviderConfig>,
        pool_configs: Vec<PoolConfig>,
        registry: ProviderRegistry,
    ) -> Result<Self, RouteError> {
        let mut providers = HashMap::with_capacity(provider_configs.len());
        let mut direct: HashMap<Domain, Vec<ProviderId>> = HashMap::new();

        for config in provider_configs {
            let id = config.id.clone();
            for domain in &config.domains {
                direct.entry(domain.clone()).or_default().push(id.clone());
            }
            if providers.insert(id.clone(), Arc::new(config)).is_some() {
                return Err(RouteError::InvalidConfiguration(format!(
                    "duplicate provider id: {id}"
                )));
            }
        }

        let mut pools = Vec::with_capacity(pool_configs.len());
        let mut pool_index = Vec::new();
        let mut default_pool = None;

        for config in pool_configs {
            let index = pools.len();
            if config.is_default {
                if let Some(existing) = default_pool {
                    let existing: &Arc<PoolConfig> = &pools[existing];
                    return Err(RouteError::InvalidConfiguration(format!(
                        "multiple pools marked default: {} and {}",
                        existing.id, config.id
                    )));
                }
                default_pool = Some(index);
            }
            for pattern in &config.domain_patterns {
                pool_index.push((DomainPattern::parse(pattern), index));
            }
            pools.push(Arc::new(config));
        }

        Ok(Self {
            providers,
            registry,
            direct,
            pools,
            pool_index,
            default_pool,
        })
    }

    /// Provider configuration by id
    #[must_use]
    pub fn provider(&self, id: &ProviderId) -> Option<&Arc<ProviderConfig>> {
        self.providers.get(id)
    }

    /// Adapter (with compiled rewrites) by id
    #[must_use]
    pub fn registered(&self, id: &ProviderId) -> Option<&RegisteredProvider> {
        self.registry.get(id)
    }

    /// The adapter registry of this snapshot
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// All providers in this snapshot
    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.values()
    }

    /// Enabled pools whose patterns cover the domain, in configuration order
    fn pools_for_domain(&self, domain: &Domain) -> Vec<usize> {
        let mut matched: Vec<usize> = self
            .pool_index
            .iter()
            .filter(|(pattern, _)| pattern.matches(domain))
            .map(|(_, index)| *index)
            .filter(|&index| self.pools[index].enabled)
            .collect();
        matched.sort_unstable();
        matched.dedup();
        matched
    }

    fn direct_for_domain(&self, domain: &Domain) -> &[ProviderId] {
        self.direct.get(domain).map_or(&[], Vec::as_slice)
    }
}

/// Atomically swappable snapshot holder
#[derive(Debug)]
pub struct RoutingTable {
    inner: parking_lot::RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingTable {
    /// Create a table serving the given snapshot
    #[must_use]
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            inner: parking_lot::RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The current snapshot; callers keep the `Arc` for their whole dispatch
    #[must_use]
    pub fn load(&self) -> Arc<RoutingSnapshot> {
        self.inner.read().clone()
    }

    /// Install a fresh snapshot; readers never observe a torn view
    pub fn install(&self, snapshot: RoutingSnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }
}

/// A routed provider, ready for the send step
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: Arc<ProviderConfig>,
    pub registered: RegisteredProvider,
}

/// Resolves senders to providers against the current snapshot
#[derive(Debug)]
pub struct Router {
    table: Arc<RoutingTable>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthTracker>,
    selector: PoolSelector,
    audit: Arc<dyn SelectionAudit>,
    clock: Arc<dyn Clock>,
}

impl Router {
    /// Create a router over shared reliability state
    #[must_use]
    pub fn new(
        table: Arc<RoutingTable>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthTracker>,
        audit: Arc<dyn SelectionAudit>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table,
            limiter,
            breaker,
            health,
            selector: PoolSelector::new(),
            audit,
            clock,
        }
    }

    /// Resolve a provider for the message's sender
    ///
    /// `exclude` carries providers already tried in this dispatch attempt;
    /// failover never reuses one.
    ///
    /// # Errors
    /// [`RouteError::NoEligibleProvider`] when the gauntlet leaves nobody,
    /// with `rate_limited` set when headroom was the (or a) reason.
    pub fn route(
        &self,
        message: &Message,
        exclude: &HashSet<ProviderId>,
    ) -> Result<Route, RouteError> {
        let sender = SenderAddress::parse(&message.from)?;
        let snapshot = self.table.load();
        let sender_str = sender.to_string();
        let mut rate_limited = false;

        // 1. Provider hint, when it names an eligible provider
        if let Some(hint) = &message.provider_hint
            && let Some(provider) = snapshot.provider(hint)
            && let Some(candidate) =
                self.eligible(&snapshot, provider, &sender_str, exclude, &mut rate_limited)
            && self.breaker.allow(hint)
            && let Some(route) = self.finalize(&snapshot, candidate, None, &sender_str, "hint")
        {
            return Ok(route);
        }

        // 2. Pool-routed domains
        for pool_index in snapshot.pools_for_domain(sender.domain()) {
            let pool = &snapshot.pools[pool_index];
            if let Some(route) =
                self.select_from_pool(&snapshot, pool, &sender_str, exclude, &mut rate_limited)
            {
                return Ok(route);
            }
        }

        // 3. Direct domain map
        let mut direct: Vec<Candidate> = snapshot
            .direct_for_domain(sender.domain())
            .iter()
            .filter_map(|id| snapshot.provider(id))
            .filter_map(|provider| {
                self.eligible(&snapshot, provider, &sender_str, exclude, &mut rate_limited)
            })
            .collect();
        sort_candidates(&mut direct);

        for candidate in direct {
            if self.breaker.allow(&candidate.provider.id)
                && let Some(route) = self.finalize(&snapshot, candidate, None, &sender_str, "direct")
            {
                return Ok(route);
            }
        }

        // 4. Default pool as catch-all, only when nothing else covered the
        // domain at all
        if snapshot.pools_for_domain(sender.domain()).is_empty()
            && snapshot.direct_for_domain(sender.domain()).is_empty()
            && let Some(default_index) = snapshot.default_pool
        {
            let pool = &snapshot.pools[default_index];
            if pool.enabled
                && let Some(route) =
                    self.select_from_pool(&snapshot, pool, &sender_str, exclude, &mut rate_limited)
            {
                return Ok(route);
            }
        }

        debug!(sender = %sender_str, rate_limited, "no eligible provider");
        Err(RouteError::NoEligibleProvider {
            sender: sender_str,
            rate_limited,
        })
    }

    /// Run the eligibility gauntlet for one provider
    fn eligible(
        &self,
        snapshot: &RoutingSnapshot,
        provider: &Arc<ProviderConfig>,
        sender: &str,
        exclude: &HashSet<ProviderId>,
        rate_limited: &mut bool,
    ) -> Option<Candidate> {
        let id = &provider.id;
        if !provider.routable() || exclude.contains(id) || snapshot.registered(id).is_none() {
            return None;
        }

        let health = self.health.score(id)?;

        if !self.breaker.would_allow(id) {
            return None;
        }

        let status = self.limiter.status(&provider.rate_limits, id, sender);
        if !status.admitted {
            *rate_limited = true;
            return None;
        }

        let provider_frac = fraction(status.provider_remaining, provider.rate_limits.workspace_daily);
        let sender_frac = fraction(
            status.sender_remaining,
            provider.rate_limits.sender_daily(sender),
        );

        Some(Candidate {
            provider: Arc::clone(provider),
            capacity: provider_frac.min(sender_frac),
            used_ratio: 1.0 - provider_frac,
            health,
            member_weight: provider.weight,
            member_min_capacity: 0.0,
        })
    }

    fn select_from_pool(
        &self,
        snapshot: &Arc<RoutingSnapshot>,
        pool: &Arc<PoolConfig>,
        sender: &str,
        exclude: &HashSet<ProviderId>,
        rate_limited: &mut bool,
    ) -> Option<Route> {
        let mut candidates: Vec<Candidate> = pool
            .members
            .iter()
            .filter(|member| member.enabled)
            .filter_map(|member| {
                let provider = snapshot.provider(&member.provider_id)?;
                let mut candidate =
                    self.eligible(snapshot, provider, sender, exclude, rate_limited)?;
                candidate.member_weight = member.weight;
                candidate.member_min_capacity = member.min_capacity;
                Some(candidate)
            })
            .collect();
        sort_candidates(&mut candidates);

        let hours_to_reset = self.hours_to_reset();

        // Selection may race the breaker; drop the pick and rerun rather
        // than hand out a provider the breaker rejects
        while !candidates.is_empty() {
            let (index, score) = self.selector.select(pool, &candidates, hours_to_reset)?;
            let candidate = candidates.swap_remove(index);

            if self.breaker.allow(&candidate.provider.id) {
                return self.finalize(
                    snapshot,
                    candidate,
                    Some(pool.id.clone()),
                    sender,
                    pool.strategy.label(),
                );
            }

            self.audit.record(SelectionRecord {
                pool_id: Some(pool.id.clone()),
                provider_id: candidate.provider.id.clone(),
                sender: sender.to_string(),
                selected_at: self.clock.now(),
                success: false,
                capacity_score: score,
                reason: "breaker_rejected".to_string(),
            });
        }

        None
    }

    /// Record the selection and assemble the route; `None` only if the
    /// snapshot lost the adapter between eligibility and here
    fn finalize(
        &self,
        snapshot: &Arc<RoutingSnapshot>,
        candidate: Candidate,
        pool_id: Option<String>,
        sender: &str,
        reason: &str,
    ) -> Option<Route> {
        let registered = snapshot.registered(&candidate.provider.id).cloned()?;

        self.audit.record(SelectionRecord {
            pool_id,
            provider_id: candidate.provider.id.clone(),
            sender: sender.to_string(),
            selected_at: self.clock.now(),
            success: true,
            capacity_score: candidate.capacity,
            reason: reason.to_string(),
        });

        Some(Route {
            provider: candidate.provider,
            registered,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn hours_to_reset(&self) -> f64 {
        let now = self.clock.now();
        let resets_at = self.clock.next_midnight();
        (resets_at - now).num_seconds().max(0) as f64 / 3600.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(remaining: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        remaining as f64 / limit as f64
    }
}

/// Deterministic candidate ordering: priority ascending, weight descending,
/// id lexicographic
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.provider
            .priority
            .cmp(&b.provider.priority)
            .then_with(|| b.member_weight.total_cmp(&a.member_weight))
            .then_with(|| a.provider.id.cmp(&b.provider.id))
    });
}
