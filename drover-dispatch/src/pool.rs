//! Provider pools and selection strategies
//!
//! A pool spreads mail from shared sender domains across several providers.
//! Candidates arrive already filtered for eligibility (enabled, healthy,
//! breaker-permitting, with limiter headroom); this module only decides
//! which one gets the message, and records every decision.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use drover_common::{
    Domain, ProviderConfig, ProviderId,
    tracing::trace,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a pool picks among its eligible members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Score by remaining capacity, weight, health, and urgency
    CapacityWeighted,
    /// Rotate through members in deterministic order
    RoundRobin,
    /// Lowest current-day used/limit ratio wins
    LeastUsed,
    /// Weighted random by static member weight
    RandomWeighted,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::CapacityWeighted
    }
}

impl SelectionStrategy {
    /// Label recorded in selection audit entries
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CapacityWeighted => "capacity_weighted",
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::RandomWeighted => "random_weighted",
        }
    }
}

/// One provider's membership in a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    pub provider_id: ProviderId,

    /// Relative share of this member within the pool
    #[serde(default = "default_member_weight")]
    pub weight: f64,

    #[serde(default = "default_member_enabled")]
    pub enabled: bool,

    /// Minimum capacity fraction this member needs to stay eligible
    #[serde(default)]
    pub min_capacity: f64,
}

const fn default_member_weight() -> f64 {
    1.0
}

const fn default_member_enabled() -> bool {
    true
}

/// A named set of providers serving shared sender domains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Exact domains or `@domain` suffix patterns
    #[serde(default)]
    pub domain_patterns: Vec<String>,

    #[serde(default)]
    pub strategy: SelectionStrategy,

    #[serde(default = "default_pool_enabled")]
    pub enabled: bool,

    /// Catch-all pool for senders matching no pattern and no direct provider
    #[serde(default)]
    pub is_default: bool,

    /// Minimum capacity fraction for every member, combined with each
    /// member's own threshold
    #[serde(default)]
    pub min_capacity: f64,

    #[serde(default)]
    pub members: Vec<PoolMember>,
}

const fn default_pool_enabled() -> bool {
    true
}

/// A parsed domain pattern: exact, or `@domain` covering subdomains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(Domain),
    Suffix(Domain),
}

impl DomainPattern {
    /// Parse `"x.com"` as exact and `"@x.com"` as a suffix pattern
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        pattern.strip_prefix('@').map_or_else(
            || Self::Exact(Domain::new(pattern)),
            |suffix| Self::Suffix(Domain::new(suffix)),
        )
    }

    /// Whether a sender domain falls under this pattern
    #[must_use]
    pub fn matches(&self, domain: &Domain) -> bool {
        match self {
            Self::Exact(exact) => domain == exact,
            Self::Suffix(suffix) => domain.is_within(suffix),
        }
    }
}

/// An eligibility-filtered pool member, ready for scoring
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderConfig>,
    /// Remaining fraction at the tightest applicable daily limit
    pub capacity: f64,
    /// Provider-level used/limit ratio for the current day
    pub used_ratio: f64,
    /// Health score in [0, 1]
    pub health: f64,
    pub member_weight: f64,
    pub member_min_capacity: f64,
}

/// Composite score for capacity-weighted selection
#[must_use]
pub fn capacity_score(candidate: &Candidate, hours_to_reset: f64) -> f64 {
    let weight_norm = (candidate.member_weight / 10.0).min(1.0);
    let urgency = if hours_to_reset < 2.0 {
        1.0
    } else if hours_to_reset < 6.0 {
        0.8
    } else if hours_to_reset < 12.0 {
        0.5
    } else {
        0.2
    };

    let mut score = 0.4 * candidate.capacity
        + 0.3 * weight_norm
        + 0.2 * candidate.health
        + 0.1 * urgency;

    if candidate.capacity > 0.8 {
        score *= 1.1;
    } else if (0.1..0.2).contains(&candidate.capacity) {
        score *= 0.9;
    }

    score.max(0.001)
}

/// Weighted random pick; index into `weights`
fn weighted_pick(weights: &[f64]) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return None;
    }

    let mut point = rand::rng().random_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if !weight.is_finite() || *weight <= 0.0 {
            continue;
        }
        if point < *weight {
            return Some(index);
        }
        point -= weight;
    }

    // Float underflow fallback: the last positive weight
    weights.iter().rposition(|w| w.is_finite() && *w > 0.0)
}

/// Pool selection state that outlives configuration snapshots
///
/// Round-robin cursors advance atomically and wrap at the candidate count;
/// keeping them here means a reload does not restart every rotation.
#[derive(Debug, Default)]
pub struct PoolSelector {
    cursors: DashMap<String, AtomicUsize>,
}

impl PoolSelector {
    /// Create a selector with no cursor state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a candidate index according to the pool's strategy
    ///
    /// `candidates` must already be in deterministic order (priority, then
    /// weight descending, then id) so round-robin rotation is stable.
    /// Returns the chosen index and its capacity score.
    pub fn select(
        &self,
        pool: &PoolConfig,
        candidates: &[Candidate],
        hours_to_reset: f64,
    ) -> Option<(usize, f64)> {
        if candidates.is_empty() {
            return None;
        }

        match pool.strategy {
            SelectionStrategy::CapacityWeighted => {
                self.select_capacity_weighted(pool, candidates, hours_to_reset)
            }
            SelectionStrategy::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry(pool.id.clone())
                    .or_insert_with(|| AtomicUsize::new(0));
                let index = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some((index, candidates[index].capacity))
            }
            SelectionStrategy::LeastUsed => {
                let index = candidates.iter().enumerate().min_by(|(_, a), (_, b)| {
                    a.used_ratio
                        .total_cmp(&b.used_ratio)
                        .then_with(|| a.provider.priority.cmp(&b.provider.priority))
                })?;
                Some((index.0, index.1.capacity))
            }
            SelectionStrategy::RandomWeighted => {
                let weights: Vec<f64> = candidates.iter().map(|c| c.member_weight).collect();
                let index = weighted_pick(&weights)?;
                Some((index, candidates[index].capacity))
            }
        }
    }

    fn select_capacity_weighted(
        &self,
        pool: &PoolConfig,
        candidates: &[Candidate],
        hours_to_reset: f64,
    ) -> Option<(usize, f64)> {
        let threshold =
            |candidate: &Candidate| pool.min_capacity.max(candidate.member_min_capacity);

        let mut eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.capacity >= threshold(candidate))
            .map(|(index, _)| index)
            .collect();

        // If the minimum-capacity filter empties the set, rerun relaxed
        if eligible.is_empty() {
            trace!(pool = %pool.id, "capacity thresholds emptied candidate set, relaxing");
            eligible = (0..candidates.len()).collect();
        }

        let scores: Vec<f64> = eligible
            .iter()
            .map(|&index| capacity_score(&candidates[index], hours_to_reset))
            .collect();

        let picked = weighted_pick(&scores)?;
        Some((eligible[picked], scores[picked]))
    }
}

/// One append-only audit entry per selection
#[derive(Debug, Clone)]
pub struct SelectionRecord {
    /// Pool involved, if the selection went through one
    pub pool_id: Option<String>,
    pub provider_id: ProviderId,
    pub sender: String,
    pub selected_at: DateTime<Utc>,
    pub success: bool,
    pub capacity_score: f64,
    /// Strategy label, "direct", "hint", or a denial reason
    pub reason: String,
}

/// Sink for selection records
///
/// Implementations must swallow their own failures; recording never blocks
/// dispatch.
pub trait SelectionAudit: Send + Sync + std::fmt::Debug {
    /// Append one record
    fn record(&self, record: SelectionRecord);
}

/// Bounded in-memory audit log
#[derive(Debug)]
pub struct MemoryAudit {
    records: Mutex<Vec<SelectionRecord>>,
    capacity: usize,
}

impl MemoryAudit {
    /// Create a log bounded to `capacity` entries; older entries are dropped
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Snapshot of the recorded entries
    #[must_use]
    pub fn records(&self) -> Vec<SelectionRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryAudit {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl SelectionAudit for MemoryAudit {
    fn record(&self, record: SelectionRecord) {
        let Ok(mut records) = self.records.lock() else {
            // A poisoned audit log must never block dispatch
            return;
        };
        if records.len() >= self.capacity {
            let overflow = records.len() + 1 - self.capacity;
            records.drain(..overflow);
        }
        records.push(record);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use drover_common::provider::{BackendConfig, RateLimits};

    use super::*;

    fn provider(id: &str, priority: u32) -> Arc<ProviderConfig> {
        Arc::new(ProviderConfig {
            id: ProviderId::new(id),
            backend: BackendConfig::Workspace {
                base_url: "mock://".to_string(),
                token: String::new(),
            },
            enabled: true,
            priority,
            weight: 1.0,
            domains: Vec::new(),
            rate_limits: RateLimits::default(),
            header_rewrites: Vec::new(),
        })
    }

    fn candidate(id: &str, capacity: f64, weight: f64) -> Candidate {
        Candidate {
            provider: provider(id, 100),
            capacity,
            used_ratio: 1.0 - capacity,
            health: 1.0,
            member_weight: weight,
            member_min_capacity: 0.0,
        }
    }

    fn pool(strategy: SelectionStrategy) -> PoolConfig {
        PoolConfig {
            id: "inv".to_string(),
            name: "invitations".to_string(),
            domain_patterns: vec!["@invite.com".to_string()],
            strategy,
            enabled: true,
            is_default: false,
            min_capacity: 0.0,
            members: Vec::new(),
        }
    }

    #[test]
    fn test_domain_pattern_exact_and_suffix() {
        let exact = DomainPattern::parse("x.com");
        assert!(exact.matches(&Domain::new("x.com")));
        assert!(!exact.matches(&Domain::new("mail.x.com")));

        let suffix = DomainPattern::parse("@x.com");
        assert!(suffix.matches(&Domain::new("x.com")));
        assert!(suffix.matches(&Domain::new("mail.x.com")));
        assert!(!suffix.matches(&Domain::new("notx.com")));
    }

    #[test]
    fn test_capacity_score_components() {
        let high = candidate("p1", 0.9, 10.0);
        let low = candidate("p2", 0.15, 10.0);

        // High capacity gets the 1.1 boost, low capacity the 0.9 penalty
        let high_score = capacity_score(&high, 20.0);
        let low_score = capacity_score(&low, 20.0);
        assert!(high_score > low_score);

        let expected_high = (0.4 * 0.9 + 0.3 * 1.0 + 0.2 * 1.0 + 0.1 * 0.2) * 1.1;
        assert!((high_score - expected_high).abs() < 1e-9);

        let expected_low = (0.4 * 0.15 + 0.3 * 1.0 + 0.2 * 1.0 + 0.1 * 0.2) * 0.9;
        assert!((low_score - expected_low).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_score_urgency_steps() {
        let c = candidate("p1", 0.5, 1.0);
        let far = capacity_score(&c, 20.0);
        let near = capacity_score(&c, 1.0);
        assert!(near > far, "closer reset must raise urgency");
    }

    #[test]
    fn test_score_floor() {
        let mut c = candidate("p1", 0.0, 0.0);
        c.health = 0.0;
        assert!(capacity_score(&c, 24.0) >= 0.001);
    }

    #[test]
    fn test_capacity_weighted_prefers_headroom() {
        let selector = PoolSelector::new();
        let pool = pool(SelectionStrategy::CapacityWeighted);
        let candidates = vec![candidate("p1", 0.8, 2.0), candidate("p2", 0.1, 1.0)];

        let mut first = 0;
        for _ in 0..1000 {
            let (index, _) = selector.select(&pool, &candidates, 12.0).unwrap();
            if index == 0 {
                first += 1;
            }
        }

        // p1 should dominate clearly; exact split depends on the score ratio
        assert!(first > 550, "p1 won only {first}/1000 selections");
    }

    #[test]
    fn test_min_capacity_filter_and_relaxation() {
        let selector = PoolSelector::new();
        let mut pool = pool(SelectionStrategy::CapacityWeighted);
        pool.min_capacity = 0.5;

        let candidates = vec![candidate("p1", 0.7, 1.0), candidate("p2", 0.2, 1.0)];
        for _ in 0..100 {
            let (index, _) = selector.select(&pool, &candidates, 12.0).unwrap();
            assert_eq!(index, 0, "below-threshold candidate must not be picked");
        }

        // Every candidate below threshold: the filter relaxes instead of failing
        let starved = vec![candidate("p1", 0.1, 1.0), candidate("p2", 0.05, 1.0)];
        assert!(selector.select(&pool, &starved, 12.0).is_some());
    }

    #[test]
    fn test_round_robin_wraps() {
        let selector = PoolSelector::new();
        let pool = pool(SelectionStrategy::RoundRobin);
        let candidates = vec![
            candidate("p1", 0.5, 1.0),
            candidate("p2", 0.5, 1.0),
            candidate("p3", 0.5, 1.0),
        ];

        let picks: Vec<usize> = (0..6)
            .map(|_| selector.select(&pool, &candidates, 12.0).unwrap().0)
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_used_ties_break_by_priority() {
        let selector = PoolSelector::new();
        let pool = pool(SelectionStrategy::LeastUsed);

        let mut a = candidate("p1", 0.5, 1.0);
        a.provider = provider("p1", 200);
        let mut b = candidate("p2", 0.5, 1.0);
        b.provider = provider("p2", 100);

        let (index, _) = selector.select(&pool, &[a, b], 12.0).unwrap();
        assert_eq!(index, 1, "equal usage ties break toward lower priority");
    }

    #[test]
    fn test_least_used_picks_lowest_ratio() {
        let selector = PoolSelector::new();
        let pool = pool(SelectionStrategy::LeastUsed);
        let candidates = vec![candidate("p1", 0.2, 1.0), candidate("p2", 0.9, 1.0)];

        let (index, _) = selector.select(&pool, &candidates, 12.0).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_random_weighted_bias() {
        let selector = PoolSelector::new();
        let pool = pool(SelectionStrategy::RandomWeighted);
        let candidates = vec![candidate("p1", 0.5, 10.0), candidate("p2", 0.5, 1.0)];

        let n = 11_000_u32;
        let mut first = 0_u32;
        for _ in 0..n {
            if selector.select(&pool, &candidates, 12.0).unwrap().0 == 0 {
                first += 1;
            }
        }

        // Expected 10:1 split; allow a generous O(sqrt(N)) band
        let expected = n * 10 / 11;
        assert!(
            first.abs_diff(expected) < 300,
            "expected ~{expected}, got {first}"
        );
    }

    #[test]
    fn test_empty_candidates_select_none() {
        let selector = PoolSelector::new();
        assert!(
            selector
                .select(&pool(SelectionStrategy::CapacityWeighted), &[], 12.0)
                .is_none()
        );
    }

    #[test]
    fn test_pool_config_from_ron() {
        let pool: PoolConfig = ron::from_str(
            r#"(
                id: "inv",
                domain_patterns: ["@invite.com", "exact.com"],
                strategy: least_used,
                min_capacity: 0.1,
                members: [
                    (provider_id: "p1", weight: 2.0),
                    (provider_id: "p2", enabled: false),
                ],
            )"#,
        )
        .unwrap();

        assert_eq!(pool.strategy, SelectionStrategy::LeastUsed);
        assert!(pool.enabled);
        assert!(!pool.is_default);
        assert_eq!(pool.members.len(), 2);
        assert!((pool.members[0].weight - 2.0).abs() < f64::EPSILON);
        assert!(!pool.members[1].enabled);
        assert!((pool.members[1].weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_memory_audit_bounded() {
        let audit = MemoryAudit::new(2);
        for i in 0..5 {
            audit.record(SelectionRecord {
                pool_id: None,
                provider_id: ProviderId::new("p1"),
                sender: format!("s{i}@x.com"),
                selected_at: Utc::now(),
                success: true,
                capacity_score: 1.0,
                reason: "direct".to_string(),
            });
        }

        let records = audit.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sender, "s4@x.com");
    }
}
