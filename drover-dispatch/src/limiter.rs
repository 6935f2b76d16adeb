//! Hierarchical daily rate limiting
//!
//! Three levels of UTC-day counters, evaluated in order: an optional global
//! ceiling, the provider's workspace budget, and the per-sender budget (with
//! per-sender overrides). The first level without headroom denies admission.
//!
//! Counters are sharded by provider behind a `DashMap`; the global counter
//! sits under its own mutex, always taken first, which makes
//! `check_and_reserve` atomic across every scope it touches. A stale day
//! bucket observed by any operation resets to zero before the operation
//! applies, so nothing special happens at midnight.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use drover_common::{
    Clock, ProviderId, RateLimits,
    tracing::debug,
};
use serde::{Deserialize, Serialize};

/// Configuration for the rate limiter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Optional soft system ceiling across every provider, per UTC day
    #[serde(default)]
    pub global_daily: Option<u64>,
}

/// Which level denied admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitScope {
    Global,
    Provider,
    Sender,
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// The first level that denied, when not admitted
    pub limiting_scope: Option<LimitScope>,
    /// Remaining global headroom, `None` when no global ceiling is set
    pub global_remaining: Option<u64>,
    pub provider_remaining: u64,
    pub sender_remaining: u64,
    /// When every counter rolls to zero
    pub resets_at: DateTime<Utc>,
}

impl Decision {
    /// Remaining headroom at the tightest applicable level
    #[must_use]
    pub fn effective_remaining(&self) -> u64 {
        let bound = self.provider_remaining.min(self.sender_remaining);
        self.global_remaining.map_or(bound, |g| g.min(bound))
    }
}

#[derive(Debug)]
struct GlobalCounter {
    day: NaiveDate,
    used: u64,
}

#[derive(Debug)]
struct ProviderCounters {
    day: NaiveDate,
    used: u64,
    senders: AHashMap<String, u64>,
}

impl ProviderCounters {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            used: 0,
            senders: AHashMap::new(),
        }
    }

    /// Reset if the stored bucket is stale
    fn roll(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.used = 0;
            self.senders.clear();
        }
    }

    fn sender_used(&self, sender: &str) -> u64 {
        self.senders.get(sender).copied().unwrap_or(0)
    }
}

/// Hierarchical daily rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    global_daily: Option<u64>,
    clock: Arc<dyn Clock>,
    global: parking_lot::Mutex<GlobalCounter>,
    providers: DashMap<ProviderId, Arc<parking_lot::Mutex<ProviderCounters>>>,
}

impl RateLimiter {
    /// Create a new limiter
    #[must_use]
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today();
        Self {
            global_daily: config.global_daily,
            clock,
            global: parking_lot::Mutex::new(GlobalCounter {
                day: today,
                used: 0,
            }),
            providers: DashMap::new(),
        }
    }

    fn shard(&self, provider: &ProviderId) -> Arc<parking_lot::Mutex<ProviderCounters>> {
        self.providers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(parking_lot::Mutex::new(ProviderCounters::new(
                    self.clock.today(),
                )))
            })
            .clone()
    }

    /// Atomically admit and count one send, or deny leaving counters untouched
    ///
    /// Lock order is global then provider, for every path, which keeps the
    /// reservation linearizable per (provider, scope).
    pub fn check_and_reserve(
        &self,
        limits: &RateLimits,
        provider: &ProviderId,
        sender: &str,
    ) -> Decision {
        let sender = sender.to_ascii_lowercase();
        let today = self.clock.today();
        let resets_at = self.clock.next_midnight();
        let sender_limit = limits.sender_daily(&sender);

        let mut global = self.global.lock();
        if global.day != today {
            global.day = today;
            global.used = 0;
        }

        let shard = self.shard(provider);
        let mut counters = shard.lock();
        counters.roll(today);

        let global_remaining = self.global_daily.map(|g| g.saturating_sub(global.used));
        let provider_remaining = limits.workspace_daily.saturating_sub(counters.used);
        let sender_remaining = sender_limit.saturating_sub(counters.sender_used(&sender));

        let limiting_scope = if global_remaining == Some(0) {
            Some(LimitScope::Global)
        } else if provider_remaining == 0 {
            Some(LimitScope::Provider)
        } else if sender_remaining == 0 {
            Some(LimitScope::Sender)
        } else {
            None
        };

        if let Some(scope) = limiting_scope {
            debug!(
                provider = %provider,
                sender = %sender,
                scope = ?scope,
                "rate limit denied admission"
            );
            return Decision {
                admitted: false,
                limiting_scope: Some(scope),
                global_remaining,
                provider_remaining,
                sender_remaining,
                resets_at,
            };
        }

        global.used += 1;
        counters.used += 1;
        *counters.senders.entry(sender).or_insert(0) += 1;

        Decision {
            admitted: true,
            limiting_scope: None,
            global_remaining: global_remaining.map(|g| g - 1),
            provider_remaining: provider_remaining - 1,
            sender_remaining: sender_remaining - 1,
            resets_at,
        }
    }

    /// Hand back a reservation that will not be used today
    ///
    /// Decrements are saturating so a release that crosses midnight cannot
    /// underflow the fresh bucket.
    pub fn release(&self, provider: &ProviderId, sender: &str) {
        let sender = sender.to_ascii_lowercase();
        let today = self.clock.today();

        let mut global = self.global.lock();
        if global.day == today {
            global.used = global.used.saturating_sub(1);
        }

        let shard = self.shard(provider);
        let mut counters = shard.lock();
        if counters.day == today {
            counters.used = counters.used.saturating_sub(1);
            if let Some(used) = counters.senders.get_mut(&sender) {
                *used = used.saturating_sub(1);
            }
        }
    }

    /// Non-mutating headroom view for capacity scoring
    pub fn status(&self, limits: &RateLimits, provider: &ProviderId, sender: &str) -> Decision {
        let sender = sender.to_ascii_lowercase();
        let today = self.clock.today();
        let resets_at = self.clock.next_midnight();
        let sender_limit = limits.sender_daily(&sender);

        let global_used = {
            let global = self.global.lock();
            if global.day == today { global.used } else { 0 }
        };

        let (provider_used, sender_used) = self.providers.get(provider).map_or((0, 0), |shard| {
            let counters = shard.lock();
            if counters.day == today {
                (counters.used, counters.sender_used(&sender))
            } else {
                (0, 0)
            }
        });

        let global_remaining = self.global_daily.map(|g| g.saturating_sub(global_used));
        let provider_remaining = limits.workspace_daily.saturating_sub(provider_used);
        let sender_remaining = sender_limit.saturating_sub(sender_used);

        let limiting_scope = if global_remaining == Some(0) {
            Some(LimitScope::Global)
        } else if provider_remaining == 0 {
            Some(LimitScope::Provider)
        } else if sender_remaining == 0 {
            Some(LimitScope::Sender)
        } else {
            None
        };

        Decision {
            admitted: limiting_scope.is_none(),
            limiting_scope,
            global_remaining,
            provider_remaining,
            sender_remaining,
            resets_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use drover_common::ManualClock;

    use super::*;

    fn limiter(global: Option<u64>) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::midday();
        let limiter = RateLimiter::new(
            LimiterConfig {
                global_daily: global,
            },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    fn limits(workspace: u64, per_user: u64) -> RateLimits {
        RateLimits {
            workspace_daily: workspace,
            per_user_daily: per_user,
            per_user_overrides: AHashMap::default(),
        }
    }

    #[test]
    fn test_admit_and_deny_at_provider_level() {
        let (limiter, _clock) = limiter(None);
        let p1 = ProviderId::new("p1");
        let limits = limits(2, 10);

        assert!(limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);
        assert!(limiter.check_and_reserve(&limits, &p1, "b@x.com").admitted);

        let denied = limiter.check_and_reserve(&limits, &p1, "c@x.com");
        assert!(!denied.admitted);
        assert_eq!(denied.limiting_scope, Some(LimitScope::Provider));
        assert_eq!(denied.provider_remaining, 0);
    }

    #[test]
    fn test_sender_level_binds_before_provider_exhausts() {
        let (limiter, _clock) = limiter(None);
        let p1 = ProviderId::new("p1");
        let limits = limits(100, 1);

        assert!(limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);

        let denied = limiter.check_and_reserve(&limits, &p1, "a@x.com");
        assert!(!denied.admitted);
        assert_eq!(denied.limiting_scope, Some(LimitScope::Sender));

        // Another sender still has headroom
        assert!(limiter.check_and_reserve(&limits, &p1, "b@x.com").admitted);
    }

    #[test]
    fn test_sender_override_applies() {
        let (limiter, _clock) = limiter(None);
        let p1 = ProviderId::new("p1");
        let mut limits = limits(100, 1);
        limits.per_user_overrides.insert("vip@x.com".to_string(), 3);

        for _ in 0..3 {
            assert!(limiter.check_and_reserve(&limits, &p1, "VIP@x.com").admitted);
        }
        assert!(!limiter.check_and_reserve(&limits, &p1, "vip@x.com").admitted);
    }

    #[test]
    fn test_global_ceiling_binds_first() {
        let (limiter, _clock) = limiter(Some(1));
        let limits = limits(100, 100);

        assert!(
            limiter
                .check_and_reserve(&limits, &ProviderId::new("p1"), "a@x.com")
                .admitted
        );

        let denied = limiter.check_and_reserve(&limits, &ProviderId::new("p2"), "b@y.com");
        assert!(!denied.admitted);
        assert_eq!(denied.limiting_scope, Some(LimitScope::Global));
    }

    #[test]
    fn test_denied_admission_leaves_counters_unchanged() {
        let (limiter, _clock) = limiter(None);
        let p1 = ProviderId::new("p1");
        let limits = limits(10, 1);

        limiter.check_and_reserve(&limits, &p1, "a@x.com");
        limiter.check_and_reserve(&limits, &p1, "a@x.com"); // denied at sender level

        let status = limiter.status(&limits, &p1, "b@x.com");
        assert_eq!(status.provider_remaining, 9); // only the admitted send counted
    }

    #[test]
    fn test_day_boundary_resets_counters() {
        let (limiter, clock) = limiter(Some(5));
        let p1 = ProviderId::new("p1");
        let limits = limits(1, 1);

        assert!(limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);
        assert!(!limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);

        clock.roll_day();

        let status = limiter.status(&limits, &p1, "a@x.com");
        assert_eq!(status.provider_remaining, 1);
        assert_eq!(status.sender_remaining, 1);
        assert_eq!(status.global_remaining, Some(5));

        assert!(limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);
    }

    #[test]
    fn test_resets_at_is_next_midnight() {
        let (limiter, clock) = limiter(None);
        let decision =
            limiter.check_and_reserve(&limits(10, 10), &ProviderId::new("p1"), "a@x.com");
        assert_eq!(decision.resets_at, clock.next_midnight());
    }

    #[test]
    fn test_release_returns_headroom() {
        let (limiter, _clock) = limiter(Some(10));
        let p1 = ProviderId::new("p1");
        let limits = limits(1, 1);

        assert!(limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);
        assert!(!limiter.check_and_reserve(&limits, &p1, "a@x.com").admitted);

        limiter.release(&p1, "a@x.com");
        let decision = limiter.check_and_reserve(&limits, &p1, "a@x.com");
        assert!(decision.admitted);
        assert_eq!(decision.global_remaining, Some(9));
    }

    #[test]
    fn test_status_does_not_mutate() {
        let (limiter, _clock) = limiter(None);
        let p1 = ProviderId::new("p1");
        let limits = limits(5, 5);

        for _ in 0..10 {
            limiter.status(&limits, &p1, "a@x.com");
        }
        assert_eq!(limiter.status(&limits, &p1, "a@x.com").provider_remaining, 5);
    }

    #[test]
    fn test_concurrent_reservations_never_oversubscribe() {
        let (limiter, _clock) = limiter(None);
        let limiter = Arc::new(limiter);
        let p1 = ProviderId::new("p1");
        let limits = Arc::new(limits(100, 1000));

        let mut handles = Vec::new();
        for t in 0..8 {
            let limiter = Arc::clone(&limiter);
            let limits = Arc::clone(&limits);
            let p1 = p1.clone();
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0;
                for i in 0..50 {
                    let sender = format!("s{t}-{i}@x.com");
                    if limiter.check_and_reserve(&limits, &p1, &sender).admitted {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100, "exactly the workspace budget must be admitted");
    }

    #[test]
    fn test_effective_remaining_is_tightest() {
        let decision = Decision {
            admitted: true,
            limiting_scope: None,
            global_remaining: Some(50),
            provider_remaining: 20,
            sender_remaining: 7,
            resets_at: Utc::now(),
        };
        assert_eq!(decision.effective_remaining(), 7);
    }
}
