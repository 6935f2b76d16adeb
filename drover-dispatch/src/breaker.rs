//! Per-provider circuit breaker
//!
//! Protects the dispatch engine from hammering a failing provider.
//!
//! # State transitions
//!
//! ```text
//! ┌─────────┐  consecutive failures reach threshold   ┌──────┐
//! │ Closed  │ ─────────────────────────────────────>  │ Open │
//! └─────────┘                                          └──────┘
//!     ^                                                   │
//!     │ successes reach                                   │ open_timeout elapsed
//!     │ success_threshold            ┌───────────┐        v
//!     └─────────────────────────────│ Half-Open  │<───────┘
//!                                    └───────────┘
//!                                          │ any failure
//!                                          v
//!                                       ┌──────┐
//!                                       │ Open │
//!                                       └──────┘
//! ```
//!
//! Half-open admits at most `half_open_probes` in-flight calls at a time;
//! `allow` takes a slot, `record_success`/`record_failure` settle it. An
//! authentication failure can be configured to open the circuit from any
//! state in one hit.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use drover_common::{
    Clock, ProviderId,
    tracing::{info, warn},
};
use serde::{Deserialize, Serialize};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before probing recovery (seconds)
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// In-flight probe calls admitted while half-open
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,

    /// Whether a single authentication failure opens the circuit outright
    #[serde(default = "default_trip_on_auth_error")]
    pub trip_on_auth_error: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_probes: default_half_open_probes(),
            trip_on_auth_error: default_trip_on_auth_error(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_open_timeout_secs() -> u64 {
    300
}

const fn default_half_open_probes() -> u32 {
    1
}

const fn default_trip_on_auth_error() -> bool {
    true
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, all calls permitted
    Closed,
    /// Circuit tripped, all calls rejected until the timeout lapses
    Open,
    /// Probing recovery with a bounded number of in-flight calls
    HalfOpen,
}

#[derive(Debug)]
struct BreakerData {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

impl BreakerData {
    const fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.half_open_in_flight = 0;
    }

    fn timeout_expired(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        self.opened_at.is_some_and(|opened| now - opened >= timeout)
    }
}

/// Per-provider circuit breaker manager
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<ProviderId, Arc<parking_lot::Mutex<BreakerData>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker manager
    #[must_use]
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    fn get_breaker(&self, provider: &ProviderId) -> Arc<parking_lot::Mutex<BreakerData>> {
        self.breakers
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(BreakerData::new())))
            .clone()
    }

    /// Open timeout as a `TimeDelta`, clamped to chrono's representable range
    fn open_timeout(&self) -> TimeDelta {
        let secs = i64::try_from(self.config.open_timeout_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        TimeDelta::seconds(secs)
    }

    /// Whether a call to this provider is permitted right now
    ///
    /// In half-open this takes one of the bounded probe slots; the caller
    /// must settle it with `record_success` or `record_failure`.
    pub fn allow(&self, provider: &ProviderId) -> bool {
        let breaker = self.get_breaker(provider);
        let mut data = breaker.lock();

        match data.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if data.timeout_expired(self.clock.now(), self.open_timeout()) {
                    data.state = BreakerState::HalfOpen;
                    data.consecutive_successes = 0;
                    data.half_open_in_flight = 1;
                    info!(provider = %provider, "circuit breaker half-open, probing recovery");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if data.half_open_in_flight < self.config.half_open_probes {
                    data.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Non-mutating variant of [`Self::allow`], for candidate filtering
    ///
    /// Reports whether an `allow` call would succeed without transitioning
    /// state or consuming a probe slot.
    pub fn would_allow(&self, provider: &ProviderId) -> bool {
        let breaker = self.get_breaker(provider);
        let data = breaker.lock();

        match data.state {
            BreakerState::Closed => true,
            BreakerState::Open => data.timeout_expired(self.clock.now(), self.open_timeout()),
            BreakerState::HalfOpen => data.half_open_in_flight < self.config.half_open_probes,
        }
    }

    /// Record a successful call
    pub fn record_success(&self, provider: &ProviderId) {
        let breaker = self.get_breaker(provider);
        let mut data = breaker.lock();

        match data.state {
            BreakerState::Closed => {
                data.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                data.half_open_in_flight = data.half_open_in_flight.saturating_sub(1);
                data.consecutive_successes += 1;
                if data.consecutive_successes >= self.config.success_threshold {
                    data.close();
                    info!(provider = %provider, "circuit breaker closed, normal operation resumed");
                }
            }
            BreakerState::Open => {
                warn!(provider = %provider, "unexpected success while circuit is open");
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, provider: &ProviderId) {
        let breaker = self.get_breaker(provider);
        let mut data = breaker.lock();

        match data.state {
            BreakerState::Closed => {
                data.consecutive_failures += 1;
                if data.consecutive_failures >= self.config.failure_threshold {
                    data.open(self.clock.now());
                    warn!(
                        provider = %provider,
                        failures = data.consecutive_failures,
                        timeout_secs = self.config.open_timeout_secs,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                data.open(self.clock.now());
                warn!(provider = %provider, "circuit breaker probe failed, reopening");
            }
            BreakerState::Open => {}
        }
    }

    /// Record an authentication failure, which may trip the circuit outright
    pub fn record_auth_failure(&self, provider: &ProviderId) {
        if self.config.trip_on_auth_error {
            let breaker = self.get_breaker(provider);
            let mut data = breaker.lock();
            if data.state != BreakerState::Open {
                data.open(self.clock.now());
                warn!(provider = %provider, "circuit breaker opened on authentication failure");
            }
        } else {
            self.record_failure(provider);
        }
    }

    /// Whether the provider looks usable: closed, or recovering with at
    /// least one successful probe
    pub fn healthy(&self, provider: &ProviderId) -> bool {
        let breaker = self.get_breaker(provider);
        let data = breaker.lock();
        match data.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => data.consecutive_successes > 0,
            BreakerState::Open => false,
        }
    }

    /// Current state for a provider
    pub fn state(&self, provider: &ProviderId) -> BreakerState {
        let breaker = self.get_breaker(provider);
        let data = breaker.lock();
        data.state
    }
}

#[cfg(test)]
mod tests {
    use drover_common::ManualClock;

    use super::*;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::midday();
        (CircuitBreaker::new(config, Arc::new(clock.clone())), clock)
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_secs: 300,
            half_open_probes: 1,
            trip_on_auth_error: true,
        }
    }

    #[test]
    fn test_closed_to_open_on_consecutive_failures() {
        let (breaker, _clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        assert!(breaker.allow(&p1));
        breaker.record_failure(&p1);
        breaker.record_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Closed);

        breaker.record_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Open);
        assert!(!breaker.allow(&p1));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let (breaker, _clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        breaker.record_failure(&p1);
        breaker.record_failure(&p1);
        breaker.record_success(&p1);

        breaker.record_failure(&p1);
        breaker.record_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_until_timeout() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        assert!(!breaker.allow(&p1));

        clock.advance(TimeDelta::seconds(299));
        assert!(!breaker.allow(&p1));

        clock.advance(TimeDelta::seconds(2));
        assert!(breaker.allow(&p1));
        assert_eq!(breaker.state(&p1), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_bounds_in_flight_probes() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        clock.advance(TimeDelta::seconds(301));

        // First allow takes the single probe slot
        assert!(breaker.allow(&p1));
        assert!(!breaker.allow(&p1));

        // Settling the probe frees the slot
        breaker.record_success(&p1);
        assert!(breaker.allow(&p1));
    }

    #[test]
    fn test_one_success_does_not_close_with_threshold_two() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        clock.advance(TimeDelta::seconds(301));
        assert!(breaker.allow(&p1));

        breaker.record_success(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::HalfOpen);

        assert!(breaker.allow(&p1));
        breaker.record_success(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        clock.advance(TimeDelta::seconds(301));
        assert!(breaker.allow(&p1));

        breaker.record_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Open);
        assert!(!breaker.allow(&p1));

        // The reopened circuit needs a fresh timeout
        clock.advance(TimeDelta::seconds(301));
        assert!(breaker.allow(&p1));
    }

    #[test]
    fn test_auth_failure_trips_immediately_when_configured() {
        let (breaker, _clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        breaker.record_auth_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Open);
    }

    #[test]
    fn test_auth_failure_counts_normally_when_not_configured() {
        let (breaker, _clock) = breaker(BreakerConfig {
            trip_on_auth_error: false,
            ..config()
        });
        let p1 = ProviderId::new("p1");

        breaker.record_auth_failure(&p1);
        assert_eq!(breaker.state(&p1), BreakerState::Closed);
    }

    #[test]
    fn test_would_allow_does_not_consume_probe_slot() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        clock.advance(TimeDelta::seconds(301));

        // Peeking never transitions or takes the slot
        assert!(breaker.would_allow(&p1));
        assert!(breaker.would_allow(&p1));
        assert_eq!(breaker.state(&p1), BreakerState::Open);

        assert!(breaker.allow(&p1));
        assert!(!breaker.would_allow(&p1));
    }

    #[test]
    fn test_healthy_requires_probe_success() {
        let (breaker, clock) = breaker(config());
        let p1 = ProviderId::new("p1");

        assert!(breaker.healthy(&p1));

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        assert!(!breaker.healthy(&p1));

        clock.advance(TimeDelta::seconds(301));
        assert!(breaker.allow(&p1));
        assert!(!breaker.healthy(&p1));

        breaker.record_success(&p1);
        assert!(breaker.healthy(&p1));
    }

    #[test]
    fn test_breakers_are_independent_per_provider() {
        let (breaker, _clock) = breaker(config());
        let p1 = ProviderId::new("p1");
        let p2 = ProviderId::new("p2");

        for _ in 0..3 {
            breaker.record_failure(&p1);
        }
        assert_eq!(breaker.state(&p1), BreakerState::Open);
        assert_eq!(breaker.state(&p2), BreakerState::Closed);
        assert!(breaker.allow(&p2));
    }
}
