//! Provider health tracking
//!
//! Caches the last out-of-band probe outcome per provider. An external
//! scheduler drives the probes and pushes results here; the router reads the
//! cache when filtering and scoring candidates. A provider nobody has probed
//! yet counts as healthy.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use drover_common::{
    ProviderId,
    tracing::{debug, warn},
};
use serde::{Deserialize, Serialize};

/// Probe-derived availability of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Last probe succeeded
    Healthy,
    /// Usable, but scored down by the router
    Degraded,
    /// Last probe failed; ineligible for routing
    Unhealthy,
    /// Taken out of rotation by an operator; ineligible for routing
    Disabled,
}

impl HealthStatus {
    /// Router score contribution; `None` means ineligible
    #[must_use]
    pub const fn score(self) -> Option<f64> {
        match self {
            Self::Healthy => Some(1.0),
            Self::Degraded => Some(0.5),
            Self::Unhealthy | Self::Disabled => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ProbeRecord {
    status: HealthStatus,
    observed_at: DateTime<Utc>,
    detail: Option<String>,
}

/// Cache of probe outcomes, keyed by provider
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<ProviderId, ProbeRecord>,
}

impl HealthTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a probe
    pub fn record_probe(
        &self,
        provider: &ProviderId,
        observed_at: DateTime<Utc>,
        outcome: Result<(), &str>,
    ) {
        let (status, detail) = match outcome {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(error) => {
                warn!(provider = %provider, error = %error, "health probe failed");
                (HealthStatus::Unhealthy, Some(error.to_string()))
            }
        };

        // An operator Disabled marker outlives probe results
        if self.status(provider) == HealthStatus::Disabled {
            debug!(provider = %provider, "ignoring probe for disabled provider");
            return;
        }

        self.records.insert(
            provider.clone(),
            ProbeRecord {
                status,
                observed_at,
                detail,
            },
        );
    }

    /// Operator override: force a status regardless of probes
    pub fn set_status(&self, provider: &ProviderId, status: HealthStatus, at: DateTime<Utc>) {
        self.records.insert(
            provider.clone(),
            ProbeRecord {
                status,
                observed_at: at,
                detail: None,
            },
        );
    }

    /// Current status; unknown providers are healthy until a probe says otherwise
    pub fn status(&self, provider: &ProviderId) -> HealthStatus {
        self.records
            .get(provider)
            .map_or(HealthStatus::Healthy, |record| record.status)
    }

    /// Router score for the provider; `None` means drop the candidate
    pub fn score(&self, provider: &ProviderId) -> Option<f64> {
        self.status(provider).score()
    }

    /// Last probe detail for the operational surface
    pub fn detail(&self, provider: &ProviderId) -> Option<(DateTime<Utc>, Option<String>)> {
        self.records
            .get(provider)
            .map(|record| (record.observed_at, record.detail.clone()))
    }
}
