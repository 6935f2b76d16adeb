//! Provider (tenant) configuration model
//!
//! A provider is a tenant-scoped dispatch target: one backend kind, its
//! credentials, the sender domains it is authoritative for, a daily
//! rate-limit envelope, and an ordered header-rewrite policy.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::domain::Domain;

/// Identifier for a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    /// Create a new provider id
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for ProviderId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Daily rate-limit envelope for a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    /// Messages per UTC day across the whole workspace
    #[serde(default = "default_workspace_daily")]
    pub workspace_daily: u64,

    /// Messages per UTC day for a single sender, unless overridden
    #[serde(default = "default_per_user_daily")]
    pub per_user_daily: u64,

    /// Per-sender overrides keyed by lowercased address
    #[serde(default)]
    pub per_user_overrides: AHashMap<String, u64>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            workspace_daily: default_workspace_daily(),
            per_user_daily: default_per_user_daily(),
            per_user_overrides: AHashMap::default(),
        }
    }
}

const fn default_workspace_daily() -> u64 {
    2000
}

const fn default_per_user_daily() -> u64 {
    500
}

impl RateLimits {
    /// The per-sender daily limit, honoring any override
    #[must_use]
    pub fn sender_daily(&self, sender: &str) -> u64 {
        self.per_user_overrides
            .get(sender)
            .copied()
            .unwrap_or(self.per_user_daily)
    }
}

/// Backend-specific connection settings
///
/// The variant doubles as the provider's `type`; everything inside is
/// opaque to routing and only read by the matching adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendConfig {
    /// Google-Workspace-style JSON API with a bearer token
    Workspace { base_url: String, token: String },
    /// Mailgun-style form API with HTTP basic auth
    Mailgun {
        base_url: String,
        api_key: String,
        sending_domain: String,
    },
    /// Mandrill-style JSON API with an embedded key
    Mandrill { base_url: String, api_key: String },
}

impl BackendConfig {
    /// Human-readable backend kind, used in logs and metrics labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Workspace { .. } => "workspace",
            Self::Mailgun { .. } => "mailgun",
            Self::Mandrill { .. } => "mandrill",
        }
    }
}

/// What a rewrite rule does to its header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteAction {
    /// Append the value, keeping existing ones
    Add,
    /// Replace every existing value (or add if absent)
    Replace,
    /// Drop the header entirely
    Remove,
}

/// When a rewrite rule fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteCondition {
    Always,
    IfPresent,
    IfMissing,
    /// Fires when the current first value matches the regex
    Matches(String),
}

impl Default for RewriteCondition {
    fn default() -> Self {
        Self::Always
    }
}

/// One ordered header-rewrite rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Header the rule targets
    pub header: String,
    pub action: RewriteAction,
    /// Required for Add/Replace; ignored for Remove
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub condition: RewriteCondition,
}

/// A tenant-scoped dispatch target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,

    /// Backend kind and its connection settings
    pub backend: BackendConfig,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lower is preferred when breaking ties in direct routing
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Relative share when weighted selection applies; must be positive
    /// whenever the provider is enabled
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Sender domains this provider is authoritative for
    #[serde(default)]
    pub domains: Vec<Domain>,

    #[serde(default)]
    pub rate_limits: RateLimits,

    /// Applied in order to the headers of every message before send
    #[serde(default)]
    pub header_rewrites: Vec<RewriteRule>,
}

const fn default_enabled() -> bool {
    true
}

const fn default_priority() -> u32 {
    100
}

const fn default_weight() -> f64 {
    1.0
}

impl ProviderConfig {
    /// Whether the provider is authoritative for the given sender domain
    #[must_use]
    pub fn covers_domain(&self, domain: &Domain) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    /// Whether the provider can appear in routing at all
    #[must_use]
    pub fn routable(&self) -> bool {
        self.enabled && self.weight > 0.0
    }
}
