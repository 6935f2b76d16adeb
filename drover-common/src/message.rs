//! The queue-entry message model
//!
//! A [`Message`] is what frontends enqueue and what the dispatch engine
//! eventually hands to a provider adapter. Status is an explicit state
//! machine; every transition goes through [`MessageStatus::can_transition`]
//! so disallowed ones are rejected loudly rather than silently absorbed.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;

/// Identifier for a queued message
///
/// A ULID: 128 bits, lexicographically sortable by creation time and
/// collision-resistant, which gives the store its oldest-first tie-break
/// ordering for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique message id
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Parse a message id from its string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s).ok().map(Self)
    }

    /// Parse a message id from a store filename like `01ARYZ6S41….msg`
    ///
    /// Rejects path separators and traversal patterns so a hostile filename
    /// can never escape the store directory.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".msg")?;
        Self::parse(stem)
    }

    /// Get the underlying ULID
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(id))
    }
}

/// Where a message sits in its delivery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Waiting to be claimed by a worker
    Queued,
    /// Claimed by a worker under a lease
    Processing,
    /// Delivered; terminal
    Sent,
    /// Given up; terminal
    Failed,
    /// Credentials rejected; requires operator reset
    AuthError,
    /// Waiting out a visibility delay before becoming claimable again
    Deferred,
}

impl MessageStatus {
    /// Whether the status is terminal
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a worker may claim a message in this status
    ///
    /// `Processing` is claimable only once its lease has expired; the store
    /// checks the lease, this only answers the status-level question.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::Deferred | Self::Processing)
    }

    /// The exhaustive transition table
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        match self {
            // Queued/Deferred leave via claim or cancellation
            Self::Queued | Self::Deferred => {
                matches!(next, Self::Processing | Self::Failed)
            }
            // Processing -> Processing is a lease takeover by another worker
            Self::Processing => matches!(
                next,
                Self::Processing | Self::Sent | Self::Failed | Self::AuthError | Self::Deferred
            ),
            // Operator reset only
            Self::AuthError => matches!(next, Self::Queued),
            Self::Sent | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::AuthError => "auth_error",
            Self::Deferred => "deferred",
        };
        write!(f, "{name}")
    }
}

/// An ordered, case-insensitive header multimap
///
/// Order is preserved because rewrite rules apply in sequence and some
/// providers are sensitive to header ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header map
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for a header name, if present
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with this name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header, keeping any existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all values of a header with a single one, or append if absent
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name.to_string(), value);
    }

    /// Remove every value of a header
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Iterate over `(name, value)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map holds no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// The queue entry handed from frontends to the dispatch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier; supplied by the frontend or generated on enqueue
    pub id: MessageId,
    /// Envelope sender
    pub from: String,
    /// Envelope recipients
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    /// Message headers after frontend normalization
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Free-form key/value metadata carried alongside the message
    #[serde(default)]
    pub metadata: AHashMap<String, String>,
    /// Preferred provider, honored by the router when eligible
    #[serde(default)]
    pub provider_hint: Option<ProviderId>,
    /// Opaque upstream correlation tag
    #[serde(default)]
    pub invitation_id: Option<String>,
    /// Opaque classification tag
    #[serde(default)]
    pub email_type: Option<String>,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
    /// Set exactly when the message reaches Sent or Failed
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Provider the last dispatch attempt was routed to
    #[serde(default)]
    pub assigned_provider_id: Option<ProviderId>,
}

impl Message {
    /// Create a new message ready for enqueueing
    #[must_use]
    pub fn new(from: impl Into<String>, to: Vec<String>, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            from: from.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body_text: None,
            body_html: None,
            headers: Headers::new(),
            attachments: Vec::new(),
            metadata: AHashMap::new(),
            provider_hint: None,
            invitation_id: None,
            email_type: None,
            status: MessageStatus::Queued,
            queued_at,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            assigned_provider_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_roundtrip() {
        let id = MessageId::generate();
        assert_eq!(MessageId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn test_message_id_filename_validation() {
        let id = MessageId::generate();
        let filename = format!("{id}.msg");
        assert_eq!(MessageId::from_filename(&filename), Some(id));

        assert!(MessageId::from_filename("../etc/passwd.msg").is_none());
        assert!(MessageId::from_filename("foo/bar.msg").is_none());
        assert!(MessageId::from_filename("not_a_ulid.msg").is_none());
        assert!(MessageId::from_filename(&id.to_string()).is_none()); // no extension
    }

    #[test]
    fn test_status_terminal() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::AuthError.is_terminal());
        assert!(!MessageStatus::Deferred.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use MessageStatus::{AuthError, Deferred, Failed, Processing, Queued, Sent};

        assert!(Queued.can_transition(Processing));
        assert!(Queued.can_transition(Failed)); // cancellation
        assert!(!Queued.can_transition(Sent));

        assert!(Deferred.can_transition(Processing));
        assert!(!Deferred.can_transition(Queued));

        assert!(Processing.can_transition(Sent));
        assert!(Processing.can_transition(Deferred));
        assert!(Processing.can_transition(AuthError));
        assert!(Processing.can_transition(Processing)); // lease takeover

        assert!(AuthError.can_transition(Queued));
        assert!(!AuthError.can_transition(Sent));

        assert!(!Sent.can_transition(Queued));
        assert!(!Failed.can_transition(Queued));
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("X-Campaign", "spring");
        assert_eq!(headers.get("x-campaign"), Some("spring"));
        assert!(headers.contains("X-CAMPAIGN"));
    }

    #[test]
    fn test_headers_set_replaces_all() {
        let mut headers = Headers::new();
        headers.append("X-Tag", "one");
        headers.append("x-tag", "two");
        headers.set("X-Tag", "three");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Tag"), Some("three"));
    }

    #[test]
    fn test_headers_preserve_order() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("B", "2");
        headers.append("A", "3");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("A", "1"), ("B", "2"), ("A", "3")]);
    }
}
