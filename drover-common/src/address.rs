//! Sender address handling
//!
//! Frontends hand the relay already-normalized RFC 5321 addresses; this
//! module only splits them into local part and domain for routing and
//! rate-limit keying.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;

/// Errors produced when parsing a sender address
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The address has no `@domain` part
    #[error("invalid address: no domain found in '{0}'")]
    MissingDomain(String),

    /// The address has an empty local part
    #[error("invalid address: empty local part in '{0}'")]
    MissingLocalPart(String),
}

/// A parsed, lowercased sender address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderAddress {
    local: String,
    domain: Domain,
}

impl SenderAddress {
    /// Parse an address of the form `local@domain`, tolerating surrounding
    /// whitespace and angle brackets
    ///
    /// # Errors
    /// If either side of the `@` is missing or empty
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let cleaned = address.trim().trim_matches(|c| c == '<' || c == '>');

        let (local, domain) = cleaned
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingDomain(address.to_string()))?;

        if local.is_empty() {
            return Err(AddressError::MissingLocalPart(address.to_string()));
        }
        if domain.is_empty() {
            return Err(AddressError::MissingDomain(address.to_string()));
        }

        Ok(Self {
            local: local.to_ascii_lowercase(),
            domain: Domain::new(domain),
        })
    }

    /// The local part, lowercased
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain part
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }
}

impl Display for SenderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}
