//! Stable backend identities.
//!
//! A pool that is bound to a raw IP keeps dialing that IP after the instance
//! behind it is rescheduled, so identities are DNS names only. IP literals are
//! rejected at parse time and can never reach the registry or the pool.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Port assumed when an identity omits one.
pub const DEFAULT_PORT: u16 = 5432;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A restart-surviving `host:port` name for a backend candidate.
///
/// Ordering is lexicographic on the canonical `host:port` text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendIdentity {
    host: String,
    port: u16,
    canonical: String,
}

impl BackendIdentity {
    /// Parse `host[:port]`, rejecting IP literals.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }

        // Bare or bracketed IPv6, and bare IPv4.
        if s.parse::<IpAddr>().is_ok() {
            return Err(IdentityError::EphemeralAddress(s.to_string()));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let inner = rest.split(']').next().unwrap_or_default();
            if inner.parse::<IpAddr>().is_ok() {
                return Err(IdentityError::EphemeralAddress(s.to_string()));
            }
            return Err(IdentityError::InvalidHost(s.to_string()));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| IdentityError::InvalidPort(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };

        if host.parse::<IpAddr>().is_ok() {
            return Err(IdentityError::EphemeralAddress(s.to_string()));
        }
        validate_host(host)?;

        let host = host.to_ascii_lowercase();
        Ok(Self {
            canonical: format!("{host}:{port}"),
            host,
            port,
        })
    }

    /// DNS host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Canonical `host:port` form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The same host on a different port (e.g. an admin endpoint).
    pub fn with_port(&self, port: u16) -> String {
        format!("{}:{port}", self.host)
    }
}

fn validate_host(host: &str) -> Result<(), IdentityError> {
    let invalid = || IdentityError::InvalidHost(host.to_string());

    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(invalid());
    }

    let host = host.strip_suffix('.').unwrap_or(host);
    let mut all_numeric = true;
    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid());
        }
        if !label.bytes().all(|b| b.is_ascii_digit()) {
            all_numeric = false;
        }
    }

    // "10.0.1" is not an IpAddr but is still an address, not a name.
    if all_numeric {
        return Err(IdentityError::EphemeralAddress(host.to_string()));
    }
    Ok(())
}

impl Ord for BackendIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl PartialOrd for BackendIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for BackendIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BackendIdentity {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<BackendIdentity> for String {
    fn from(id: BackendIdentity) -> Self {
        id.canonical
    }
}
