//! Error types for identities and configuration.

use thiserror::Error;

/// Errors produced when parsing a [`crate::BackendIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("backend identity is empty")]
    Empty,

    #[error("backend identity {0:?} is an IP address; use a stable DNS name")]
    EphemeralAddress(String),

    #[error("invalid host name {0:?}")]
    InvalidHost(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// Errors produced while loading or validating `warden.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },

    #[error("candidate {index}: {source}")]
    Identity {
        index: usize,
        #[source]
        source: IdentityError,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
