//! `warden.toml` configuration.
//!
//! The file is parsed into an all-optional raw form first, then resolved into
//! [`WardenConfig`] with defaults applied and durations parsed.
//!
//! ```toml
//! [probe]
//! interval = "5s"
//! timeout = "2s"
//!
//! [pool]
//! capacity = 20
//! max_lifetime = "30m"
//!
//! [listen]
//! address = "127.0.0.1:6432"
//!
//! [[candidates]]
//! identity = "db-0.db.prod.svc.cluster.local:5432"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

use crate::duration::{format_duration, parse_duration};
use crate::error::ConfigError;
use crate::identity::BackendIdentity;

/// Connections kept longer than this pin the pool to whatever the name
/// resolved to when they were opened.
pub const LIFETIME_WARN_THRESHOLD: Duration = Duration::from_secs(3600);
pub const IDLE_WARN_THRESHOLD: Duration = Duration::from_secs(600);

// ── Raw TOML shape ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    probe: Option<RawProbe>,
    pool: Option<RawPool>,
    reconcile: Option<RawReconcile>,
    listen: Option<RawListen>,
    #[serde(default)]
    candidates: Vec<RawCandidate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbe {
    interval: Option<String>,
    timeout: Option<String>,
    round_timeout: Option<String>,
    admin_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPool {
    capacity: Option<usize>,
    max_lifetime: Option<String>,
    idle_timeout: Option<String>,
    connect_timeout: Option<String>,
    acquire_timeout: Option<String>,
    reset_on_release: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReconcile {
    promotion_enabled: Option<bool>,
    backoff_base: Option<String>,
    backoff_max: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListen {
    address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCandidate {
    identity: String,
}

// ── Resolved config ────────────────────────────────────────────────

/// Health probing settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSection {
    #[serde(serialize_with = "ser_duration")]
    pub interval: Duration,
    /// Deadline for a single probe.
    #[serde(serialize_with = "ser_duration")]
    pub timeout: Duration,
    /// Ceiling for a whole probing round.
    #[serde(serialize_with = "ser_duration")]
    pub round_timeout: Duration,
    /// Port of the per-candidate role/admin endpoint.
    pub admin_port: u16,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            round_timeout: Duration::from_secs(4),
            admin_port: 8008,
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSection {
    pub capacity: usize,
    #[serde(serialize_with = "ser_duration")]
    pub max_lifetime: Duration,
    #[serde(serialize_with = "ser_duration")]
    pub idle_timeout: Duration,
    #[serde(serialize_with = "ser_duration")]
    pub connect_timeout: Duration,
    #[serde(serialize_with = "ser_duration")]
    pub acquire_timeout: Duration,
    /// Reset session state before an idle connection is reused.
    pub reset_on_release: bool,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            capacity: 20,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(3),
            acquire_timeout: Duration::from_secs(5),
            reset_on_release: true,
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileSection {
    pub promotion_enabled: bool,
    #[serde(serialize_with = "ser_duration")]
    pub backoff_base: Duration,
    #[serde(serialize_with = "ser_duration")]
    pub backoff_max: Duration,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            promotion_enabled: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Where clients connect to reach the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenSection {
    pub address: SocketAddr,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 6432)),
        }
    }
}

/// Fully resolved `warden.toml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WardenConfig {
    pub probe: ProbeSection,
    pub pool: PoolSection,
    pub reconcile: ReconcileSection,
    pub listen: ListenSection,
    pub candidates: Vec<BackendIdentity>,
}

impl WardenConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        let config = Self::resolve(raw)?;
        config.validate()?;
        for warning in config.warnings() {
            warn!("{warning}");
        }
        Ok(config)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let probe_raw = raw.probe.unwrap_or_default();
        let pool_raw = raw.pool.unwrap_or_default();
        let reconcile_raw = raw.reconcile.unwrap_or_default();
        let listen_raw = raw.listen.unwrap_or_default();

        let probe_defaults = ProbeSection::default();
        let pool_defaults = PoolSection::default();
        let reconcile_defaults = ReconcileSection::default();

        let probe = ProbeSection {
            interval: field("probe.interval", probe_raw.interval, probe_defaults.interval)?,
            timeout: field("probe.timeout", probe_raw.timeout, probe_defaults.timeout)?,
            round_timeout: field(
                "probe.round_timeout",
                probe_raw.round_timeout,
                probe_defaults.round_timeout,
            )?,
            admin_port: probe_raw.admin_port.unwrap_or(probe_defaults.admin_port),
        };

        let pool = PoolSection {
            capacity: pool_raw.capacity.unwrap_or(pool_defaults.capacity),
            max_lifetime: field("pool.max_lifetime", pool_raw.max_lifetime, pool_defaults.max_lifetime)?,
            idle_timeout: field("pool.idle_timeout", pool_raw.idle_timeout, pool_defaults.idle_timeout)?,
            connect_timeout: field(
                "pool.connect_timeout",
                pool_raw.connect_timeout,
                pool_defaults.connect_timeout,
            )?,
            acquire_timeout: field(
                "pool.acquire_timeout",
                pool_raw.acquire_timeout,
                pool_defaults.acquire_timeout,
            )?,
            reset_on_release: pool_raw.reset_on_release.unwrap_or(pool_defaults.reset_on_release),
        };

        let reconcile = ReconcileSection {
            promotion_enabled: reconcile_raw
                .promotion_enabled
                .unwrap_or(reconcile_defaults.promotion_enabled),
            backoff_base: field(
                "reconcile.backoff_base",
                reconcile_raw.backoff_base,
                reconcile_defaults.backoff_base,
            )?,
            backoff_max: field(
                "reconcile.backoff_max",
                reconcile_raw.backoff_max,
                reconcile_defaults.backoff_max,
            )?,
        };

        let listen = match listen_raw.address {
            None => ListenSection::default(),
            Some(address) => ListenSection {
                address: address.parse().map_err(|e| {
                    ConfigError::Invalid(format!("listen.address {address:?} is not a socket address: {e}"))
                })?,
            },
        };

        let candidates = raw
            .candidates
            .into_iter()
            .enumerate()
            .map(|(index, c)| {
                BackendIdentity::parse(&c.identity)
                    .map_err(|source| ConfigError::Identity { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            probe,
            pool,
            reconcile,
            listen,
            candidates,
        })
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates.is_empty() {
            return Err(ConfigError::Invalid("at least one candidate is required".into()));
        }

        let mut seen = HashSet::new();
        for id in &self.candidates {
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate candidate {id}")));
            }
        }

        if self.pool.capacity == 0 {
            return Err(ConfigError::Invalid("pool.capacity must be at least 1".into()));
        }
        if self.probe.interval.is_zero() {
            return Err(ConfigError::Invalid("probe.interval must be non-zero".into()));
        }
        if self.probe.timeout.is_zero() {
            return Err(ConfigError::Invalid("probe.timeout must be non-zero".into()));
        }
        if self.probe.round_timeout < self.probe.timeout {
            return Err(ConfigError::Invalid(
                "probe.round_timeout must be at least probe.timeout".into(),
            ));
        }
        if self.reconcile.backoff_max < self.reconcile.backoff_base {
            return Err(ConfigError::Invalid(
                "reconcile.backoff_max must be at least reconcile.backoff_base".into(),
            ));
        }
        Ok(())
    }

    /// Settings that are legal but tend to keep a pool bound to a dead backend.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.pool.max_lifetime > LIFETIME_WARN_THRESHOLD {
            out.push(format!(
                "pool.max_lifetime = {} exceeds {}; connections may outlive a failover",
                format_duration(self.pool.max_lifetime),
                format_duration(LIFETIME_WARN_THRESHOLD)
            ));
        }
        if self.pool.idle_timeout >= IDLE_WARN_THRESHOLD {
            out.push(format!(
                "pool.idle_timeout = {} is at least {}; idle connections to a demoted backend linger",
                format_duration(self.pool.idle_timeout),
                format_duration(IDLE_WARN_THRESHOLD)
            ));
        }
        if !self.pool.reset_on_release {
            out.push("pool.reset_on_release is off; session state leaks between borrowers".into());
        }
        out
    }
}

fn field(name: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => parse_duration(&v).ok_or(ConfigError::Duration { field: name, value: v }),
    }
}

fn ser_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}
