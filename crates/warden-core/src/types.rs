//! Backend candidate records.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::identity::BackendIdentity;

/// Replication role as last observed by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Replica,
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Liveness as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Unhealthy => write!(f, "unhealthy"),
            Health::Unknown => write!(f, "unknown"),
        }
    }
}

/// Last-known state of one backend candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCandidate {
    pub identity: BackendIdentity,
    pub role: Role,
    pub health: Health,
    /// When the last probe (successful or not) completed. `None` until probed.
    pub last_checked_at: Option<SystemTime>,
    /// When the last successful probe completed.
    pub last_healthy_at: Option<SystemTime>,
}

impl BackendCandidate {
    /// A freshly discovered candidate with no observations yet.
    pub fn unknown(identity: BackendIdentity) -> Self {
        Self {
            identity,
            role: Role::Unknown,
            health: Health::Unknown,
            last_checked_at: None,
            last_healthy_at: None,
        }
    }

    /// Record a successful probe.
    pub fn observe(&mut self, role: Role, at: SystemTime) {
        self.role = role;
        self.health = Health::Healthy;
        self.last_checked_at = Some(at);
        self.last_healthy_at = Some(at);
    }

    /// Record a probe that could not reach the candidate. The last known
    /// role is kept; only health changes.
    pub fn mark_unhealthy(&mut self, at: SystemTime) {
        self.health = Health::Unhealthy;
        self.last_checked_at = Some(at);
    }

    /// Record a probe that reached the candidate but could not tell its role.
    pub fn mark_ambiguous(&mut self, at: SystemTime) {
        self.role = Role::Unknown;
        self.health = Health::Unknown;
        self.last_checked_at = Some(at);
    }

    pub fn is_healthy_primary(&self) -> bool {
        self.role == Role::Primary && self.health == Health::Healthy
    }

    pub fn is_healthy_replica(&self) -> bool {
        self.role == Role::Replica && self.health == Health::Healthy
    }
}
