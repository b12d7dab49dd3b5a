//! Reconciliation phases and the loop's own bookkeeping.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use warden_core::BackendIdentity;

/// Where the reconciliation loop currently is.
///
/// ```text
/// Settled ──tick──► Probing ──► Resolving ──► Settled
///                                  │  ├──► Retargeting ──► Settled
///                                  │  └──► PromotionPending ──► Retargeting
///                                  └──► Degraded ──tick──► Probing
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Settled,
    Probing,
    Resolving,
    PromotionPending { candidate: BackendIdentity },
    Retargeting { target: BackendIdentity },
    /// No safe target, or a collaborator failed. Retried with backoff.
    Degraded { reason: String },
}

impl Phase {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Phase::Degraded { .. })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Settled => write!(f, "settled"),
            Phase::Probing => write!(f, "probing"),
            Phase::Resolving => write!(f, "resolving"),
            Phase::PromotionPending { candidate } => write!(f, "promotion pending ({candidate})"),
            Phase::Retargeting { target } => write!(f, "retargeting ({target})"),
            Phase::Degraded { reason } => write!(f, "degraded ({reason})"),
        }
    }
}

/// Loop state. Rebuilt from scratch at startup; nothing is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    /// Identity the resolver last asked for.
    pub last_desired_target: Option<BackendIdentity>,
    /// When the loop last retargeted the pool.
    pub last_action_at: Option<SystemTime>,
    pub consecutive_failures: u32,
}

/// Operator-facing status, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub phase: Phase,
    /// Identity the pool is bound to.
    pub target: Option<BackendIdentity>,
    pub generation: u64,
    pub last_desired_target: Option<BackendIdentity>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for ReconcileReport {
    fn default() -> Self {
        Self {
            phase: Phase::Settled,
            target: None,
            generation: 0,
            last_desired_target: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Delay before the next attempt after `failures` consecutive failures:
/// `min(base * 2^(failures - 1), max)`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 6), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, max, 7), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn zero_failures_uses_base() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, Duration::from_secs(5), 0), base);
    }

    #[test]
    fn phase_serializes_with_tag() {
        let phase = Phase::Retargeting {
            target: BackendIdentity::parse("db-1.db:5432").unwrap(),
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["state"], "retargeting");
        assert_eq!(json["target"], "db-1.db:5432");

        let json = serde_json::to_value(Phase::Settled).unwrap();
        assert_eq!(json["state"], "settled");
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Settled.to_string(), "settled");
        assert_eq!(
            Phase::Degraded {
                reason: "no viable target".into()
            }
            .to_string(),
            "degraded (no viable target)"
        );
        assert!(
            Phase::Degraded {
                reason: String::new()
            }
            .is_degraded()
        );
        assert!(!Phase::Probing.is_degraded());
    }
}
