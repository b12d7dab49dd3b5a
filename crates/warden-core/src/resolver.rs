//! Target resolution policy.
//!
//! `resolve` is a pure function of a registry snapshot: the same snapshot
//! always yields the same decision, including tie-breaks.
//!
//! Rules, in priority order:
//!
//! 1. Several healthy primaries → [`ResolveError::AmbiguousPrimary`]. A
//!    split brain is surfaced, never settled by picking one.
//! 2. Exactly one healthy primary → [`Resolution::Select`].
//! 3. No healthy primary but a healthy replica → [`Resolution::PromotionRequired`]
//!    for the replica with the most recent successful probe (lowest identity
//!    on a tie). Advisory only; the caller decides whether to promote.
//! 4. Otherwise → [`ResolveError::NoViableTarget`].

use std::cmp::Reverse;
use std::fmt;

use thiserror::Error;

use crate::identity::BackendIdentity;
use crate::types::BackendCandidate;

/// A successful resolver decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Route the pool to this healthy primary.
    Select(BackendIdentity),
    /// No primary is usable; this replica is the best promotion target.
    PromotionRequired(BackendIdentity),
}

impl Resolution {
    pub fn identity(&self) -> &BackendIdentity {
        match self {
            Resolution::Select(id) | Resolution::PromotionRequired(id) => id,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Select(id) => write!(f, "select {id}"),
            Resolution::PromotionRequired(id) => write!(f, "promotion required for {id}"),
        }
    }
}

/// Snapshots with no safe target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no viable target among {candidates} candidate(s)")]
    NoViableTarget { candidates: usize },

    #[error("ambiguous primary: {} healthy candidates claim the primary role", .0.len())]
    AmbiguousPrimary(Vec<BackendIdentity>),
}

/// Decide which candidate the pool should target.
pub fn resolve(snapshot: &[BackendCandidate]) -> Result<Resolution, ResolveError> {
    let mut primaries: Vec<&BackendCandidate> =
        snapshot.iter().filter(|c| c.is_healthy_primary()).collect();

    if primaries.len() > 1 {
        primaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        return Err(ResolveError::AmbiguousPrimary(
            primaries.into_iter().map(|c| c.identity.clone()).collect(),
        ));
    }

    if let Some(primary) = primaries.first() {
        return Ok(Resolution::Select(primary.identity.clone()));
    }

    snapshot
        .iter()
        .filter(|c| c.is_healthy_replica())
        .max_by(|a, b| {
            (a.last_healthy_at, Reverse(&a.identity)).cmp(&(b.last_healthy_at, Reverse(&b.identity)))
        })
        .map(|c| Resolution::PromotionRequired(c.identity.clone()))
        .ok_or(ResolveError::NoViableTarget {
            candidates: snapshot.len(),
        })
}
