//! Backend registry: the shared, lock-guarded view of known candidates.
//!
//! The registry is `Clone` (backed by `Arc<RwLock<..>>`) and is injected into
//! the prober (the only writer) and the reconciler (a reader). Locks are held
//! only around the map operation itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::identity::BackendIdentity;
use crate::types::BackendCandidate;

/// In-memory map of candidate identity → last-known state.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    candidates: Arc<RwLock<HashMap<BackendIdentity, BackendCandidate>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registry with candidates in the `Unknown` state.
    pub fn with_candidates(identities: impl IntoIterator<Item = BackendIdentity>) -> Self {
        let registry = Self::new();
        for identity in identities {
            registry.upsert(BackendCandidate::unknown(identity));
        }
        registry
    }

    /// Replace the stored record for the candidate's identity.
    pub fn upsert(&self, candidate: BackendCandidate) {
        let mut candidates = self.candidates.write().expect("registry lock");
        debug!(
            identity = %candidate.identity,
            role = %candidate.role,
            health = %candidate.health,
            "registry upsert"
        );
        candidates.insert(candidate.identity.clone(), candidate);
    }

    /// Insert an `Unknown` record unless the identity is already known.
    /// Returns `true` when a new record was created.
    pub fn insert_if_absent(&self, identity: &BackendIdentity) -> bool {
        let mut candidates = self.candidates.write().expect("registry lock");
        if candidates.contains_key(identity) {
            return false;
        }
        candidates.insert(identity.clone(), BackendCandidate::unknown(identity.clone()));
        true
    }

    /// Apply an in-place update to an existing record.
    ///
    /// Returns `false` if the identity is unknown (e.g. removed by a feed
    /// refresh while the probe was in flight); the update is dropped.
    pub fn update<F>(&self, identity: &BackendIdentity, f: F) -> bool
    where
        F: FnOnce(&mut BackendCandidate),
    {
        let mut candidates = self.candidates.write().expect("registry lock");
        match candidates.get_mut(identity) {
            Some(candidate) => {
                f(candidate);
                true
            }
            None => false,
        }
    }

    /// Forget a candidate. Only membership changes reported by the status
    /// feed remove candidates; probe failures never do.
    pub fn remove(&self, identity: &BackendIdentity) -> Option<BackendCandidate> {
        let mut candidates = self.candidates.write().expect("registry lock");
        candidates.remove(identity)
    }

    pub fn get(&self, identity: &BackendIdentity) -> Option<BackendCandidate> {
        let candidates = self.candidates.read().expect("registry lock");
        candidates.get(identity).cloned()
    }

    /// Immutable copy of every known candidate, sorted by identity.
    pub fn snapshot(&self) -> Vec<BackendCandidate> {
        let candidates = self.candidates.read().expect("registry lock");
        let mut out: Vec<BackendCandidate> = candidates.values().cloned().collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Identities currently known, sorted.
    pub fn identities(&self) -> Vec<BackendIdentity> {
        let candidates = self.candidates.read().expect("registry lock");
        let mut out: Vec<BackendIdentity> = candidates.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.candidates.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
