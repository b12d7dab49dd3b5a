//! Status feed: the orchestrator's read-only list of candidates.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use thiserror::Error;

use warden_core::{BackendIdentity, Role};

/// One candidate as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub identity: BackendIdentity,
    /// Role label the orchestrator last saw. Advisory; probes decide.
    pub last_known_role: Option<Role>,
    /// Orchestrator readiness signal. Advisory; not-ready candidates are
    /// still probed.
    pub ready: bool,
}

impl FeedEntry {
    pub fn new(identity: BackendIdentity) -> Self {
        Self {
            identity,
            last_known_role: None,
            ready: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("status feed unavailable: {0}")]
    Unavailable(String),

    #[error("status feed timed out")]
    Timeout,

    /// An empty listing is treated as a feed fault rather than "every
    /// candidate left", so a glitch cannot wipe the registry.
    #[error("status feed returned no candidates")]
    Empty,
}

/// Boxed future alias for feed listings.
pub type FeedFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<FeedEntry>, FeedError>> + Send + 'a>>;

/// Source of candidate identities, polled at the start of every round.
pub trait StatusFeed: Send + Sync {
    fn list_candidates(&self) -> FeedFuture<'_>;
}

/// A feed backed by a fixed (replaceable) list, e.g. from `warden.toml`.
#[derive(Debug, Default)]
pub struct StaticStatusFeed {
    entries: RwLock<Vec<FeedEntry>>,
}

impl StaticStatusFeed {
    pub fn new(identities: impl IntoIterator<Item = BackendIdentity>) -> Self {
        Self {
            entries: RwLock::new(identities.into_iter().map(FeedEntry::new).collect()),
        }
    }

    pub fn from_entries(entries: Vec<FeedEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Swap the listed candidates (membership change).
    pub fn replace(&self, entries: Vec<FeedEntry>) {
        *self.entries.write().expect("feed lock") = entries;
    }
}

impl StatusFeed for StaticStatusFeed {
    fn list_candidates(&self) -> FeedFuture<'_> {
        let entries = self.entries.read().expect("feed lock").clone();
        Box::pin(async move { Ok(entries) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BackendIdentity {
        BackendIdentity::parse(s).unwrap()
    }

    #[tokio::test]
    async fn static_feed_lists_configured_candidates() {
        let feed = StaticStatusFeed::new([id("db-0:5432"), id("db-1:5432")]);
        let entries = feed.list_candidates().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.ready && e.last_known_role.is_none()));
    }

    #[tokio::test]
    async fn static_feed_replace() {
        let feed = StaticStatusFeed::new([id("db-0:5432")]);
        feed.replace(vec![FeedEntry {
            identity: id("db-2:5432"),
            last_known_role: Some(Role::Replica),
            ready: false,
        }]);
        let entries = feed.list_candidates().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, id("db-2:5432"));
        assert!(!entries[0].ready);
    }
}
