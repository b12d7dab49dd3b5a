//! warden-health: health probing for backend candidates.
//!
//! # Architecture
//!
//! ```text
//! HealthProber::refresh()
//!   ├── StatusFeed::list_candidates()      → discover / forget candidates
//!   ├── JoinSet of RoleProbe::probe()      → one task per candidate,
//!   │                                        each bounded by probe_timeout
//!   └── BackendRegistry::update()          → role + health per result
//! ```
//!
//! The whole round is bounded by `round_timeout`; probes still pending at the
//! ceiling are aborted and recorded as [`ProbeError::Timeout`]. A failed probe
//! marks the candidate unhealthy but never removes it.

pub mod feed;
pub mod http;
pub mod probe;
pub mod prober;

pub use feed::{FeedEntry, FeedError, FeedFuture, StaticStatusFeed, StatusFeed};
pub use probe::{HttpRoleProbe, ProbeError, ProbeFuture, RoleProbe};
pub use prober::{HealthProber, RefreshSummary};
