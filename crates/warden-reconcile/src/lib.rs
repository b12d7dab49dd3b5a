//! warden-reconcile: keeps the connection pool pointed at the primary.
//!
//! # Architecture
//!
//! ```text
//! Reconciler::run()
//!   ├── every interval / ReconcileTrigger::fire()
//!   └── tick()
//!         Probing      → HealthProber::refresh()
//!         Resolving    → resolve(registry snapshot)
//!         PromotionPending (no healthy primary)
//!                      → Promoter::promote(replica), re-probe, re-resolve
//!         Retargeting  → ConnectionPoolManager::retarget(), acquire + ping
//!         Settled | Degraded
//! ```
//!
//! The reconciler is the only caller of `retarget`. Each transition is
//! published as a [`ReconcileReport`] on a watch channel.

pub mod promoter;
pub mod reconciler;
pub mod state;

pub use promoter::{HttpPromoter, PromoteFuture, PromotionError, PromotionOutcome, Promoter};
pub use reconciler::{ReconcileConfig, ReconcileError, ReconcileTrigger, Reconciler};
pub use state::{Phase, ReconcileReport, ReconciliationState, backoff_delay};
