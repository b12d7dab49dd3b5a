//! The reconciliation loop.
//!
//! A single `Reconciler` owns the decision to move the pool. Each tick it
//! refreshes the registry, asks the resolver for a target, promotes a replica
//! if needed, and retargets the pool. Every failure lands in `Degraded`,
//! which retries on the next tick with exponential backoff.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};

use warden_core::{BackendIdentity, Resolution, ResolveError, Role, WardenConfig, resolve};
use warden_health::{FeedError, HealthProber};
use warden_pool::{ConnectionPoolManager, PoolError};

use crate::promoter::{PromotionError, Promoter};
use crate::state::{Phase, ReconcileReport, ReconciliationState, backoff_delay};

/// Loop timing and policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Pause between ticks while settled.
    pub interval: Duration,
    pub promotion_enabled: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            promotion_enabled: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl From<&WardenConfig> for ReconcileConfig {
    fn from(config: &WardenConfig) -> Self {
        Self {
            interval: config.probe.interval,
            promotion_enabled: config.reconcile.promotion_enabled,
            backoff_base: config.reconcile.backoff_base,
            backoff_max: config.reconcile.backoff_max,
        }
    }
}

/// Why a tick ended in `Degraded`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("status feed: {0}")]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("promotion of {identity} failed: {source}")]
    PromotionFailed {
        identity: BackendIdentity,
        #[source]
        source: PromotionError,
    },

    #[error("{0} must be promoted but promotion is disabled")]
    PromotionDisabled(BackendIdentity),

    #[error("promotion of {identity} not confirmed: {observed}")]
    PromotionUnconfirmed {
        identity: BackendIdentity,
        observed: String,
    },

    #[error("could not confirm {identity} through the pool: {source}")]
    Confirm {
        identity: BackendIdentity,
        #[source]
        source: PoolError,
    },

    #[error("pooled connection to {0} failed its ping")]
    ConfirmPing(BackendIdentity),
}

/// Wakes the loop for an out-of-band tick.
///
/// Triggers coalesce: several fires before the loop wakes cause one tick.
#[derive(Debug, Clone, Default)]
pub struct ReconcileTrigger {
    notify: Arc<Notify>,
}

impl ReconcileTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    /// The underlying `Notify`, for wiring into
    /// [`ConnectionPoolManager::with_exhaustion_notify`].
    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub struct Reconciler {
    prober: HealthProber,
    pool: Arc<ConnectionPoolManager>,
    promoter: Arc<dyn Promoter>,
    config: ReconcileConfig,
    phase: Phase,
    state: ReconciliationState,
    last_error: Option<String>,
    reports: watch::Sender<ReconcileReport>,
}

impl Reconciler {
    pub fn new(
        prober: HealthProber,
        pool: Arc<ConnectionPoolManager>,
        promoter: Arc<dyn Promoter>,
        config: ReconcileConfig,
    ) -> Self {
        let (reports, _) = watch::channel(ReconcileReport::default());
        Self {
            prober,
            pool,
            promoter,
            config,
            phase: Phase::Settled,
            state: ReconciliationState::default(),
            last_error: None,
            reports,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    /// Status updates, one per phase transition.
    pub fn subscribe(&self) -> watch::Receiver<ReconcileReport> {
        self.reports.subscribe()
    }

    pub fn report(&self) -> ReconcileReport {
        self.reports.borrow().clone()
    }

    /// How long the loop waits before the next tick.
    pub fn next_delay(&self) -> Duration {
        if self.phase.is_degraded() {
            backoff_delay(
                self.config.backoff_base,
                self.config.backoff_max,
                self.state.consecutive_failures,
            )
        } else {
            self.config.interval
        }
    }

    /// Run one full pass and return where it ended: `Settled` or `Degraded`.
    pub async fn tick(&mut self) -> Phase {
        self.transition(Phase::Probing);

        match self.reconcile().await {
            Ok(()) => {
                if self.state.consecutive_failures > 0 {
                    info!(
                        failures = self.state.consecutive_failures,
                        "reconciliation recovered"
                    );
                }
                self.state.consecutive_failures = 0;
                self.last_error = None;
                self.transition(Phase::Settled);
            }
            Err(e) => {
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                let retry_in = backoff_delay(
                    self.config.backoff_base,
                    self.config.backoff_max,
                    self.state.consecutive_failures,
                );
                error!(
                    error = %e,
                    consecutive_failures = self.state.consecutive_failures,
                    ?retry_in,
                    "reconciliation degraded"
                );
                let reason = e.to_string();
                self.last_error = Some(reason.clone());
                self.transition(Phase::Degraded { reason });
            }
        }

        self.phase.clone()
    }

    /// Tick on the interval (or the backoff delay while degraded) and on
    /// every trigger, until `shutdown` flips. Triggers are held back while
    /// degraded so a burst of pool exhaustion cannot defeat the backoff.
    pub async fn run(&mut self, trigger: ReconcileTrigger, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.interval,
            promotion_enabled = self.config.promotion_enabled,
            "reconciliation loop started"
        );

        loop {
            self.tick().await;

            let degraded = self.phase.is_degraded();
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = trigger.notified(), if !degraded => {
                    debug!("out-of-band reconciliation triggered");
                }
                _ = shutdown.changed() => {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile(&mut self) -> Result<(), ReconcileError> {
        let summary = self.prober.refresh().await?;
        debug!(
            probed = summary.probed,
            healthy = summary.healthy,
            "registry refreshed"
        );

        self.transition(Phase::Resolving);
        let resolution = resolve(&self.prober.registry().snapshot())?;
        self.state.last_desired_target = Some(resolution.identity().clone());

        let target = match resolution {
            Resolution::Select(identity) => identity,
            Resolution::PromotionRequired(candidate) => {
                self.transition(Phase::PromotionPending {
                    candidate: candidate.clone(),
                });
                self.promote(&candidate).await?;
                candidate
            }
        };

        let already_targeted = self
            .pool
            .current_target()
            .is_some_and(|current| current.identity == target);
        if already_targeted {
            // A previous retarget may never have been confirmed.
            if self.state.consecutive_failures > 0 {
                self.confirm(&target).await?;
            }
            debug!(%target, "pool already on desired target");
            return Ok(());
        }

        self.transition(Phase::Retargeting {
            target: target.clone(),
        });
        let generation = self.pool.retarget(target.clone()).await;
        self.state.last_action_at = Some(SystemTime::now());
        self.publish();
        info!(%target, generation, "pool retargeted by reconciler");

        self.confirm(&target).await
    }

    /// Promote `candidate`, then re-probe it and re-resolve. Success only
    /// if the resolver now selects it outright.
    async fn promote(&self, candidate: &BackendIdentity) -> Result<(), ReconcileError> {
        if !self.config.promotion_enabled {
            return Err(ReconcileError::PromotionDisabled(candidate.clone()));
        }

        info!(%candidate, "promoting replica");
        let outcome = self
            .promoter
            .promote(candidate)
            .await
            .map_err(|source| ReconcileError::PromotionFailed {
                identity: candidate.clone(),
                source,
            })?;
        info!(%candidate, ?outcome, "promotion call returned");

        let unconfirmed = |observed: String| ReconcileError::PromotionUnconfirmed {
            identity: candidate.clone(),
            observed,
        };

        match self.prober.probe_one(candidate).await {
            Ok(Role::Primary) => {}
            Ok(role) => return Err(unconfirmed(format!("re-probe reports role {role}"))),
            Err(e) => return Err(unconfirmed(format!("re-probe failed: {e}"))),
        }

        match resolve(&self.prober.registry().snapshot())? {
            Resolution::Select(selected) if &selected == candidate => Ok(()),
            other => Err(unconfirmed(format!("resolver now says {other}"))),
        }
    }

    /// One round trip through the pool: acquire, ping, release.
    async fn confirm(&self, target: &BackendIdentity) -> Result<(), ReconcileError> {
        let mut conn = self
            .pool
            .acquire_default()
            .await
            .map_err(|source| ReconcileError::Confirm {
                identity: target.clone(),
                source,
            })?;
        let alive = conn.ping().await;
        let generation = conn.generation();
        self.pool.release(conn).await;

        if alive {
            debug!(%target, generation, "target confirmed through pool");
            Ok(())
        } else {
            Err(ReconcileError::ConfirmPing(target.clone()))
        }
    }

    fn transition(&mut self, next: Phase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "phase transition");
        }
        self.phase = next;
        self.publish();
    }

    fn publish(&self) {
        let target = self.pool.current_target();
        self.reports.send_replace(ReconcileReport {
            phase: self.phase.clone(),
            generation: target.as_ref().map_or(0, |t| t.generation),
            target: target.map(|t| t.identity),
            last_desired_target: self.state.last_desired_target.clone(),
            consecutive_failures: self.state.consecutive_failures,
            last_error: self.last_error.clone(),
        });
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
