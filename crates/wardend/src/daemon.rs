//! Subsystem assembly for each subcommand.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use warden_core::{BackendRegistry, Resolution, WardenConfig, resolve};
use warden_health::{HealthProber, HttpRoleProbe, StaticStatusFeed};
use warden_pool::{ConnectionPoolManager, PoolConfig, PoolFrontend, TcpConnectionFactory};
use warden_reconcile::{HttpPromoter, Phase, ReconcileConfig, ReconcileTrigger, Reconciler};

/// How often pool statistics are logged while running.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn load(path: &Path) -> anyhow::Result<WardenConfig> {
    WardenConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn build_prober(config: &WardenConfig) -> HealthProber {
    let registry = BackendRegistry::with_candidates(config.candidates.iter().cloned());
    let feed = Arc::new(StaticStatusFeed::new(config.candidates.iter().cloned()));
    let probe = Arc::new(HttpRoleProbe::new(config.probe.admin_port));
    HealthProber::new(registry, feed, probe)
        .with_timeouts(config.probe.timeout, config.probe.round_timeout)
}

pub async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    info!(
        candidates = config.candidates.len(),
        capacity = config.pool.capacity,
        listen = %config.listen.address,
        "warden daemon starting"
    );

    // ── Subsystems ────────────────────────────────────────────────

    let trigger = ReconcileTrigger::new();
    let pool = Arc::new(
        ConnectionPoolManager::new(
            PoolConfig::from(&config.pool),
            Arc::new(TcpConnectionFactory::default()),
        )
        .with_exhaustion_notify(trigger.notify_handle()),
    );
    let promoter = Arc::new(HttpPromoter::new(config.probe.admin_port));
    let mut reconciler = Reconciler::new(
        build_prober(&config),
        Arc::clone(&pool),
        promoter,
        ReconcileConfig::from(&config),
    );
    let reports = reconciler.subscribe();

    let listener = tokio::net::TcpListener::bind(config.listen.address)
        .await
        .with_context(|| format!("binding {}", config.listen.address))?;

    // ── Background tasks ──────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            reconciler.run(trigger, shutdown).await;
        })
    };

    let reaper_handle = {
        let pool = Arc::clone(&pool);
        let shutdown = shutdown_rx.clone();
        let interval = (config.pool.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            pool.run_reaper(interval, shutdown).await;
        })
    };

    let stats_handle = {
        let pool = Arc::clone(&pool);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STATS_INTERVAL) => pool.log_stats(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let frontend_handle = {
        let frontend = PoolFrontend::new(Arc::clone(&pool));
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            frontend.serve(listener, shutdown).await;
        })
    };

    let status_handle = tokio::spawn(log_status_changes(reports, shutdown_rx));

    // ── Shutdown ──────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconcile_handle.await;
    let _ = reaper_handle.await;
    let _ = stats_handle.await;
    let _ = status_handle.await;
    let _ = frontend_handle.await;

    pool.drain().await;
    pool.log_stats();
    info!("warden daemon stopped");
    Ok(())
}

/// Log one line whenever the loop settles somewhere new or degrades.
async fn log_status_changes(
    mut reports: watch::Receiver<warden_reconcile::ReconcileReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last: Option<(Phase, u64)> = None;
    loop {
        tokio::select! {
            changed = reports.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }

        let report = reports.borrow_and_update().clone();
        if !matches!(report.phase, Phase::Settled | Phase::Degraded { .. }) {
            continue;
        }
        let key = (report.phase.clone(), report.generation);
        if last.as_ref() == Some(&key) {
            continue;
        }
        match &report.phase {
            Phase::Degraded { reason } => warn!(
                %reason,
                consecutive_failures = report.consecutive_failures,
                target = ?report.target.as_ref().map(|t| t.as_str()),
                "status: degraded"
            ),
            _ => info!(
                target = ?report.target.as_ref().map(|t| t.as_str()),
                generation = report.generation,
                "status: settled"
            ),
        }
        last = Some(key);
    }
}

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let out = serde_json::json!({
        "config": config,
        "warnings": config.warnings(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn probe(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let prober = build_prober(&config);

    let summary = prober.refresh().await.context("probing candidates")?;
    let snapshot = prober.registry().snapshot();
    let decision = match resolve(&snapshot) {
        Ok(Resolution::Select(identity)) => serde_json::json!({ "select": identity }),
        Ok(Resolution::PromotionRequired(identity)) => {
            serde_json::json!({ "promotion_required": identity })
        }
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };

    let out = serde_json::json!({
        "probed": summary.probed,
        "healthy": summary.healthy,
        "candidates": snapshot,
        "decision": decision,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
