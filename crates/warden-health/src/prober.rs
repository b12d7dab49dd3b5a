//! Health prober: refreshes the registry from the feed and role probes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_core::{BackendIdentity, BackendRegistry, Health, Role};

use crate::feed::{FeedError, StatusFeed};
use crate::probe::{ProbeError, RoleProbe};

/// Counts from one probing round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub ambiguous: usize,
    pub timed_out: usize,
    pub discovered: usize,
    pub removed: usize,
}

/// Probes candidates and records the results in the registry.
///
/// The prober is the registry's only writer. It never holds the registry
/// lock across a probe; results are written one at a time as they arrive.
pub struct HealthProber {
    registry: BackendRegistry,
    feed: Arc<dyn StatusFeed>,
    probe: Arc<dyn RoleProbe>,
    probe_timeout: Duration,
    round_timeout: Duration,
}

impl HealthProber {
    pub fn new(
        registry: BackendRegistry,
        feed: Arc<dyn StatusFeed>,
        probe: Arc<dyn RoleProbe>,
    ) -> Self {
        Self {
            registry,
            feed,
            probe,
            probe_timeout: Duration::from_secs(2),
            round_timeout: Duration::from_secs(4),
        }
    }

    /// Set the per-probe deadline and the whole-round ceiling.
    pub fn with_timeouts(mut self, probe_timeout: Duration, round_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self.round_timeout = round_timeout.max(probe_timeout);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Probe a candidate without recording anything.
    ///
    /// Success always carries `Health::Healthy`.
    pub async fn probe(&self, identity: &BackendIdentity) -> Result<(Role, Health), ProbeError> {
        probe_with_deadline(self.probe.as_ref(), identity, self.probe_timeout)
            .await
            .map(|role| (role, Health::Healthy))
    }

    /// Out-of-band re-check of one candidate; the result is recorded.
    pub async fn probe_one(&self, identity: &BackendIdentity) -> Result<Role, ProbeError> {
        let result = probe_with_deadline(self.probe.as_ref(), identity, self.probe_timeout).await;
        record(&self.registry, identity, &result);
        result
    }

    /// Run one full probing round.
    ///
    /// Fails only when the status feed cannot be read; probe failures are
    /// recorded per candidate and counted in the summary.
    pub async fn refresh(&self) -> Result<RefreshSummary, FeedError> {
        let deadline = Instant::now() + self.round_timeout;
        let mut summary = RefreshSummary::default();

        let entries = tokio::time::timeout_at(deadline, self.feed.list_candidates())
            .await
            .map_err(|_| FeedError::Timeout)??;
        if entries.is_empty() {
            return Err(FeedError::Empty);
        }

        // Membership.
        let listed: HashSet<BackendIdentity> = entries.iter().map(|e| e.identity.clone()).collect();
        for entry in &entries {
            if self.registry.insert_if_absent(&entry.identity) {
                if let Some(role) = entry.last_known_role {
                    self.registry.update(&entry.identity, |c| c.role = role);
                }
                info!(identity = %entry.identity, ready = entry.ready, "discovered candidate");
                summary.discovered += 1;
            }
        }
        for identity in self.registry.identities() {
            if !listed.contains(&identity) {
                self.registry.remove(&identity);
                info!(%identity, "candidate no longer listed by status feed");
                summary.removed += 1;
            }
        }

        // Probes.
        let mut pending: HashSet<BackendIdentity> = listed;
        let mut tasks = JoinSet::new();
        for identity in pending.iter().cloned() {
            let probe = Arc::clone(&self.probe);
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                let result = probe_with_deadline(probe.as_ref(), &identity, timeout).await;
                (identity, result)
            });
        }
        summary.probed = pending.len();

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((identity, result)))) => {
                    pending.remove(&identity);
                    record(&self.registry, &identity, &result);
                    tally(&mut summary, &result);
                }
                Ok(Some(Err(e))) => {
                    // Panicked probe task; its candidate stays pending and
                    // is recorded as timed out below.
                    warn!(error = %e, "probe task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = pending.len(), "probe round hit its ceiling");
                    tasks.abort_all();
                    break;
                }
            }
        }

        for identity in pending {
            let result = Err(ProbeError::Timeout);
            record(&self.registry, &identity, &result);
            tally(&mut summary, &result);
        }

        debug!(
            probed = summary.probed,
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            ambiguous = summary.ambiguous,
            timed_out = summary.timed_out,
            "probe round complete"
        );
        Ok(summary)
    }
}

async fn probe_with_deadline(
    probe: &dyn RoleProbe,
    identity: &BackendIdentity,
    timeout: Duration,
) -> Result<Role, ProbeError> {
    match tokio::time::timeout(timeout, probe.probe(identity)).await {
        Ok(Ok(Role::Unknown)) => Err(ProbeError::Ambiguous("probe reported unknown role".into())),
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout),
    }
}

fn record(registry: &BackendRegistry, identity: &BackendIdentity, result: &Result<Role, ProbeError>) {
    let now = SystemTime::now();
    let applied = registry.update(identity, |c| match result {
        Ok(role) => c.observe(*role, now),
        Err(ProbeError::Timeout) | Err(ProbeError::Unreachable(_)) => c.mark_unhealthy(now),
        Err(ProbeError::Ambiguous(_)) => c.mark_ambiguous(now),
    });

    match result {
        Ok(role) => debug!(%identity, %role, applied, "probe succeeded"),
        Err(e) => warn!(%identity, error = %e, applied, "probe failed"),
    }
}

fn tally(summary: &mut RefreshSummary, result: &Result<Role, ProbeError>) {
    match result {
        Ok(_) => summary.healthy += 1,
        Err(ProbeError::Timeout) => summary.timed_out += 1,
        Err(ProbeError::Unreachable(_)) => summary.unhealthy += 1,
        Err(ProbeError::Ambiguous(_)) => summary.ambiguous += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedEntry, FeedFuture, StaticStatusFeed};
    use crate::probe::ProbeFuture;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Mock probe ───────────────────────────────────────────────────

    #[derive(Clone)]
    enum Script {
        Role(Role),
        Fail(ProbeError),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedProbe {
        scripts: Mutex<HashMap<String, Script>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn set(&self, identity: &str, script: Script) {
            self.scripts
                .lock()
                .unwrap()
                .insert(id(identity).to_string(), script);
        }
    }

    impl RoleProbe for ScriptedProbe {
        fn probe<'a>(&'a self, identity: &'a BackendIdentity) -> ProbeFuture<'a> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(identity.as_str())
                .cloned()
                .unwrap_or(Script::Fail(ProbeError::Unreachable("no script".into())));
            Box::pin(async move {
                match script {
                    Script::Role(role) => Ok(role),
                    Script::Fail(e) => Err(e),
                    Script::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Role::Primary)
                    }
                }
            })
        }
    }

    struct BrokenFeed;

    impl StatusFeed for BrokenFeed {
        fn list_candidates(&self) -> FeedFuture<'_> {
            Box::pin(async { Err(FeedError::Unavailable("api down".into())) })
        }
    }

    fn id(s: &str) -> BackendIdentity {
        BackendIdentity::parse(s).unwrap()
    }

    fn prober(names: &[&str], probe: Arc<ScriptedProbe>) -> (HealthProber, Arc<StaticStatusFeed>) {
        let feed = Arc::new(StaticStatusFeed::new(names.iter().map(|n| id(n))));
        let prober = HealthProber::new(BackendRegistry::new(), feed.clone(), probe)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(300));
        (prober, feed)
    }

    #[tokio::test]
    async fn refresh_discovers_and_records_roles() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Primary));
        probe.set("b:5432", Script::Role(Role::Replica));
        let (prober, _feed) = prober(&["a:5432", "b:5432"], probe.clone());

        let summary = prober.refresh().await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.probed, 2);
        assert_eq!(summary.healthy, 2);

        let a = prober.registry().get(&id("a:5432")).unwrap();
        assert!(a.is_healthy_primary());
        assert!(a.last_healthy_at.is_some());
        let b = prober.registry().get(&id("b:5432")).unwrap();
        assert!(b.is_healthy_replica());
        assert_eq!(probe.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn failures_mark_unhealthy_but_keep_candidate() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Primary));
        let (prober, _feed) = prober(&["a:5432"], probe.clone());
        prober.refresh().await.unwrap();

        probe.set("a:5432", Script::Fail(ProbeError::Unreachable("refused".into())));
        let summary = prober.refresh().await.unwrap();
        assert_eq!(summary.unhealthy, 1);

        let a = prober.registry().get(&id("a:5432")).unwrap();
        assert_eq!(a.health, Health::Unhealthy);
        assert_eq!(a.role, Role::Primary);
        assert_eq!(prober.registry().len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_role_becomes_unknown() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Fail(ProbeError::Ambiguous("both 503".into())));
        probe.set("b:5432", Script::Role(Role::Unknown));
        let (prober, _feed) = prober(&["a:5432", "b:5432"], probe);

        let summary = prober.refresh().await.unwrap();
        assert_eq!(summary.ambiguous, 2);
        for name in ["a:5432", "b:5432"] {
            let c = prober.registry().get(&id(name)).unwrap();
            assert_eq!(c.role, Role::Unknown);
            assert_eq!(c.health, Health::Unknown);
        }
    }

    #[tokio::test]
    async fn hung_probe_times_out_without_stalling_round() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Primary));
        probe.set("b:5432", Script::Hang);
        let (prober, _feed) = prober(&["a:5432", "b:5432"], probe);

        let started = std::time::Instant::now();
        let summary = prober.refresh().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(
            prober.registry().get(&id("b:5432")).unwrap().health,
            Health::Unhealthy
        );
    }

    #[tokio::test]
    async fn round_ceiling_aborts_pending_probes() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Hang);
        let feed = Arc::new(StaticStatusFeed::new([id("a:5432")]));
        // Per-probe deadline longer than the round: the ceiling wins.
        let prober = HealthProber::new(BackendRegistry::new(), feed, probe);
        let prober = HealthProber {
            probe_timeout: Duration::from_secs(60),
            round_timeout: Duration::from_millis(100),
            ..prober
        };

        let started = std::time::Instant::now();
        let summary = prober.refresh().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary.timed_out, 1);
    }

    #[tokio::test]
    async fn feed_membership_changes() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Primary));
        probe.set("c:5432", Script::Role(Role::Replica));
        let (prober, feed) = prober(&["a:5432", "b:5432"], probe);
        prober.refresh().await.unwrap();
        assert_eq!(prober.registry().len(), 2);

        feed.replace(vec![
            FeedEntry::new(id("a:5432")),
            FeedEntry {
                identity: id("c:5432"),
                last_known_role: Some(Role::Replica),
                ready: false,
            },
        ]);
        let summary = prober.refresh().await.unwrap();
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.removed, 1);
        assert!(prober.registry().get(&id("b:5432")).is_none());
        assert!(prober.registry().get(&id("c:5432")).unwrap().is_healthy_replica());
    }

    #[tokio::test]
    async fn empty_feed_leaves_registry_alone() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Primary));
        let (prober, feed) = prober(&["a:5432"], probe);
        prober.refresh().await.unwrap();

        feed.replace(vec![]);
        assert_eq!(prober.refresh().await, Err(FeedError::Empty));
        assert_eq!(prober.registry().len(), 1);
    }

    #[tokio::test]
    async fn broken_feed_is_an_error() {
        let probe = Arc::new(ScriptedProbe::default());
        let prober = HealthProber::new(BackendRegistry::new(), Arc::new(BrokenFeed), probe);
        assert!(matches!(prober.refresh().await, Err(FeedError::Unavailable(_))));
    }

    #[tokio::test]
    async fn probe_one_records_and_probe_does_not() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a:5432", Script::Role(Role::Replica));
        let (prober, _feed) = prober(&["a:5432"], probe.clone());
        prober.refresh().await.unwrap();

        probe.set("a:5432", Script::Role(Role::Primary));
        assert_eq!(
            prober.probe(&id("a:5432")).await,
            Ok((Role::Primary, Health::Healthy))
        );
        assert_eq!(prober.registry().get(&id("a:5432")).unwrap().role, Role::Replica);

        assert_eq!(prober.probe_one(&id("a:5432")).await, Ok(Role::Primary));
        assert!(prober.registry().get(&id("a:5432")).unwrap().is_healthy_primary());
    }
}
