//! Connection pool manager.
//!
//! Capacity is a semaphore: every `InUse` connection holds one permit, so
//! `in_use <= capacity` and a new connection is only opened when no idle
//! connection of the current generation exists, which keeps
//! `idle + in_use <= capacity`. Connections of a previous generation that are
//! still checked out keep their permit until released.
//!
//! Internal state sits behind a `std::sync::Mutex` that is never held across
//! an `.await`; connects, resets and closes run outside it. Anything decided
//! under the lock is re-checked under the lock after an `.await`, because a
//! retarget may have happened in between.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_core::{BackendIdentity, PoolSection};

use crate::backend::{ConnectionBackend, ConnectionFactory};

/// Configuration for the connection pool manager.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Maximum connections, idle plus in use (default: 20).
    pub capacity: usize,
    /// Connections older than this are closed instead of reused (default: 30m).
    pub max_lifetime: Duration,
    /// Idle connections unused for longer are reaped (default: 300s).
    pub idle_timeout: Duration,
    /// Deadline for the factory to open a connection (default: 3s).
    pub connect_timeout: Duration,
    /// Wait used by [`ConnectionPoolManager::acquire_default`] (default: 5s).
    pub acquire_timeout: Duration,
    /// Reset session state on release (default: true).
    pub reset_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSection::default())
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            capacity: section.capacity,
            max_lifetime: section.max_lifetime,
            idle_timeout: section.idle_timeout,
            connect_timeout: section.connect_timeout,
            acquire_timeout: section.acquire_timeout,
            reset_on_release: section.reset_on_release,
        }
    }
}

/// The identity live connections are bound to, and its generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolTarget {
    pub identity: BackendIdentity,
    /// Incremented on every retarget. Generation 0 means "never targeted".
    pub generation: u64,
}

/// Lifecycle of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    InUse,
    /// Checked out but superseded by a retarget, or being closed.
    Draining,
    Closed,
}

/// Errors returned by [`ConnectionPoolManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool has no target yet")]
    NoTarget,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("connecting to {0} timed out")]
    ConnectTimeout(BackendIdentity),

    #[error("connecting to {identity} failed: {reason}")]
    Connect {
        identity: BackendIdentity,
        reason: String,
    },

    #[error("connection pool is draining")]
    Draining,
}

/// One unit of checked-out capacity. Dropping it gives the capacity back.
struct Lease {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Lease {
    fn new(permit: OwnedSemaphorePermit, in_use: &Arc<AtomicUsize>) -> Self {
        in_use.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            in_use: Arc::clone(in_use),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A backend connection, tagged with the generation it was created under.
///
/// While checked out it holds one unit of pool capacity; dropping it without
/// calling [`ConnectionPoolManager::release`] closes the transport and frees
/// that capacity.
pub struct PooledConnection {
    id: u64,
    identity: BackendIdentity,
    generation: u64,
    state: ConnState,
    created_at: Instant,
    last_used_at: Instant,
    backend: Box<dyn ConnectionBackend>,
    lease: Option<Lease>,
    pool_generation: Arc<AtomicU64>,
}

impl PooledConnection {
    fn new(
        id: u64,
        target: &PoolTarget,
        backend: Box<dyn ConnectionBackend>,
        lease: Lease,
        pool_generation: Arc<AtomicU64>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity: target.identity.clone(),
            generation: target.generation,
            state: ConnState::InUse,
            created_at: now,
            last_used_at: now,
            backend,
            lease: Some(lease),
            pool_generation,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity this connection was opened against.
    pub fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lifecycle state. A checked-out connection whose generation has been
    /// superseded reports `Draining`; it is closed when released.
    pub fn state(&self) -> ConnState {
        if self.state == ConnState::InUse && self.is_stale() {
            ConnState::Draining
        } else {
            self.state
        }
    }

    /// True once the pool has been retargeted past this connection's generation.
    pub fn is_stale(&self) -> bool {
        self.generation < self.pool_generation.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Direct access to the transport.
    pub fn backend_mut(&mut self) -> &mut dyn ConnectionBackend {
        self.backend.as_mut()
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        self.last_used_at = Instant::now();
        self.backend.send(data).await
    }

    pub async fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        self.last_used_at = Instant::now();
        self.backend.recv(max_bytes).await
    }

    pub async fn ping(&mut self) -> bool {
        self.backend.ping().await
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() >= config.max_lifetime
            || self.last_used_at.elapsed() >= config.idle_timeout
    }

    fn check_out(&mut self, lease: Lease) {
        self.state = ConnState::InUse;
        self.last_used_at = Instant::now();
        self.lease = Some(lease);
    }

    async fn close(&mut self) {
        self.state = ConnState::Draining;
        self.backend.close().await;
        self.state = ConnState::Closed;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Pool-level statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub target: Option<BackendIdentity>,
    pub generation: u64,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections checked out, including stale ones from older generations.
    pub in_use: usize,
    pub capacity: usize,
    /// Acquires that found the pool exhausted or timed out.
    pub wait_count: u64,
    pub created: u64,
    pub closed: u64,
}

#[derive(Default)]
struct PoolState {
    target: Option<PoolTarget>,
    idle: VecDeque<PooledConnection>,
    draining: bool,
    next_id: u64,
    wait_count: u64,
    created: u64,
    closed: u64,
}

impl PoolState {
    fn generation(&self) -> u64 {
        self.target.as_ref().map_or(0, |t| t.generation)
    }
}

/// Owns the bounded set of connections and the current [`PoolTarget`].
pub struct ConnectionPoolManager {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    /// Mirror of the current generation, readable by connections.
    generation: Arc<AtomicU64>,
    in_use: Arc<AtomicUsize>,
    on_exhausted: Option<Arc<Notify>>,
}

impl ConnectionPoolManager {
    /// Create a pool with no target; `acquire` fails with
    /// [`PoolError::NoTarget`] until the first [`retarget`](Self::retarget).
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.capacity)),
            config,
            factory,
            state: Mutex::new(PoolState {
                next_id: 1,
                ..PoolState::default()
            }),
            generation: Arc::new(AtomicU64::new(0)),
            in_use: Arc::new(AtomicUsize::new(0)),
            on_exhausted: None,
        }
    }

    /// Signal `notify` whenever an acquire finds the pool exhausted.
    pub fn with_exhaustion_notify(mut self, notify: Arc<Notify>) -> Self {
        self.on_exhausted = Some(notify);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state lock")
    }

    pub fn current_target(&self) -> Option<PoolTarget> {
        self.lock().target.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation()
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Acquire with the configured `acquire_timeout`.
    pub async fn acquire_default(&self) -> Result<PooledConnection, PoolError> {
        self.acquire(self.config.acquire_timeout).await
    }

    /// Check out a connection bound to the current generation.
    ///
    /// Never blocks longer than `timeout`, including time spent opening a
    /// new connection. A zero timeout never waits for capacity and reports
    /// [`PoolError::PoolExhausted`]; a non-zero timeout that elapses reports
    /// [`PoolError::AcquireTimeout`]. Dropping the returned future gives back
    /// any capacity it had reserved.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + timeout;
        {
            let state = self.lock();
            if state.draining {
                return Err(PoolError::Draining);
            }
            if state.target.is_none() {
                return Err(PoolError::NoTarget);
            }
        }

        let permit = if timeout.is_zero() {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(tokio::sync::TryAcquireError::Closed) => return Err(PoolError::Draining),
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    self.note_exhausted();
                    return Err(PoolError::PoolExhausted);
                }
            }
        } else {
            match tokio::time::timeout_at(deadline, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Draining),
                Err(_) => {
                    self.note_exhausted();
                    return Err(PoolError::AcquireTimeout(timeout));
                }
            }
        };

        loop {
            let (target, reusable, expired) = self.take_idle()?;
            close_all(expired).await;

            if let Some(mut conn) = reusable {
                // Closing the expired ones yielded; re-check before handing out.
                let verdict = {
                    let state = self.lock();
                    if state.draining {
                        Err(PoolError::Draining)
                    } else if state.generation() != conn.generation {
                        Ok(())
                    } else {
                        conn.check_out(Lease::new(permit, &self.in_use));
                        debug!(
                            id = conn.id,
                            identity = %conn.identity,
                            generation = conn.generation,
                            "reused idle connection from pool"
                        );
                        return Ok(conn);
                    }
                };

                conn.close().await;
                self.lock().closed += 1;
                verdict?;
                debug!(
                    id = conn.id,
                    generation = conn.generation,
                    "discarded idle connection superseded by retarget"
                );
                if Instant::now() >= deadline {
                    return Err(PoolError::AcquireTimeout(timeout));
                }
                continue;
            }

            let connect_deadline = (Instant::now() + self.config.connect_timeout).min(deadline);
            let backend = match tokio::time::timeout_at(
                connect_deadline,
                self.factory.connect(&target.identity),
            )
            .await
            {
                Ok(Ok(backend)) => backend,
                Ok(Err(reason)) => {
                    warn!(identity = %target.identity, %reason, "connect failed");
                    return Err(PoolError::Connect {
                        identity: target.identity,
                        reason,
                    });
                }
                Err(_) if connect_deadline >= deadline => {
                    warn!(identity = %target.identity, ?timeout, "connect outlasted acquire timeout");
                    return Err(PoolError::AcquireTimeout(timeout));
                }
                Err(_) => {
                    warn!(identity = %target.identity, "connect timed out");
                    return Err(PoolError::ConnectTimeout(target.identity));
                }
            };

            // The target may have moved while we were connecting.
            let outcome = {
                let mut state = self.lock();
                if state.draining {
                    state.closed += 1;
                    Err(PoolError::Draining)
                } else if state.generation() != target.generation {
                    state.closed += 1;
                    Ok(None)
                } else {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.created += 1;
                    Ok(Some(id))
                }
            };

            match outcome {
                Ok(Some(id)) => {
                    let conn = PooledConnection::new(
                        id,
                        &target,
                        backend,
                        Lease::new(permit, &self.in_use),
                        Arc::clone(&self.generation),
                    );
                    debug!(
                        id,
                        identity = %target.identity,
                        generation = target.generation,
                        "created new connection"
                    );
                    return Ok(conn);
                }
                Ok(None) => {
                    let mut backend = backend;
                    backend.close().await;
                    debug!(
                        identity = %target.identity,
                        generation = target.generation,
                        "discarded connection opened against a superseded target"
                    );
                    if Instant::now() >= deadline {
                        return Err(PoolError::AcquireTimeout(timeout));
                    }
                }
                Err(e) => {
                    let mut backend = backend;
                    backend.close().await;
                    return Err(e);
                }
            }
        }
    }

    /// Pop the most recently used idle connection, closing expired ones.
    fn take_idle(
        &self,
    ) -> Result<(PoolTarget, Option<PooledConnection>, Vec<PooledConnection>), PoolError> {
        let mut state = self.lock();
        if state.draining {
            return Err(PoolError::Draining);
        }
        let target = state.target.clone().ok_or(PoolError::NoTarget)?;

        let mut expired = Vec::new();
        let mut reusable = None;
        while let Some(conn) = state.idle.pop_back() {
            assert_eq!(
                conn.generation, target.generation,
                "idle connection {} belongs to generation {} but current is {}",
                conn.id, conn.generation, target.generation
            );
            if conn.is_expired(&self.config) {
                expired.push(conn);
                continue;
            }
            reusable = Some(conn);
            break;
        }
        state.closed += expired.len() as u64;
        Ok((target, reusable, expired))
    }

    /// Return a connection to the pool.
    ///
    /// Only a connection of the current generation that is not expired (and
    /// resets cleanly, if configured) goes back to `Idle`. Anything else is
    /// drained and closed; a stale connection is never reused.
    pub async fn release(&self, mut conn: PooledConnection) {
        let lease = conn.lease.take();

        let mut recycle = {
            let state = self.lock();
            let current = state.generation();
            assert!(
                conn.generation <= current,
                "connection {} claims generation {} but current is {}",
                conn.id,
                conn.generation,
                current
            );
            !state.draining && conn.generation == current && !conn.is_expired(&self.config)
        };

        if recycle && self.config.reset_on_release {
            if let Err(reason) = conn.backend.reset().await {
                warn!(id = conn.id, identity = %conn.identity, %reason, "session reset failed");
                recycle = false;
            }
        }

        if recycle {
            let returned = {
                let mut state = self.lock();
                if !state.draining && state.generation() == conn.generation {
                    conn.state = ConnState::Idle;
                    conn.last_used_at = Instant::now();
                    debug!(
                        id = conn.id,
                        identity = %conn.identity,
                        idle_count = state.idle.len() + 1,
                        "returned connection to pool"
                    );
                    state.idle.push_back(conn);
                    None
                } else {
                    Some(conn)
                }
            };
            match returned {
                None => {
                    drop(lease);
                    return;
                }
                Some(c) => conn = c,
            }
        }

        debug!(
            id = conn.id,
            identity = %conn.identity,
            generation = conn.generation,
            "closing released connection"
        );
        conn.close().await;
        self.lock().closed += 1;
        drop(lease);
    }

    /// Close a checked-out connection without returning it to the pool, for
    /// callers that saw it fail mid-use.
    pub async fn discard(&self, mut conn: PooledConnection) {
        let lease = conn.lease.take();
        debug!(id = conn.id, identity = %conn.identity, "discarding connection");
        conn.close().await;
        self.lock().closed += 1;
        drop(lease);
    }

    /// Atomically point the pool at `identity` under a new generation.
    ///
    /// Idle connections of the previous generation are closed; checked-out
    /// ones keep working and are closed on release. Never waits for them.
    pub async fn retarget(&self, identity: BackendIdentity) -> u64 {
        let (previous, generation, stale) = {
            let mut state = self.lock();
            let previous = state.target.as_ref().map(|t| t.identity.clone());
            let generation = state.generation() + 1;
            state.target = Some(PoolTarget {
                identity: identity.clone(),
                generation,
            });
            self.generation.store(generation, Ordering::Release);
            let stale: Vec<PooledConnection> = state.idle.drain(..).collect();
            state.closed += stale.len() as u64;
            (previous, generation, stale)
        };

        info!(
            from = ?previous.as_ref().map(|p| p.as_str()),
            to = %identity,
            generation,
            closing_idle = stale.len(),
            "pool retargeted"
        );
        close_all(stale).await;
        generation
    }

    /// Close idle connections past `idle_timeout` or `max_lifetime`.
    /// Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let expired = {
            let mut state = self.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|c| !c.is_expired(&self.config));
            state.idle = keep;
            state.closed += expired.len() as u64;
            expired
        };

        let reaped = expired.len();
        if reaped > 0 {
            info!(reaped, "reaped idle connections");
        }
        close_all(expired).await;
        reaped
    }

    /// Reap periodically until `shutdown` flips.
    pub async fn run_reaper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.reap_idle().await;
                }
                _ = shutdown.changed() => {
                    debug!("pool reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Stop handing out connections and close every idle one.
    ///
    /// Waiting acquires fail with [`PoolError::Draining`]; checked-out
    /// connections are closed when released. Returns the number closed.
    pub async fn drain(&self) -> usize {
        let idle = {
            let mut state = self.lock();
            state.draining = true;
            let idle: Vec<PooledConnection> = state.idle.drain(..).collect();
            state.closed += idle.len() as u64;
            idle
        };
        self.semaphore.close();

        let closed = idle.len();
        close_all(idle).await;
        info!(closed, "connection pool drained");
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            target: state.target.as_ref().map(|t| t.identity.clone()),
            generation: state.generation(),
            idle: state.idle.len(),
            in_use: self.in_use.load(Ordering::Acquire),
            capacity: self.config.capacity,
            wait_count: state.wait_count,
            created: state.created,
            closed: state.closed,
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            target_identity = ?stats.target.as_ref().map(|t| t.as_str()),
            generation = stats.generation,
            idle = stats.idle,
            in_use = stats.in_use,
            capacity = stats.capacity,
            wait_count = stats.wait_count,
            created = stats.created,
            closed = stats.closed,
            "pool statistics"
        );
    }

    fn note_exhausted(&self) {
        self.lock().wait_count += 1;
        if let Some(notify) = &self.on_exhausted {
            notify.notify_one();
        }
    }
}

async fn close_all(conns: impl IntoIterator<Item = PooledConnection>) {
    for mut conn in conns {
        conn.close().await;
    }
}

impl fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("config", &self.config)
            .field("target", &self.current_target())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, ConnectFuture};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    // ── Mock backend and factory ─────────────────────────────────────

    #[derive(Debug)]
    struct MockBackend {
        target: String,
        closed: Arc<AtomicUsize>,
        reset_fails: bool,
        close_delay_ms: Arc<AtomicU64>,
    }

    impl ConnectionBackend for MockBackend {
        fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>> {
            Box::pin(async move { Ok(data.len()) })
        }

        fn recv(&mut self, _max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>> {
            let target = self.target.clone();
            Box::pin(async move { Ok(target.into_bytes()) })
        }

        fn ping(&mut self) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }

        fn reset(&mut self) -> BoxFuture<'_, Result<(), String>> {
            let fails = self.reset_fails;
            Box::pin(async move {
                if fails { Err("reset rejected".to_string()) } else { Ok(()) }
            })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            self.closed.fetch_add(1, Ordering::Relaxed);
            let delay = Duration::from_millis(self.close_delay_ms.load(Ordering::Relaxed));
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            })
        }
    }

    #[derive(Default)]
    struct MockFactory {
        connect_count: AtomicU64,
        closed: Arc<AtomicUsize>,
        should_fail: AtomicBool,
        hang: AtomicBool,
        reset_fails: AtomicBool,
        /// Milliseconds every backend's `close` takes.
        close_delay_ms: Arc<AtomicU64>,
        /// When set, the first connect parks until notified.
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl ConnectionFactory for MockFactory {
        fn connect<'a>(&'a self, target: &'a BackendIdentity) -> ConnectFuture<'a> {
            Box::pin(async move {
                let n = self.connect_count.fetch_add(1, Ordering::SeqCst);
                if let Some((entered, release)) = &self.gate {
                    if n == 0 {
                        entered.notify_one();
                        release.notified().await;
                    }
                }
                if self.hang.load(Ordering::Relaxed) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                if self.should_fail.load(Ordering::Relaxed) {
                    return Err("connection refused".to_string());
                }
                Ok(Box::new(MockBackend {
                    target: target.to_string(),
                    closed: Arc::clone(&self.closed),
                    reset_fails: self.reset_fails.load(Ordering::Relaxed),
                    close_delay_ms: Arc::clone(&self.close_delay_ms),
                }) as Box<dyn ConnectionBackend>)
            })
        }
    }

    fn id(s: &str) -> BackendIdentity {
        BackendIdentity::parse(s).unwrap()
    }

    fn config(capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_millis(200),
            acquire_timeout: Duration::from_millis(100),
            reset_on_release: true,
        }
    }

    async fn pool_with(capacity: usize, factory: Arc<MockFactory>) -> ConnectionPoolManager {
        let pool = ConnectionPoolManager::new(config(capacity), factory);
        pool.retarget(id("db-a:5432")).await;
        pool
    }

    const WAIT: Duration = Duration::from_millis(100);

    // ── Acquire / release ────────────────────────────────────────────

    #[tokio::test]
    async fn acquire_without_target_fails() {
        let pool = ConnectionPoolManager::new(config(2), Arc::new(MockFactory::default()));
        assert_eq!(pool.acquire(WAIT).await.unwrap_err(), PoolError::NoTarget);
        assert_eq!(pool.generation(), 0);
    }

    #[tokio::test]
    async fn acquire_creates_connection_for_current_target() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(2, factory.clone()).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.identity(), &id("db-a:5432"));
        assert_eq!(conn.generation(), 1);
        assert_eq!(conn.state(), ConnState::InUse);
        assert_eq!(factory.connect_count.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn release_recycles_connection() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(2, factory.clone()).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        let first_id = conn.id();
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().in_use, 0);

        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(factory.connect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_and_recv_through_connection() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let mut conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.send(b"SELECT 1").await.unwrap(), 8);
        assert_eq!(conn.recv(64).await.unwrap(), b"db-a:5432");
        assert!(conn.ping().await);
    }

    #[tokio::test]
    async fn acquire_times_out_when_all_in_use() {
        let pool = pool_with(2, Arc::new(MockFactory::default())).await;
        let _c1 = pool.acquire(WAIT).await.unwrap();
        let _c2 = pool.acquire(WAIT).await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, PoolError::AcquireTimeout(Duration::from_millis(100)));
        assert!(elapsed >= Duration::from_millis(90), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "returned too late: {elapsed:?}");
        assert_eq!(pool.stats().wait_count, 1);
    }

    #[tokio::test]
    async fn zero_timeout_reports_exhausted_immediately() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let _c1 = pool.acquire(WAIT).await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(
            pool.acquire(Duration::ZERO).await.unwrap_err(),
            PoolError::PoolExhausted
        );
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhaustion_signals_notify() {
        let notify = Arc::new(Notify::new());
        let pool = ConnectionPoolManager::new(config(1), Arc::new(MockFactory::default()))
            .with_exhaustion_notify(notify.clone());
        pool.retarget(id("db-a:5432")).await;
        let _c1 = pool.acquire(WAIT).await.unwrap();

        let _ = pool.acquire(Duration::ZERO).await;
        tokio::time::timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("exhaustion should notify");
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let pool = Arc::new(pool_with(1, Arc::new(MockFactory::default())).await);
        let held = pool.acquire(WAIT).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held).await;

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.generation(), 1);
    }

    #[tokio::test]
    async fn abandoned_acquire_gives_back_capacity() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let held = pool.acquire(WAIT).await.unwrap();

        // Caller gives up long before the pool's own timeout.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            pool.acquire(Duration::from_secs(10)),
        )
        .await;
        assert!(abandoned.is_err());

        pool.release(held).await;
        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
        drop(conn);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn dropped_connection_frees_capacity() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let conn = pool.acquire(WAIT).await.unwrap();
        drop(conn);
        assert!(pool.acquire(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_is_reported_and_capacity_kept() {
        let factory = Arc::new(MockFactory::default());
        factory.should_fail.store(true, Ordering::Relaxed);
        let pool = pool_with(1, factory.clone()).await;

        assert!(matches!(
            pool.acquire(WAIT).await,
            Err(PoolError::Connect { .. })
        ));

        factory.should_fail.store(false, Ordering::Relaxed);
        assert!(pool.acquire(WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn connect_hang_is_bounded() {
        let factory = Arc::new(MockFactory::default());
        factory.hang.store(true, Ordering::Relaxed);
        let pool = pool_with(1, factory).await;

        assert_eq!(
            pool.acquire(Duration::from_secs(1)).await.unwrap_err(),
            PoolError::ConnectTimeout(id("db-a:5432"))
        );
    }

    #[tokio::test]
    async fn acquire_deadline_bounds_slow_connect() {
        let factory = Arc::new(MockFactory::default());
        factory.hang.store(true, Ordering::Relaxed);
        let pool = ConnectionPoolManager::new(
            PoolConfig {
                connect_timeout: Duration::from_secs(3),
                ..config(1)
            },
            factory,
        );
        pool.retarget(id("db-a:5432")).await;

        let started = std::time::Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, PoolError::AcquireTimeout(Duration::from_millis(100)));
        assert!(elapsed >= Duration::from_millis(90), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "returned too late: {elapsed:?}");
        assert_eq!(pool.stats().in_use, 0);
    }

    // ── Retarget ────────────────────────────────────────────────────

    #[tokio::test]
    async fn retarget_closes_idle_and_bumps_generation() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(3, factory.clone()).await;

        let c1 = pool.acquire(WAIT).await.unwrap();
        let c2 = pool.acquire(WAIT).await.unwrap();
        pool.release(c1).await;
        pool.release(c2).await;
        assert_eq!(pool.stats().idle, 2);

        let generation = pool.retarget(id("db-b:5432")).await;
        assert_eq!(generation, 2);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 2);

        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.identity(), &id("db-b:5432"));
        assert_eq!(conn.generation(), 2);
    }

    #[tokio::test]
    async fn in_use_connection_survives_retarget_but_is_not_recycled() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(2, factory.clone()).await;

        let mut old = pool.acquire(WAIT).await.unwrap();
        pool.retarget(id("db-b:5432")).await;

        // The holder can still finish its work on the old target.
        assert_eq!(old.recv(64).await.unwrap(), b"db-a:5432");
        assert_eq!(old.generation(), 1);
        assert_eq!(old.state(), ConnState::Draining);
        assert_eq!(pool.stats().in_use, 1);

        pool.release(old).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);

        let fresh = pool.acquire(WAIT).await.unwrap();
        assert_eq!(fresh.identity(), &id("db-b:5432"));
    }

    #[tokio::test]
    async fn retarget_does_not_wait_for_in_use_connections() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let _held = pool.acquire(WAIT).await.unwrap();

        tokio::time::timeout(Duration::from_millis(50), pool.retarget(id("db-b:5432")))
            .await
            .expect("retarget must not block on in-use connections");
        assert_eq!(pool.generation(), 2);
    }

    #[tokio::test]
    async fn connection_opened_during_retarget_is_discarded() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let factory = Arc::new(MockFactory {
            gate: Some((entered.clone(), release.clone())),
            ..MockFactory::default()
        });
        let pool = Arc::new(pool_with(2, factory.clone()).await);

        let acquiring = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };

        // First connect is parked against db-a; swap the target underneath it.
        entered.notified().await;
        pool.retarget(id("db-b:5432")).await;
        release.notify_one();

        let conn = acquiring.await.unwrap().unwrap();
        assert_eq!(conn.identity(), &id("db-b:5432"));
        assert_eq!(conn.generation(), 2);
        assert_eq!(factory.connect_count.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn idle_connection_superseded_during_acquire_is_not_returned() {
        let factory = Arc::new(MockFactory::default());
        let pool = Arc::new(ConnectionPoolManager::new(
            PoolConfig {
                max_lifetime: Duration::from_millis(100),
                ..config(3)
            },
            factory.clone(),
        ));
        pool.retarget(id("db-a:5432")).await;

        // Leave [young, old] idle so acquire closes `old` before reusing `young`.
        let old = pool.acquire(WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let young = pool.acquire(WAIT).await.unwrap();
        pool.release(young).await;
        pool.release(old).await;
        assert_eq!(pool.stats().idle, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        factory.close_delay_ms.store(100, Ordering::Relaxed);
        let acquiring = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let generation = pool.retarget(id("db-b:5432")).await;

        let conn = acquiring.await.unwrap().unwrap();
        assert_eq!(conn.generation(), generation);
        assert_eq!(conn.identity(), &id("db-b:5432"));
        assert!(!conn.is_stale());
        assert_eq!(factory.closed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn stale_checked_out_connection_reports_draining() {
        let pool = pool_with(2, Arc::new(MockFactory::default())).await;
        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.state(), ConnState::InUse);
        assert!(!conn.is_stale());

        pool.retarget(id("db-a:5432")).await;
        assert!(conn.is_stale());
        assert_eq!(conn.state(), ConnState::Draining);
    }

    #[tokio::test]
    async fn acquired_connections_always_match_current_generation() {
        let pool = pool_with(4, Arc::new(MockFactory::default())).await;
        let targets = ["db-a:5432", "db-b:5432", "db-c:5432"];
        let mut previous: Vec<PooledConnection> = Vec::new();

        for round in 0..9 {
            let target = id(targets[round % targets.len()]);
            let generation = pool.retarget(target.clone()).await;

            let mut current = Vec::new();
            for _ in 0..2 {
                let conn = pool.acquire(WAIT).await.unwrap();
                assert_eq!(conn.generation(), generation);
                assert_eq!(conn.identity(), &target);
                current.push(conn);
            }

            // Holders from the last round release late; none may be recycled.
            for conn in previous.drain(..) {
                assert!(conn.generation() < generation);
                pool.release(conn).await;
                assert_eq!(pool.stats().idle, 0);
            }
            previous = current;
        }
    }

    #[tokio::test]
    #[should_panic(expected = "claims generation")]
    async fn releasing_connection_from_future_generation_panics() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let mut conn = pool.acquire(WAIT).await.unwrap();
        conn.generation = 99;
        pool.release(conn).await;
    }

    // ── Expiry, reset, reaping, drain ───────────────────────────────

    #[tokio::test]
    async fn failed_reset_closes_instead_of_recycling() {
        let factory = Arc::new(MockFactory::default());
        factory.reset_fails.store(true, Ordering::Relaxed);
        let pool = pool_with(1, factory.clone()).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reset_skipped_when_disabled() {
        let factory = Arc::new(MockFactory::default());
        factory.reset_fails.store(true, Ordering::Relaxed);
        let pool = ConnectionPoolManager::new(
            PoolConfig {
                reset_on_release: false,
                ..config(1)
            },
            factory,
        );
        pool.retarget(id("db-a:5432")).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn expired_connection_is_not_reused() {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionPoolManager::new(
            PoolConfig {
                max_lifetime: Duration::from_millis(30),
                ..config(2)
            },
            factory.clone(),
        );
        pool.retarget(id("db-a:5432")).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let conn = pool.acquire(WAIT).await.unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reap_idle_removes_expired() {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionPoolManager::new(
            PoolConfig {
                idle_timeout: Duration::from_millis(30),
                ..config(2)
            },
            factory.clone(),
        );
        pool.retarget(id("db-a:5432")).await;

        let c1 = pool.acquire(WAIT).await.unwrap();
        let c2 = pool.acquire(WAIT).await.unwrap();
        pool.release(c1).await;
        pool.release(c2).await;
        assert_eq!(pool.reap_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.reap_idle().await, 2);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let pool = pool_with(1, Arc::new(MockFactory::default())).await;
        let (tx, rx) = watch::channel(false);
        let reaper = pool.run_reaper(Duration::from_millis(10), rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(true).unwrap();
        };
        tokio::time::timeout(Duration::from_secs(1), async { tokio::join!(reaper, stop) })
            .await
            .expect("reaper should stop");
    }

    #[tokio::test]
    async fn drain_rejects_new_and_waiting_acquires() {
        let factory = Arc::new(MockFactory::default());
        let pool = Arc::new(pool_with(1, factory.clone()).await);
        let held = pool.acquire(WAIT).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.drain().await;
        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Draining);
        assert_eq!(pool.acquire(WAIT).await.unwrap_err(), PoolError::Draining);
        assert!(pool.is_draining());

        pool.release(held).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn in_use_still_counted_after_drain() {
        let pool = pool_with(2, Arc::new(MockFactory::default())).await;
        let held = pool.acquire(WAIT).await.unwrap();
        let other = pool.acquire(WAIT).await.unwrap();
        pool.release(other).await;

        assert_eq!(pool.drain().await, 1);
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().idle, 0);

        pool.release(held).await;
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn discard_closes_without_recycling() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(1, factory.clone()).await;

        let conn = pool.acquire(WAIT).await.unwrap();
        pool.discard(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.closed, 1);
        assert_eq!(factory.closed.load(Ordering::Relaxed), 1);

        let conn = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(conn.id(), 2);
    }

    #[test]
    fn pool_config_default_matches_section_default() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 20);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert!(config.reset_on_release);
    }

    #[test]
    fn pool_error_display() {
        assert_eq!(PoolError::PoolExhausted.to_string(), "connection pool exhausted");
        assert_eq!(PoolError::NoTarget.to_string(), "pool has no target yet");
        assert_eq!(
            PoolError::Connect {
                identity: id("db-a:5432"),
                reason: "refused".into()
            }
            .to_string(),
            "connecting to db-a:5432 failed: refused"
        );
    }
}
