//! warden-pool: connection pool bound to one backend identity at a time.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → semaphore permit (bounded by capacity, waits up to timeout)
//!     → idle connection of the current generation → InUse
//!     → none idle → ConnectionFactory::connect(current identity) → InUse
//!
//! release(conn)
//!   → same generation, not expired, reset ok → Idle
//!   → stale generation or expired            → Draining → Closed
//!
//! retarget(identity)
//!   → generation += 1, identity swapped under one lock
//!   → every Idle connection closed; InUse holders finish on the old target
//! ```
//!
//! [`PoolFrontend`] is the client-facing side: it accepts TCP clients and
//! relays each session over one pooled connection.
//!
//! Connections are tagged with the generation that was current when they
//! were created and never change it, so a pool can never hand out a
//! connection to a previous target.

pub mod backend;
pub mod frontend;
pub mod pool;
pub mod tcp;

pub use backend::{BoxFuture, ConnectFuture, ConnectionBackend, ConnectionFactory};
pub use frontend::PoolFrontend;
pub use pool::{
    ConnState, ConnectionPoolManager, PoolConfig, PoolError, PoolStats, PoolTarget, PooledConnection,
};
pub use tcp::{TcpBackend, TcpConnectionFactory};
