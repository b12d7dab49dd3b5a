//! Transport traits injected into the pool.
//!
//! The pool never speaks a wire protocol itself. It opens, pings, resets and
//! closes connections through these traits; the storage collaborator's
//! transport (and its credential handling) lives behind them.

use std::future::Future;
use std::pin::Pin;

use warden_core::BackendIdentity;

/// Boxed, `Send` future used by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed future alias for connection factory results.
pub type ConnectFuture<'a> = BoxFuture<'a, Result<Box<dyn ConnectionBackend>, String>>;

/// One established backend connection.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>>;

    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>>;

    /// Health-check ping. Returns `true` if the connection is alive.
    fn ping(&mut self) -> BoxFuture<'_, bool>;

    /// Discard session state before the connection is handed to the next
    /// borrower. Transports without session state keep the default.
    fn reset(&mut self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }

    /// Close the underlying transport.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Factory for new connections: injected for testability.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to `target`. Name resolution happens here,
    /// at connect time, so a rescheduled backend is found under its name.
    fn connect<'a>(&'a self, target: &'a BackendIdentity) -> ConnectFuture<'a>;
}
