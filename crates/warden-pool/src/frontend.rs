//! Client-facing TCP listener that relays sessions over pooled connections.
//!
//! ```text
//! client connects
//!   → ConnectionPoolManager::acquire_default()
//!     → relay bytes both ways (client ⇄ PooledConnection::send/recv)
//!   → client closes  → release (recycled if still current)
//!   → backend broken → discard
//! ```
//!
//! No protocol is parsed. Each client session holds one connection for its
//! whole lifetime, so a retarget only affects sessions opened after it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPoolManager, PooledConnection};

/// Read size for both directions (default: 16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Accepts client connections and serves each one from the pool.
#[derive(Debug, Clone)]
pub struct PoolFrontend {
    pool: Arc<ConnectionPoolManager>,
    buffer_size: usize,
}

enum Relay {
    Client(io::Result<usize>),
    Backend(Result<Vec<u8>, String>),
    Shutdown,
}

/// How a session ended, which decides what happens to its connection.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    BackendBroken,
    Shutdown,
}

impl PoolFrontend {
    pub fn new(pool: Arc<ConnectionPoolManager>) -> Self {
        Self {
            pool,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Accept clients until `shutdown` flips. Open sessions are told to stop
    /// through the same channel.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?listener.local_addr().ok(), "client listener started");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let frontend = self.clone();
                        let session_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            frontend.session(stream, peer, session_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => {
                    debug!("client listener shutting down");
                    break;
                }
            }
        }
    }

    async fn session(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _ = client.set_nodelay(true);
        let mut conn = match self.pool.acquire_default().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, error = %e, "no backend connection for client");
                let _ = client.shutdown().await;
                return;
            }
        };
        debug!(%peer, conn = conn.id(), identity = %conn.identity(), "client session started");

        let end = self.relay(&mut client, &mut conn, &mut shutdown).await;
        let _ = client.shutdown().await;
        debug!(%peer, conn = conn.id(), ?end, "client session ended");

        match end {
            SessionEnd::ClientClosed | SessionEnd::Shutdown => self.pool.release(conn).await,
            SessionEnd::BackendBroken => self.pool.discard(conn).await,
        }
    }

    async fn relay(
        &self,
        client: &mut TcpStream,
        conn: &mut PooledConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let event = tokio::select! {
                read = client.read(&mut buf) => Relay::Client(read),
                data = conn.recv(self.buffer_size) => Relay::Backend(data),
                _ = shutdown.changed() => Relay::Shutdown,
            };

            match event {
                Relay::Client(Ok(0)) | Relay::Client(Err(_)) => return SessionEnd::ClientClosed,
                Relay::Client(Ok(n)) => {
                    if let Err(reason) = conn.send(&buf[..n]).await {
                        warn!(conn = conn.id(), %reason, "backend send failed");
                        return SessionEnd::BackendBroken;
                    }
                }
                Relay::Backend(Ok(data)) if data.is_empty() => return SessionEnd::BackendBroken,
                Relay::Backend(Ok(data)) => {
                    if client.write_all(&data).await.is_err() {
                        return SessionEnd::ClientClosed;
                    }
                }
                // A quiet backend times out its recv; only a dead socket ends the session.
                Relay::Backend(Err(reason)) => {
                    if !conn.ping().await {
                        warn!(conn = conn.id(), %reason, "backend connection lost");
                        return SessionEnd::BackendBroken;
                    }
                }
                Relay::Shutdown => return SessionEnd::Shutdown,
            }
        }
    }
}
