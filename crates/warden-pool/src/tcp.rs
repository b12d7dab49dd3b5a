//! Plain TCP transport for the pool.
//!
//! [`TcpBackend`] passes raw bytes to and from the backend without parsing
//! any protocol. [`TcpConnectionFactory`] resolves the identity's host name on
//! every connect, so a backend that moved to a new address is found again
//! under the same name.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use warden_core::BackendIdentity;

use crate::backend::{BoxFuture, ConnectFuture, ConnectionBackend, ConnectionFactory};

/// How long `ping` waits on a peek before deciding the socket is quiet.
const PING_PEEK_WINDOW: Duration = Duration::from_millis(10);

/// A [`ConnectionBackend`] over a tokio TCP stream.
pub struct TcpBackend {
    stream: TcpStream,
    recv_timeout: Duration,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBackend")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl TcpBackend {
    pub fn new(stream: TcpStream, recv_timeout: Duration) -> Self {
        Self {
            stream,
            recv_timeout,
        }
    }
}

impl ConnectionBackend for TcpBackend {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>> {
        Box::pin(async move {
            self.stream
                .write_all(data)
                .await
                .map_err(|e| format!("tcp send: {e}"))?;
            Ok(data.len())
        })
    }

    fn recv(&mut self, max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>> {
        Box::pin(async move {
            let mut buf = vec![0u8; max_bytes];
            let n = tokio::time::timeout(self.recv_timeout, self.stream.read(&mut buf))
                .await
                .map_err(|_| "tcp recv: timed out".to_string())?
                .map_err(|e| format!("tcp recv: {e}"))?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut peek_buf = [0u8; 1];
            match tokio::time::timeout(PING_PEEK_WINDOW, self.stream.peek(&mut peek_buf)).await {
                // Nothing to read but the socket is open.
                Err(_) => true,
                // EOF: peer closed the connection.
                Ok(Ok(0)) => false,
                Ok(Ok(_)) => true,
                Ok(Err(_)) => false,
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.stream.shutdown().await;
        })
    }
}

/// Opens [`TcpBackend`]s by host name.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    recv_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new(recv_timeout: Duration) -> Self {
        Self { recv_timeout }
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect<'a>(&'a self, target: &'a BackendIdentity) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect(target.as_str())
                .await
                .map_err(|e| format!("tcp connect to {target}: {e}"))?;
            let _ = stream.set_nodelay(true);
            debug!(identity = %target, peer = ?stream.peer_addr().ok(), "tcp connection established");
            Ok(Box::new(TcpBackend::new(stream, self.recv_timeout)) as Box<dyn ConnectionBackend>)
        })
    }
}
