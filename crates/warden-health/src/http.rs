//! Minimal HTTP/1.1 client for candidate admin endpoints.
//!
//! Only the status code matters to callers, so bodies are never read.

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::Empty;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

const USER_AGENT: &str = "warden/0.1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("http handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("http request to {address} failed: {reason}")]
    Request { address: String, reason: String },
}

/// Issue `method path` against `address` (`host:port`) and return the status.
pub async fn request_status(
    method: Method,
    address: &str,
    path: &str,
) -> Result<StatusCode, HttpError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| HttpError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HttpError::Handshake {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method(method.clone())
        .uri(path)
        .header("host", address)
        .header("user-agent", USER_AGENT)
        .body(Empty::<Bytes>::new())
        .map_err(|e| HttpError::Request {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let resp = sender.send_request(req).await.map_err(|e| HttpError::Request {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    debug!(%method, %address, %path, status = %resp.status(), "admin endpoint responded");
    Ok(resp.status())
}
