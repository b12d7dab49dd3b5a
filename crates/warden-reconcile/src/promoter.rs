//! Promotion capability of the storage collaborator.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http::{Method, StatusCode};
use thiserror::Error;
use tracing::debug;

use warden_core::BackendIdentity;
use warden_health::http::request_status;

/// A promotion call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted,
    /// The candidate was already primary. Safe to proceed.
    AlreadyPromoted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromotionError {
    #[error("promotion failed: {0}")]
    Failed(String),
}

/// Boxed future alias for promotion results.
pub type PromoteFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PromotionOutcome, PromotionError>> + Send + 'a>>;

/// Turns a replica into the primary.
///
/// Implementations must be safe to call on a candidate that is already
/// primary. The reconciler calls this at most once per promotion decision
/// and never assumes success without re-probing.
pub trait Promoter: Send + Sync {
    fn promote<'a>(&'a self, identity: &'a BackendIdentity) -> PromoteFuture<'a>;
}

/// Promoter over the per-candidate HTTP admin endpoint.
///
/// `POST /promote`: 200 is `Promoted`, 409 is `AlreadyPromoted`, anything
/// else is a failure.
#[derive(Debug, Clone)]
pub struct HttpPromoter {
    admin_port: u16,
    timeout: Duration,
}

impl HttpPromoter {
    pub fn new(admin_port: u16) -> Self {
        Self {
            admin_port,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Promoter for HttpPromoter {
    fn promote<'a>(&'a self, identity: &'a BackendIdentity) -> PromoteFuture<'a> {
        Box::pin(async move {
            let address = identity.with_port(self.admin_port);
            let status = tokio::time::timeout(
                self.timeout,
                request_status(Method::POST, &address, "/promote"),
            )
            .await
            .map_err(|_| {
                PromotionError::Failed(format!("no answer from {address} within {:?}", self.timeout))
            })?
            .map_err(|e| PromotionError::Failed(e.to_string()))?;

            debug!(%identity, %status, "promote endpoint responded");
            match status {
                StatusCode::OK => Ok(PromotionOutcome::Promoted),
                StatusCode::CONFLICT => Ok(PromotionOutcome::AlreadyPromoted),
                other => Err(PromotionError::Failed(format!("{address} answered {other}"))),
            }
        })
    }
}
