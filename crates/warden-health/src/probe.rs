//! Direct role probes against a single candidate.

use std::future::Future;
use std::pin::Pin;

use http::{Method, StatusCode};
use thiserror::Error;
use tracing::debug;

use warden_core::{BackendIdentity, Role};

use crate::http::{HttpError, request_status};

/// Why a probe produced no role.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No answer within the probe deadline.
    #[error("probe timed out")]
    Timeout,

    /// The candidate could not be contacted at all.
    #[error("candidate unreachable: {0}")]
    Unreachable(String),

    /// The candidate answered but its role could not be determined.
    #[error("candidate role ambiguous: {0}")]
    Ambiguous(String),
}

/// Boxed future alias for probe results.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<Role, ProbeError>> + Send + 'a>>;

/// Liveness + role check against one candidate.
///
/// Implementations return `Primary` or `Replica`; anything they cannot
/// classify is [`ProbeError::Ambiguous`]. Deadlines are enforced by the
/// caller, not the implementation.
pub trait RoleProbe: Send + Sync {
    fn probe<'a>(&'a self, identity: &'a BackendIdentity) -> ProbeFuture<'a>;
}

/// Role probe over a per-candidate HTTP admin endpoint.
///
/// `GET /primary` answering 200 means the candidate accepts writes;
/// otherwise `GET /replica` answering 200 means it is a read-only replica.
#[derive(Debug, Clone)]
pub struct HttpRoleProbe {
    admin_port: u16,
}

impl HttpRoleProbe {
    pub fn new(admin_port: u16) -> Self {
        Self { admin_port }
    }

    async fn check(&self, identity: &BackendIdentity) -> Result<Role, ProbeError> {
        let address = identity.with_port(self.admin_port);

        let primary = request_status(Method::GET, &address, "/primary")
            .await
            .map_err(unreachable)?;
        if primary == StatusCode::OK {
            return Ok(Role::Primary);
        }

        let replica = request_status(Method::GET, &address, "/replica")
            .await
            .map_err(unreachable)?;
        if replica == StatusCode::OK {
            return Ok(Role::Replica);
        }

        debug!(%identity, %primary, %replica, "role endpoints gave no answer");
        Err(ProbeError::Ambiguous(format!(
            "/primary answered {primary}, /replica answered {replica}"
        )))
    }
}

impl RoleProbe for HttpRoleProbe {
    fn probe<'a>(&'a self, identity: &'a BackendIdentity) -> ProbeFuture<'a> {
        Box::pin(self.check(identity))
    }
}

fn unreachable(e: HttpError) -> ProbeError {
    ProbeError::Unreachable(e.to_string())
}
