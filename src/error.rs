//! Reconciliation error abstractions.

use thiserror::Error;

use crate::mgmt::MgmtError;

/// The result type used throughout a reconciliation pass.
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// Errors raised during a reconciliation pass.
///
/// Every variant is caught at the boundary of the pass and converted into a requeue decision
/// along with a status message. A datacenter's error never escapes into another datacenter.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A failure which is expected to resolve itself, retried with backoff.
    #[error("{0:#}")]
    Transient(#[from] anyhow::Error),
    /// A write lost an optimistic concurrency race; recomputed from fresh state on the next pass.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The desired state can not be acted upon until it is changed by the user.
    #[error("invalid desired state: {0}")]
    InvalidDesiredState(String),
    /// A local safety precondition rejected the next step before any external call was made.
    #[error("unsafe to proceed: {0}")]
    UnsafeToProceed(String),
}

impl ReconcileError {
    /// True if this error is retried by requeueing the pass with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }
}

impl From<MgmtError> for ReconcileError {
    fn from(err: MgmtError) -> Self {
        Self::Transient(anyhow::Error::from(err))
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(resp.message),
            err => Self::Transient(anyhow::Error::from(err)),
        }
    }
}
