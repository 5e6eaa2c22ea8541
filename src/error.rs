//! Eventing error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_NO_EVENTING_NODES: &str = "no active eventing nodes reported by the cluster manager";
pub const ERR_TREE_UNAVAILABLE: &str = "supervisor tree is no longer running";

/// Error vocabulary dictated by the cluster orchestrator's service-manager contract.
///
/// These variants are embedded in `anyhow::Error` on the way up and recovered by
/// downcast at the protocol boundary, so intermediate layers stay on plain `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The requested object does not exist.
    #[error("requested object was not found")]
    NotFound,
    /// The requested operation is not supported for the given object.
    #[error("requested operation is not supported")]
    NotSupported,
    /// The request conflicts with the current revision or an operation in flight.
    #[error("requested operation conflicts with current state")]
    Conflict,
    /// The caller canceled a blocking wait.
    #[error("operation was canceled by the caller")]
    Canceled,
}

/// Extract the typed service error from an `anyhow::Error`, if that is what it holds.
pub fn as_service_error(err: &anyhow::Error) -> Option<ServiceError> {
    err.downcast_ref::<ServiceError>().copied()
}
