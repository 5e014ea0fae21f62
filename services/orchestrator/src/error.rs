//! Orchestrator error taxonomy.

use sparkling_reconcile::{Cancelled, Retryable};
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Errors surfaced by orchestrator workflows.
///
/// Payloads are strings so a single failure can be shared between the
/// callers of a single-flight convergence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// A container runtime could not be reached.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition on persisted state does not hold.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A runtime call was reachable but failed.
    #[error("runtime operation failed: {0}")]
    RuntimeOperation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl OrchestratorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn runtime(what: impl Into<String>) -> Self {
        Self::RuntimeOperation(what.into())
    }
}

impl Retryable for OrchestratorError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::RuntimeOperation(_) | Self::Store(_)
        )
    }
}

impl From<Cancelled> for OrchestratorError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Connect { .. } => Self::Connectivity(err.to_string()),
            other => Self::RuntimeOperation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OrchestratorError::Connectivity("x".into()), true)]
    #[case(OrchestratorError::RuntimeOperation("x".into()), true)]
    #[case(OrchestratorError::Store("x".into()), true)]
    #[case(OrchestratorError::NotFound("x".into()), false)]
    #[case(OrchestratorError::Conflict("x".into()), false)]
    #[case(OrchestratorError::Cancelled, false)]
    fn test_retryability(#[case] err: OrchestratorError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn test_store_conflict_stays_non_retryable() {
        let err: OrchestratorError = StoreError::Conflict("live session".into()).into();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[test]
    fn test_runtime_not_found_is_operation_error() {
        let err: OrchestratorError = RuntimeError::NotFound("ctr_1".into()).into();
        assert!(err.is_retryable());
    }
}
