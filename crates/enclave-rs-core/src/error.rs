//! Error types for the lifecycle service.

use enclave_rs_driver::{DriverError, FailureClass};
use enclave_rs_protocol::{
    ErrorCode, ErrorRecord, PathConflict, SandboxFailure, SandboxId, SandboxStatus,
};
use enclave_rs_protocol::scope::ScopeError;
use enclave_rs_store::StoreError;
use thiserror::Error;

/// Errors returned by sandbox operations.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// Request failed input validation.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),
    /// The requested scope overlaps live sandboxes.
    #[error("scope {scope_path} conflicts with {} live sandbox(es)", conflicts.len())]
    ScopeConflict {
        scope_path: String,
        conflicts: Vec<PathConflict>,
    },
    /// The operation is not legal from the record's current status.
    #[error("cannot {operation} sandbox {id} in status {status}")]
    IllegalTransition {
        id: SandboxId,
        status: SandboxStatus,
        operation: &'static str,
    },
    /// Optimistic version checks kept failing.
    #[error("sandbox {0} changed concurrently; retries exhausted")]
    Contention(SandboxId),
    /// Auto-approval denied by policy.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    /// No usable driver on this host; the record stays in `creating`.
    #[error("driver unavailable: {0}")]
    DriverUnavailable(String),
    /// The sandbox moved to `error`; the cause is attached.
    #[error("sandbox {id} failed during {}: {}", failure.operation, failure.message)]
    SandboxFailed {
        id: SandboxId,
        failure: Box<SandboxFailure>,
    },
    #[error("operation cancelled")]
    Cancelled,
    /// Driver error outside a state transition (exec, change listing).
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ScopeError> for EnclaveError {
    fn from(err: ScopeError) -> Self {
        EnclaveError::InvalidArgs(err.to_string())
    }
}

impl EnclaveError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EnclaveError::InvalidArgs(_) => ErrorCode::InvalidArgs,
            EnclaveError::NotFound(_) => ErrorCode::NotFound,
            EnclaveError::ScopeConflict { .. } => ErrorCode::ScopeConflict,
            EnclaveError::IllegalTransition { .. } => ErrorCode::IllegalTransition,
            EnclaveError::Contention(_) => ErrorCode::Conflict,
            EnclaveError::PolicyViolation(_) => ErrorCode::PolicyViolation,
            EnclaveError::DriverUnavailable(_) => ErrorCode::DriverUnavailable,
            EnclaveError::SandboxFailed { failure, .. } if failure.code == ErrorCode::Cancelled => {
                ErrorCode::Cancelled
            }
            EnclaveError::SandboxFailed { .. } => ErrorCode::Internal,
            EnclaveError::Cancelled => ErrorCode::Cancelled,
            EnclaveError::Driver(err) => driver_code(err),
            EnclaveError::Store(err) => store_code(err),
            EnclaveError::Io(_) | EnclaveError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Error record suitable for a transport response.
    pub fn to_record(&self) -> ErrorRecord {
        let details = match self {
            EnclaveError::ScopeConflict { conflicts, .. } => serde_json::to_value(conflicts).ok(),
            EnclaveError::SandboxFailed { failure, .. } => serde_json::to_value(failure).ok(),
            EnclaveError::Store(StoreError::ConflictIdempotency(existing)) => {
                Some(serde_json::json!({ "sandbox_id": existing.id }))
            }
            _ => None,
        };
        ErrorRecord {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }
}

fn driver_code(err: &DriverError) -> ErrorCode {
    match err {
        DriverError::UnknownDriver(_) | DriverError::HintNotAllowed(_) => ErrorCode::InvalidArgs,
        DriverError::MountFailed(_) => ErrorCode::MountFailed,
        _ if err.class() == FailureClass::Unavailable => ErrorCode::DriverUnavailable,
        _ => ErrorCode::Internal,
    }
}

fn store_code(err: &StoreError) -> ErrorCode {
    match err {
        StoreError::NotFound(_) => ErrorCode::NotFound,
        StoreError::StaleVersion { .. } => ErrorCode::Conflict,
        StoreError::ConflictIdempotency(_) => ErrorCode::ConflictIdempotency,
        StoreError::ScopeTaken { .. } => ErrorCode::ScopeConflict,
        StoreError::InvalidFilter(_) => ErrorCode::InvalidArgs,
        _ => ErrorCode::Internal,
    }
}
