//! Wire error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error code carried by every error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgs,
    NotFound,
    ConflictIdempotency,
    ScopeConflict,
    IllegalTransition,
    /// Optimistic version check exhausted its retries.
    Conflict,
    PolicyViolation,
    DriverUnavailable,
    MountFailed,
    Internal,
    Cancelled,
    RateLimited,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ConflictIdempotency => "conflict_idempotency",
            ErrorCode::ScopeConflict => "scope_conflict",
            ErrorCode::IllegalTransition => "illegal_transition",
            ErrorCode::Conflict => "conflict",
            ErrorCode::PolicyViolation => "policy_violation",
            ErrorCode::DriverUnavailable => "driver_unavailable",
            ErrorCode::MountFailed => "mount_failed",
            ErrorCode::Internal => "internal",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::RateLimited => "rate_limited",
        }
    }

    /// Transport status code for this error.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgs => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::ConflictIdempotency
            | ErrorCode::ScopeConflict
            | ErrorCode::IllegalTransition
            | ErrorCode::Conflict => 409,
            ErrorCode::PolicyViolation => 422,
            ErrorCode::RateLimited => 429,
            ErrorCode::Cancelled => 499,
            ErrorCode::DriverUnavailable => 503,
            ErrorCode::MountFailed | ErrorCode::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error response record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
