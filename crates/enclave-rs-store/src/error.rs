//! Error types for sandbox persistence.

use enclave_rs_protocol::{Sandbox, SandboxId};

/// Errors returned by repositories and transactions.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Serialization error for JSON columns.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// IO error while preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),
    /// The stored version moved on since the caller read the record.
    #[error("stale version for sandbox {id}: expected {expected}, found {found}")]
    StaleVersion {
        id: SandboxId,
        expected: u64,
        found: u64,
    },
    /// A versioned write must increase the version.
    #[error("version of sandbox {id} must increase past {expected}")]
    VersionNotIncreased { id: SandboxId, expected: u64 },
    /// A record with the same idempotency key exists; it is returned.
    #[error("idempotency key already used by sandbox {}", .0.id)]
    ConflictIdempotency(Box<Sandbox>),
    /// Another live sandbox holds exactly this scope.
    #[error("scope {scope_path} already held under {project_root}")]
    ScopeTaken {
        project_root: String,
        scope_path: String,
    },
    /// On-disk schema newer than this build understands.
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(u32),
    /// A list filter could not be interpreted.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
