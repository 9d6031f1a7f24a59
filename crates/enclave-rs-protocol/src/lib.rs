//! Wire protocol types for Enclave sandboxes, audit events, and requests.

mod audit;
mod change;
mod error;
mod policy;
mod request;
pub mod scope;

pub use audit::{ActorType, AuditEvent, EventType};
pub use change::{ChangeKind, ConflictRelation, FileChange, PathConflict};
pub use error::{ErrorCode, ErrorRecord};
pub use policy::{ApprovalPolicy, GcPolicy, GcReason};
pub use request::{
    ApprovalResult, ApproveRequest, AuditLogRequest, CreateSandboxRequest, GcItemError, GcRequest,
    GcResult, ListRequest, Page, RejectRequest, SandboxStats, StopSandboxRequest,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a sandbox.
pub type SandboxId = Uuid;

/// Lifecycle status of a sandbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Record inserted, driver mount in progress.
    Creating,
    /// Mounted and usable.
    Active,
    /// Unmount in progress.
    Stopping,
    /// Unmounted; upper layer retained.
    Stopped,
    /// Changes applied to the host tree.
    Approved,
    /// Changes discarded.
    Rejected,
    /// Failed; cause captured on the record.
    Error,
}

impl SandboxStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SandboxStatus; 7] = [
        SandboxStatus::Creating,
        SandboxStatus::Active,
        SandboxStatus::Stopping,
        SandboxStatus::Stopped,
        SandboxStatus::Approved,
        SandboxStatus::Rejected,
        SandboxStatus::Error,
    ];

    /// Stable string form used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Active => "active",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Approved => "approved",
            SandboxStatus::Rejected => "rejected",
            SandboxStatus::Error => "error",
        }
    }

    /// Terminal statuses accept no further mutation except deletion.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SandboxStatus::Approved | SandboxStatus::Rejected | SandboxStatus::Error
        )
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SandboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown sandbox status: {value}"))
    }
}

/// Driver-produced handle describing where a sandbox's layers live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPaths {
    /// Read-only view of the original subtree.
    pub lower: PathBuf,
    /// Private writable layer holding all changes.
    pub upper: PathBuf,
    /// Scratch directory required by some drivers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<PathBuf>,
    /// Merged view presented as the sandbox working directory.
    pub merged: PathBuf,
}

/// Structured cause captured when a sandbox enters `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxFailure {
    /// Machine-readable classification.
    pub code: ErrorCode,
    /// Operation that failed (mount, stop, approve, ...).
    pub operation: String,
    /// Human-readable message.
    pub message: String,
    /// Operation-specific details such as a partial-apply report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One isolated workspace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    /// Normalized scope, relative to `project_root` (`.` for the whole tree).
    pub scope_path: String,
    pub project_root: PathBuf,
    pub status: SandboxStatus,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Name of the driver that owns this sandbox's storage.
    pub driver: String,
    pub version: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mount_paths: Option<MountPaths>,
    #[serde(default)]
    pub error: Option<SandboxFailure>,
}

impl Sandbox {
    /// Build a fresh record in `creating` at version 1.
    pub fn new(
        scope_path: impl Into<String>,
        project_root: impl Into<PathBuf>,
        owner: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope_path: scope_path.into(),
            project_root: project_root.into(),
            status: SandboxStatus::Creating,
            owner: owner.into(),
            idempotency_key: None,
            driver: driver.into(),
            version: 1,
            size_bytes: 0,
            created_at: now,
            last_used_at: now,
            stopped_at: None,
            approved_at: None,
            mount_paths: None,
            error: None,
        }
    }

    /// Absolute host path of the scope root.
    pub fn scope_root(&self) -> PathBuf {
        if self.scope_path == scope::ROOT_SCOPE {
            self.project_root.clone()
        } else {
            self.project_root.join(&self.scope_path)
        }
    }
}
