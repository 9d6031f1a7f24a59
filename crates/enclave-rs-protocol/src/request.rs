//! Request and response records for the named service operations.

use crate::{ActorType, ApprovalPolicy, GcPolicy, GcReason, Sandbox, SandboxId, SandboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub scope_path: String,
    pub project_root: PathBuf,
    pub owner: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub driver_hint: Option<String>,
}

impl CreateSandboxRequest {
    pub fn new(
        scope_path: impl Into<String>,
        project_root: impl Into<PathBuf>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            scope_path: scope_path.into(),
            project_root: project_root.into(),
            owner: owner.into(),
            idempotency_key: None,
            driver_hint: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_driver_hint(mut self, driver: impl Into<String>) -> Self {
        self.driver_hint = Some(driver.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSandboxRequest {
    pub id: SandboxId,
    /// Defaults to the sandbox owner.
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub id: SandboxId,
    pub actor: String,
    #[serde(default)]
    pub actor_type: ActorType,
    #[serde(default)]
    pub policy: Option<ApprovalPolicy>,
    /// Apply even when the policy denies auto-approval.
    #[serde(default)]
    pub manual_override: bool,
}

impl ApproveRequest {
    pub fn new(id: SandboxId, actor: impl Into<String>) -> Self {
        Self {
            id,
            actor: actor.into(),
            actor_type: ActorType::User,
            policy: None,
            manual_override: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub sandbox: Sandbox,
    pub files_applied: usize,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub id: SandboxId,
    pub actor: String,
    #[serde(default)]
    pub actor_type: ActorType,
}

impl RejectRequest {
    pub fn new(id: SandboxId, actor: impl Into<String>) -> Self {
        Self {
            id,
            actor: actor.into(),
            actor_type: ActorType::User,
        }
    }
}

/// Filtered, paginated listing. Results are ordered by creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub status: Option<Vec<SandboxStatus>>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub scope_prefix: Option<String>,
    /// Inclusive lower bound on `created_at`.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// One page of results plus the token for the next page, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRequest {
    /// Falls back to the configured default policy.
    #[serde(default)]
    pub policy: Option<GcPolicy>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    pub actor: String,
}

/// Soft failure recorded for a single GC candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcItemError {
    pub sandbox_id: SandboxId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    /// Collected (or, in dry-run, would-be-collected) ids in selection order.
    pub collected: Vec<SandboxId>,
    pub total_bytes_reclaimed: u64,
    pub dry_run: bool,
    #[serde(default)]
    pub errors: Vec<GcItemError>,
    /// Every criterion that matched, per candidate.
    #[serde(default)]
    pub reasons: BTreeMap<SandboxId, Vec<GcReason>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogRequest {
    #[serde(default)]
    pub sandbox_id: Option<SandboxId>,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// Aggregate statistics over stored sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStats {
    pub count: u64,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub by_status: BTreeMap<SandboxStatus, u64>,
}
