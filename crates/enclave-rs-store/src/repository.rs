//! Repository contract used by the lifecycle service.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, GcPolicy, ListRequest, Page, PathConflict, Sandbox, SandboxId,
    SandboxStats,
};
use std::path::Path;

/// Page size applied when a request does not carry one.
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Upper bound on any page.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Sandbox and audit operations, available directly and inside transactions.
pub trait SandboxStore {
    /// Insert a record. Fails with `ConflictIdempotency` carrying the existing
    /// record when the idempotency key is taken.
    fn create(&self, sandbox: &Sandbox) -> Result<(), StoreError>;

    fn get(&self, id: SandboxId) -> Result<Option<Sandbox>, StoreError>;

    /// Overwrite a record unconditionally.
    fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError>;

    /// Overwrite a record only if its stored version is `expected_version`.
    fn update_with_version_check(
        &self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Remove a record; returns whether a row existed.
    fn delete(&self, id: SandboxId) -> Result<bool, StoreError>;

    /// Filtered records in creation order.
    fn list(&self, filter: &ListRequest) -> Result<Page<Sandbox>, StoreError>;

    /// Non-terminal sandboxes under `project_root` whose scope conflicts with
    /// `scope_path` (already normalized).
    fn check_scope_overlap(
        &self,
        scope_path: &str,
        project_root: &Path,
        exclude: Option<SandboxId>,
    ) -> Result<Vec<PathConflict>, StoreError>;

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>, StoreError>;

    /// Records matching any time-based criterion of `policy`, oldest first by
    /// the first criterion each one matched.
    fn gc_candidates(
        &self,
        policy: &GcPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sandbox>, StoreError>;

    fn stats(&self) -> Result<SandboxStats, StoreError>;

    /// Append an audit event and return it as stored. `recorded_at` never
    /// goes backwards for a given sandbox.
    fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent, StoreError>;

    fn audit_log(&self, request: &AuditLogRequest) -> Result<Page<AuditEvent>, StoreError>;
}

/// A durable store that can open transactions.
pub trait Repository: SandboxStore + Send + Sync {
    /// Start a unit of work. Dropping it without commit rolls back.
    fn begin_tx(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// Transactional view of a repository.
pub trait Transaction: SandboxStore {
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Effective page size for a request.
pub fn page_size(requested: Option<usize>) -> usize {
    requested
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE)
}

/// Offset encoded in a page token; malformed tokens start from the top.
pub fn page_offset(token: Option<&str>) -> usize {
    token.and_then(|token| token.parse().ok()).unwrap_or(0)
}
