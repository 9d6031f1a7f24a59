//! Conversions between protocol records and SQLite rows.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! ordering and range filters work on plain integers.

use crate::StoreError;
use chrono::{DateTime, Utc};
use enclave_rs_protocol::{
    ActorType, AuditEvent, EventType, MountPaths, Sandbox, SandboxFailure, SandboxStatus,
};
use rusqlite::Row;
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

pub(crate) const SANDBOX_COLUMNS: &str = "id, scope_path, project_root, status, owner, \
     idempotency_key, driver, version, size_bytes, created_at, last_used_at, stopped_at, \
     approved_at, mount_paths, error";

pub(crate) const AUDIT_COLUMNS: &str =
    "id, sandbox_id, event_type, actor, actor_type, details, recorded_at";

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {value}")))
}

pub(crate) fn to_db_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_u64(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Corrupt(format!("bad id '{value}': {err}")))
}

/// Owned column values for one sandbox row, in `SANDBOX_COLUMNS` order.
pub(crate) struct SandboxRow {
    pub id: String,
    pub scope_path: String,
    pub project_root: String,
    pub status: String,
    pub owner: String,
    pub idempotency_key: Option<String>,
    pub driver: String,
    pub version: i64,
    pub size_bytes: i64,
    pub created_at: i64,
    pub last_used_at: i64,
    pub stopped_at: Option<i64>,
    pub approved_at: Option<i64>,
    pub mount_paths: Option<String>,
    pub error: Option<String>,
}

impl SandboxRow {
    pub(crate) fn encode(sandbox: &Sandbox) -> Result<Self, StoreError> {
        Ok(Self {
            id: sandbox.id.to_string(),
            scope_path: sandbox.scope_path.clone(),
            project_root: sandbox.project_root.to_string_lossy().to_string(),
            status: sandbox.status.as_str().to_string(),
            owner: sandbox.owner.clone(),
            idempotency_key: sandbox.idempotency_key.clone(),
            driver: sandbox.driver.clone(),
            version: to_db_u64(sandbox.version),
            size_bytes: to_db_u64(sandbox.size_bytes),
            created_at: to_micros(sandbox.created_at),
            last_used_at: to_micros(sandbox.last_used_at),
            stopped_at: sandbox.stopped_at.map(to_micros),
            approved_at: sandbox.approved_at.map(to_micros),
            mount_paths: sandbox
                .mount_paths
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            error: sandbox.error.as_ref().map(serde_json::to_string).transpose()?,
        })
    }

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope_path: row.get(1)?,
            project_root: row.get(2)?,
            status: row.get(3)?,
            owner: row.get(4)?,
            idempotency_key: row.get(5)?,
            driver: row.get(6)?,
            version: row.get(7)?,
            size_bytes: row.get(8)?,
            created_at: row.get(9)?,
            last_used_at: row.get(10)?,
            stopped_at: row.get(11)?,
            approved_at: row.get(12)?,
            mount_paths: row.get(13)?,
            error: row.get(14)?,
        })
    }

    pub(crate) fn decode(self) -> Result<Sandbox, StoreError> {
        let status: SandboxStatus = self.status.parse().map_err(StoreError::Corrupt)?;
        let mount_paths: Option<MountPaths> = self
            .mount_paths
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let error: Option<SandboxFailure> =
            self.error.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Sandbox {
            id: parse_uuid(&self.id)?,
            scope_path: self.scope_path,
            project_root: PathBuf::from(self.project_root),
            status,
            owner: self.owner,
            idempotency_key: self.idempotency_key,
            driver: self.driver,
            version: from_db_u64("version", self.version)?,
            size_bytes: from_db_u64("size_bytes", self.size_bytes)?,
            created_at: from_micros(self.created_at)?,
            last_used_at: from_micros(self.last_used_at)?,
            stopped_at: self.stopped_at.map(from_micros).transpose()?,
            approved_at: self.approved_at.map(from_micros).transpose()?,
            mount_paths,
            error,
        })
    }
}

/// Owned column values for one audit row, in `AUDIT_COLUMNS` order.
pub(crate) struct AuditRow {
    pub id: String,
    pub sandbox_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub actor_type: String,
    pub details: String,
    pub recorded_at: i64,
}

impl AuditRow {
    pub(crate) fn encode(event: &AuditEvent) -> Result<Self, StoreError> {
        Ok(Self {
            id: event.id.to_string(),
            sandbox_id: event.sandbox_id.map(|id| id.to_string()),
            event_type: event.event_type.as_str().to_string(),
            actor: event.actor.clone(),
            actor_type: event.actor_type.as_str().to_string(),
            details: serde_json::to_string(&event.details)?,
            recorded_at: to_micros(event.recorded_at),
        })
    }

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sandbox_id: row.get(1)?,
            event_type: row.get(2)?,
            actor: row.get(3)?,
            actor_type: row.get(4)?,
            details: row.get(5)?,
            recorded_at: row.get(6)?,
        })
    }

    pub(crate) fn decode(self) -> Result<AuditEvent, StoreError> {
        let event_type: EventType = self.event_type.parse().map_err(StoreError::Corrupt)?;
        let actor_type: ActorType = self.actor_type.parse().map_err(StoreError::Corrupt)?;
        let details: Map<String, Value> = serde_json::from_str(&self.details)?;
        Ok(AuditEvent {
            id: parse_uuid(&self.id)?,
            sandbox_id: self.sandbox_id.as_deref().map(parse_uuid).transpose()?,
            event_type,
            actor: self.actor,
            actor_type,
            details,
            recorded_at: from_micros(self.recorded_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SandboxRow, from_micros, to_micros};
    use chrono::Utc;
    use enclave_rs_protocol::{ErrorCode, MountPaths, Sandbox, SandboxFailure, SandboxStatus};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn timestamps_keep_microsecond_precision() {
        let now = Utc::now();
        let back = from_micros(to_micros(now)).expect("in range");
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
        assert!(from_micros(i64::MAX).is_err());
    }

    #[test]
    fn json_columns_survive_encoding() {
        let mut sandbox = Sandbox::new("src", "/p", "alice", "copy");
        sandbox.status = SandboxStatus::Error;
        sandbox.mount_paths = Some(MountPaths {
            lower: PathBuf::from("/p/src"),
            upper: PathBuf::from("/s/upper"),
            work: None,
            merged: PathBuf::from("/s/merged"),
        });
        sandbox.error = Some(SandboxFailure {
            code: ErrorCode::MountFailed,
            operation: "mount".to_string(),
            message: "boom".to_string(),
            details: None,
        });
        let row = SandboxRow::encode(&sandbox).expect("encode");
        assert_eq!(row.status, "error");
        let decoded = SandboxRow::decode(row).expect("decode");
        assert_eq!(decoded.mount_paths, sandbox.mount_paths);
        assert_eq!(decoded.error, sandbox.error);
        assert_eq!(decoded.status, SandboxStatus::Error);
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let sandbox = Sandbox::new("src", "/p", "alice", "copy");
        let mut row = SandboxRow::encode(&sandbox).expect("encode");
        row.status = "paused".to_string();
        assert!(row.decode().is_err());
    }
}
