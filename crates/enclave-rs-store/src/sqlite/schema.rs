//! Schema bootstrap and versioning.

use crate::StoreError;
use log::{debug, info};
use rusqlite::Connection;

/// Schema version written to `PRAGMA user_version`.
pub(crate) const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS sandboxes (
    id TEXT PRIMARY KEY,
    scope_path TEXT NOT NULL,
    project_root TEXT NOT NULL,
    status TEXT NOT NULL,
    owner TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    driver TEXT NOT NULL,
    version INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    stopped_at INTEGER,
    approved_at INTEGER,
    mount_paths TEXT,
    error TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS sandboxes_live_scope
    ON sandboxes (project_root, scope_path)
    WHERE status NOT IN ('approved', 'rejected', 'error');
CREATE INDEX IF NOT EXISTS sandboxes_created_at ON sandboxes (created_at);
CREATE INDEX IF NOT EXISTS sandboxes_status ON sandboxes (status);
CREATE TABLE IF NOT EXISTS audit_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    sandbox_id TEXT,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    details TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_events_sandbox ON audit_events (sandbox_id, seq);
";

/// Create or verify the schema.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema(current));
    }
    if current == SCHEMA_VERSION {
        debug!("sqlite schema up to date (version={current})");
        return Ok(());
    }
    conn.execute_batch(SCHEMA_V1)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    info!("sqlite schema initialized (version={SCHEMA_VERSION})");
    Ok(())
}
