//! SQLite-backed repository.
//!
//! A single connection sits behind a mutex. A transaction holds the lock for
//! its whole lifetime, so units of work are serialized and never interleave
//! with direct repository calls.

mod codec;
mod queries;
mod schema;

use crate::repository::{Repository, SandboxStore, Transaction};
use crate::StoreError;
use chrono::{DateTime, Utc};
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, GcPolicy, ListRequest, Page, PathConflict, Sandbox, SandboxId,
    SandboxStats,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use queries::Queries;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Database name that keeps everything in memory.
pub const IN_MEMORY: &str = ":memory:";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Repository persisted in a SQLite database file (or memory).
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `path`; `:memory:` opens a
    /// private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path == Path::new(IN_MEMORY) {
            return Self::open_in_memory();
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("sqlite journal mode (path={}, mode={mode})", path.display());
        let repo = Self::init(conn)?;
        info!("sqlite repository opened (path={})", path.display());
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&Queries<'_>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let conn = self.conn.lock();
        f(&Queries::new(&conn))
    }
}

impl Repository for SqliteRepository {
    fn begin_tx(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

/// Open unit of work; rolls back on drop unless committed.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn with<R>(&self, f: impl FnOnce(&Queries<'_>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        f(&Queries::new(&self.conn))
    }

    fn finish(&mut self, statement: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(statement)?;
        self.finished = true;
        Ok(())
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            warn!("rollback of abandoned transaction failed: {err}");
        }
    }
}

macro_rules! sandbox_store_via_queries {
    ($target:ty) => {
        impl SandboxStore for $target {
            fn create(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
                self.with(|q| q.create(sandbox))
            }

            fn get(&self, id: SandboxId) -> Result<Option<Sandbox>, StoreError> {
                self.with(|q| q.get(id))
            }

            fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
                self.with(|q| q.update(sandbox, None))
            }

            fn update_with_version_check(
                &self,
                sandbox: &Sandbox,
                expected_version: u64,
            ) -> Result<(), StoreError> {
                self.with(|q| q.update(sandbox, Some(expected_version)))
            }

            fn delete(&self, id: SandboxId) -> Result<bool, StoreError> {
                self.with(|q| q.delete(id))
            }

            fn list(&self, filter: &ListRequest) -> Result<Page<Sandbox>, StoreError> {
                self.with(|q| q.list(filter))
            }

            fn check_scope_overlap(
                &self,
                scope_path: &str,
                project_root: &Path,
                exclude: Option<SandboxId>,
            ) -> Result<Vec<PathConflict>, StoreError> {
                self.with(|q| q.scope_overlap(scope_path, project_root, exclude))
            }

            fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>, StoreError> {
                self.with(|q| q.find_by_idempotency_key(key))
            }

            fn gc_candidates(
                &self,
                policy: &GcPolicy,
                now: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<Sandbox>, StoreError> {
                self.with(|q| q.gc_candidates(policy, now, limit))
            }

            fn stats(&self) -> Result<SandboxStats, StoreError> {
                self.with(|q| q.stats())
            }

            fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent, StoreError> {
                self.with(|q| q.log_audit_event(event))
            }

            fn audit_log(&self, request: &AuditLogRequest) -> Result<Page<AuditEvent>, StoreError> {
                self.with(|q| q.audit_log(request))
            }
        }
    };
}

sandbox_store_via_queries!(SqliteRepository);
sandbox_store_via_queries!(SqliteTransaction<'_>);
