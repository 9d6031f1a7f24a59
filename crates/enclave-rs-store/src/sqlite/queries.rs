//! SQL statements shared by the repository and its transactions.

use super::codec::{AUDIT_COLUMNS, AuditRow, SANDBOX_COLUMNS, SandboxRow, from_micros, to_db_u64};
use crate::StoreError;
use crate::repository::{MAX_PAGE_SIZE, page_offset, page_size};
use chrono::{DateTime, Utc};
use enclave_rs_protocol::scope;
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, GcPolicy, ListRequest, Page, PathConflict, Sandbox, SandboxId,
    SandboxStats, SandboxStatus,
};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Params, ToSql, params, params_from_iter};
use std::path::Path;

/// Audit page size when the request leaves `limit` at zero.
const DEFAULT_AUDIT_LIMIT: usize = 100;

const LIVE_STATUSES: &str = "('creating', 'active', 'stopping')";
const TERMINAL_STATUSES: &str = "('approved', 'rejected', 'error')";

pub(crate) struct Queries<'c> {
    conn: &'c Connection,
}

fn bind(row: &SandboxRow) -> Vec<&dyn ToSql> {
    vec![
        &row.id,
        &row.scope_path,
        &row.project_root,
        &row.status,
        &row.owner,
        &row.idempotency_key,
        &row.driver,
        &row.version,
        &row.size_bytes,
        &row.created_at,
        &row.last_used_at,
        &row.stopped_at,
        &row.approved_at,
        &row.mount_paths,
        &row.error,
    ]
}

/// `scope_path` equals the prefix bound at `?n` or lies beneath it on a
/// segment boundary.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn within_prefix(n: usize) -> String {
    format!("(scope_path = ?{n} OR substr(scope_path, 1, length(?{n}) + 1) = ?{n} || '/')")
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn within_prefix(n: usize) -> String {
    format!(
        "(lower(scope_path) = lower(?{n}) \
         OR substr(lower(scope_path), 1, length(?{n}) + 1) = lower(?{n}) || '/')"
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn scope_taken(sandbox: &Sandbox) -> StoreError {
    StoreError::ScopeTaken {
        project_root: sandbox.project_root.display().to_string(),
        scope_path: sandbox.scope_path.clone(),
    }
}

impl<'c> Queries<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub(crate) fn create(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        if let Some(key) = sandbox.idempotency_key.as_deref()
            && let Some(existing) = self.find_by_idempotency_key(key)?
        {
            return Err(StoreError::ConflictIdempotency(Box::new(existing)));
        }
        let row = SandboxRow::encode(sandbox)?;
        let sql = format!(
            "INSERT INTO sandboxes ({SANDBOX_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        match self.conn.execute(&sql, bind(&row).as_slice()) {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(scope_taken(sandbox)),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn get(&self, id: SandboxId) -> Result<Option<Sandbox>, StoreError> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?1");
        self.select_one(&sql, [id.to_string()])
    }

    /// Write every column. With `expected`, the write only lands when the
    /// stored version still equals it.
    pub(crate) fn update(&self, sandbox: &Sandbox, expected: Option<u64>) -> Result<(), StoreError> {
        if let Some(expected) = expected
            && sandbox.version <= expected
        {
            return Err(StoreError::VersionNotIncreased {
                id: sandbox.id,
                expected,
            });
        }
        let row = SandboxRow::encode(sandbox)?;
        let expected_db = expected.map(to_db_u64);
        let mut sql = String::from(
            "UPDATE sandboxes SET scope_path = ?2, project_root = ?3, status = ?4, owner = ?5, \
             idempotency_key = ?6, driver = ?7, version = ?8, size_bytes = ?9, created_at = ?10, \
             last_used_at = ?11, stopped_at = ?12, approved_at = ?13, mount_paths = ?14, \
             error = ?15 WHERE id = ?1",
        );
        let mut values = bind(&row);
        if let Some(expected) = expected_db.as_ref() {
            sql.push_str(" AND version = ?16");
            values.push(expected);
        }
        let changed = match self.conn.execute(&sql, values.as_slice()) {
            Ok(changed) => changed,
            Err(err) if is_constraint_violation(&err) => return Err(scope_taken(sandbox)),
            Err(err) => return Err(err.into()),
        };
        if changed == 1 {
            return Ok(());
        }
        let found = self
            .stored_version(sandbox.id)?
            .ok_or(StoreError::NotFound(sandbox.id))?;
        debug!(
            "version check rejected update (sandbox_id={}, expected={:?}, found={found})",
            sandbox.id, expected
        );
        Err(StoreError::StaleVersion {
            id: sandbox.id,
            expected: expected.unwrap_or(found),
            found,
        })
    }

    pub(crate) fn delete(&self, id: SandboxId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM sandboxes WHERE id = ?1", [id.to_string()])?;
        Ok(removed > 0)
    }

    pub(crate) fn list(&self, filter: &ListRequest) -> Result<Page<Sandbox>, StoreError> {
        let prefix = filter
            .scope_prefix
            .as_deref()
            .map(scope::normalize_scope)
            .transpose()
            .map_err(|err| StoreError::InvalidFilter(err.to_string()))?;

        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(statuses) = filter.status.as_ref().filter(|list| !list.is_empty()) {
            let mut placeholders = Vec::with_capacity(statuses.len());
            for status in statuses {
                values.push(Value::Text(status.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if let Some(owner) = &filter.owner {
            values.push(Value::Text(owner.clone()));
            clauses.push(format!("owner = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(Value::Integer(since.timestamp_micros()));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(Value::Integer(until.timestamp_micros()));
            clauses.push(format!("created_at < ?{}", values.len()));
        }
        if let Some(prefix) = prefix.filter(|prefix| prefix != scope::ROOT_SCOPE) {
            values.push(Value::Text(prefix));
            clauses.push(within_prefix(values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let offset = page_offset(filter.page_token.as_deref());
        let size = page_size(filter.page_size);
        // One extra row tells whether another page follows.
        values.push(Value::Integer(i64::try_from(size + 1).unwrap_or(i64::MAX)));
        let limit_at = values.len();
        values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        let offset_at = values.len();
        let sql = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes{where_clause} \
             ORDER BY created_at, rowid LIMIT ?{limit_at} OFFSET ?{offset_at}"
        );
        let mut items = self.select_many(&sql, params_from_iter(values))?;
        let next_page_token = (items.len() > size).then(|| (offset + size).to_string());
        items.truncate(size);
        Ok(Page {
            items,
            next_page_token,
        })
    }

    pub(crate) fn scope_overlap(
        &self,
        scope_path: &str,
        project_root: &Path,
        exclude: Option<SandboxId>,
    ) -> Result<Vec<PathConflict>, StoreError> {
        let sql = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes \
             WHERE project_root = ?1 AND status NOT IN {TERMINAL_STATUSES} \
             ORDER BY created_at, rowid"
        );
        let live = self.select_many(&sql, [project_root.to_string_lossy().to_string()])?;
        Ok(live
            .into_iter()
            .filter(|sandbox| Some(sandbox.id) != exclude)
            .filter_map(|sandbox| {
                let relation = scope::relation(&sandbox.scope_path, scope_path)?;
                Some(PathConflict {
                    sandbox_id: sandbox.id,
                    scope_path: sandbox.scope_path,
                    status: sandbox.status,
                    relation,
                })
            })
            .collect())
    }

    pub(crate) fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>, StoreError> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE idempotency_key = ?1");
        self.select_one(&sql, [key])
    }

    pub(crate) fn gc_candidates(
        &self,
        policy: &GcPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sandbox>, StoreError> {
        let sql = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE status NOT IN {LIVE_STATUSES} \
             ORDER BY created_at, rowid"
        );
        let mut matched: Vec<(DateTime<Utc>, Sandbox)> = self
            .select_many(&sql, params![])?
            .into_iter()
            .filter_map(|sandbox| {
                let (_, measured_at) = policy.matched_criteria(&sandbox, now).into_iter().next()?;
                Some((measured_at, sandbox))
            })
            .collect();
        matched.sort_by_key(|(measured_at, _)| *measured_at);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(_, sandbox)| sandbox)
            .collect())
    }

    pub(crate) fn stats(&self) -> Result<SandboxStats, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM sandboxes GROUP BY status",
        )?;
        let rows = stmt.query_map(params![], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut stats = SandboxStats::default();
        for row in rows {
            let (status, count, size) = row?;
            let status: SandboxStatus = status.parse().map_err(StoreError::Corrupt)?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.count += count;
            stats.total_size_bytes += u64::try_from(size).unwrap_or(0);
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }

    pub(crate) fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent, StoreError> {
        let mut stored = event.clone();
        stored.recorded_at = from_micros(event.recorded_at.timestamp_micros())?;
        if let Some(sandbox_id) = event.sandbox_id {
            let last: Option<i64> = self.conn.query_row(
                "SELECT MAX(recorded_at) FROM audit_events WHERE sandbox_id = ?1",
                [sandbox_id.to_string()],
                |row| row.get(0),
            )?;
            if let Some(last) = last.map(from_micros).transpose()?
                && stored.recorded_at < last
            {
                debug!("clamping audit timestamp to preserve order (sandbox_id={sandbox_id})");
                stored.recorded_at = last;
            }
        }
        let row = AuditRow::encode(&stored)?;
        let sql = format!("INSERT INTO audit_events ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)");
        self.conn.execute(
            &sql,
            params![
                row.id,
                row.sandbox_id,
                row.event_type,
                row.actor,
                row.actor_type,
                row.details,
                row.recorded_at
            ],
        )?;
        Ok(stored)
    }

    pub(crate) fn audit_log(&self, request: &AuditLogRequest) -> Result<Page<AuditEvent>, StoreError> {
        let limit = match request.limit {
            0 => DEFAULT_AUDIT_LIMIT,
            limit => limit.min(MAX_PAGE_SIZE),
        };
        let mut values: Vec<Value> = Vec::new();
        let mut where_clause = String::new();
        if let Some(sandbox_id) = request.sandbox_id {
            values.push(Value::Text(sandbox_id.to_string()));
            where_clause = " WHERE sandbox_id = ?1".to_string();
        }
        values.push(Value::Integer(to_db_u64(limit as u64 + 1)));
        let limit_slot = values.len();
        values.push(Value::Integer(to_db_u64(request.offset as u64)));
        let offset_slot = values.len();
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events{where_clause} \
             ORDER BY seq LIMIT ?{limit_slot} OFFSET ?{offset_slot}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), AuditRow::read)?;
        let mut items = rows
            .map(|row| row.map_err(StoreError::from).and_then(AuditRow::decode))
            .collect::<Result<Vec<_>, _>>()?;
        let next_page_token = (items.len() > limit).then(|| (request.offset + limit).to_string());
        items.truncate(limit);
        Ok(Page {
            items,
            next_page_token,
        })
    }

    fn stored_version(&self, id: SandboxId) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM sandboxes WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|version| u64::try_from(version).unwrap_or(0)))
    }

    fn select_one<P: Params>(&self, sql: &str, params: P) -> Result<Option<Sandbox>, StoreError> {
        self.conn
            .query_row(sql, params, SandboxRow::read)
            .optional()?
            .map(SandboxRow::decode)
            .transpose()
    }

    fn select_many<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Sandbox>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, SandboxRow::read)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(SandboxRow::decode))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Queries;
    use crate::sqlite::schema::migrate;
    use chrono::{TimeDelta, Utc};
    use enclave_rs_protocol::{GcPolicy, Sandbox, SandboxStatus};
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        migrate(&conn).expect("migrate");
        conn
    }

    fn finished(scope: &str, status: SandboxStatus, hours_ago: i64) -> Sandbox {
        let mut sandbox = Sandbox::new(scope, "/p", "alice", "copy");
        let at = Utc::now() - TimeDelta::hours(hours_ago);
        sandbox.status = status;
        sandbox.created_at = at;
        sandbox.last_used_at = at;
        sandbox.stopped_at = Some(at);
        sandbox
    }

    #[test]
    fn gc_candidates_sort_by_first_matching_timestamp() {
        let conn = connection();
        let queries = Queries::new(&conn);
        let newer = finished("b", SandboxStatus::Rejected, 10);
        let older = finished("a", SandboxStatus::Rejected, 20);
        let live = finished("c", SandboxStatus::Active, 30);
        for sandbox in [&newer, &older, &live] {
            queries.create(sandbox).expect("create");
        }
        let policy = GcPolicy {
            max_age: Some(3600),
            ..GcPolicy::default()
        };
        let picked = queries
            .gc_candidates(&policy, Utc::now(), 10)
            .expect("candidates");
        let ids: Vec<_> = picked.iter().map(|sandbox| sandbox.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        let limited = queries
            .gc_candidates(&policy, Utc::now(), 1)
            .expect("candidates");
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn stats_group_by_status() {
        let conn = connection();
        let queries = Queries::new(&conn);
        let mut first = finished("a", SandboxStatus::Stopped, 1);
        first.size_bytes = 10;
        let mut second = finished("b", SandboxStatus::Stopped, 1);
        second.size_bytes = 5;
        let third = finished("c", SandboxStatus::Error, 1);
        for sandbox in [&first, &second, &third] {
            queries.create(sandbox).expect("create");
        }
        let stats = queries.stats().expect("stats");
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_size_bytes, 15);
        assert_eq!(stats.by_status.get(&SandboxStatus::Stopped), Some(&2));
        assert_eq!(stats.by_status.get(&SandboxStatus::Error), Some(&1));
    }
}
