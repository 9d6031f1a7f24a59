use chrono::{DateTime, Utc};
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, GcPolicy, ListRequest, Page, PathConflict, Sandbox, SandboxId,
    SandboxStats,
};
use enclave_rs_store::{Repository, SandboxStore, SqliteRepository, StoreError, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory repository whose transactional version-checked writes can be
/// made to lose the race a set number of times.
pub struct ContendedRepository {
    inner: SqliteRepository,
    stale_writes: AtomicUsize,
    attempts: AtomicUsize,
}

impl ContendedRepository {
    pub fn new() -> Self {
        Self {
            inner: SqliteRepository::open_in_memory().expect("in-memory store"),
            stale_writes: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` version-checked writes with `StaleVersion`.
    pub fn lose_next(&self, count: usize) {
        self.attempts.store(0, Ordering::SeqCst);
        self.stale_writes.store(count, Ordering::SeqCst);
    }

    /// Version-checked writes attempted since the last [`Self::lose_next`].
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Direct writes are never contended.
    fn before_checked_write(&self, _: &Sandbox, _: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn lose(&self, sandbox: &Sandbox, expected_version: u64) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let lost = self
            .stale_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::StaleVersion {
                id: sandbox.id,
                expected: expected_version,
                found: expected_version + 1,
            });
        }
        Ok(())
    }
}

struct ContendedTransaction<'a> {
    repo: &'a ContendedRepository,
    inner: Box<dyn Transaction + 'a>,
}

macro_rules! delegate_store {
    ($target:ty) => {
        impl SandboxStore for $target {
            fn create(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
                self.inner.create(sandbox)
            }

            fn get(&self, id: SandboxId) -> Result<Option<Sandbox>, StoreError> {
                self.inner.get(id)
            }

            fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
                self.inner.update(sandbox)
            }

            fn update_with_version_check(
                &self,
                sandbox: &Sandbox,
                expected_version: u64,
            ) -> Result<(), StoreError> {
                self.before_checked_write(sandbox, expected_version)?;
                self.inner.update_with_version_check(sandbox, expected_version)
            }

            fn delete(&self, id: SandboxId) -> Result<bool, StoreError> {
                self.inner.delete(id)
            }

            fn list(&self, filter: &ListRequest) -> Result<Page<Sandbox>, StoreError> {
                self.inner.list(filter)
            }

            fn check_scope_overlap(
                &self,
                scope_path: &str,
                project_root: &Path,
                exclude: Option<SandboxId>,
            ) -> Result<Vec<PathConflict>, StoreError> {
                self.inner.check_scope_overlap(scope_path, project_root, exclude)
            }

            fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>, StoreError> {
                self.inner.find_by_idempotency_key(key)
            }

            fn gc_candidates(
                &self,
                policy: &GcPolicy,
                now: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<Sandbox>, StoreError> {
                self.inner.gc_candidates(policy, now, limit)
            }

            fn stats(&self) -> Result<SandboxStats, StoreError> {
                self.inner.stats()
            }

            fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent, StoreError> {
                self.inner.log_audit_event(event)
            }

            fn audit_log(&self, request: &AuditLogRequest) -> Result<Page<AuditEvent>, StoreError> {
                self.inner.audit_log(request)
            }
        }
    };
}

delegate_store!(ContendedRepository);
delegate_store!(ContendedTransaction<'_>);

impl ContendedTransaction<'_> {
    fn before_checked_write(
        &self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.repo.lose(sandbox, expected_version)
    }
}

impl Repository for ContendedRepository {
    fn begin_tx(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        Ok(Box::new(ContendedTransaction {
            repo: self,
            inner: self.inner.begin_tx()?,
        }))
    }
}

impl Transaction for ContendedTransaction<'_> {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback()
    }
}
