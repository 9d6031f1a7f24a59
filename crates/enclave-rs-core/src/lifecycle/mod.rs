//! Sandbox lifecycle: the state machine that coordinates the repository and
//! the drivers.
//!
//! Every mutation follows the same envelope: read the record, compute the
//! next value, then write it with a version check and its audit event in one
//! transaction. Driver calls always happen outside transactions.

mod create;
mod locks;
mod runtime;
mod transitions;

pub use locks::SandboxLocks;
pub use runtime::RecoveryReport;

use crate::audit::{Actor, announce, sandbox_event};
use crate::context::RequestContext;
use crate::error::EnclaveError;
use enclave_rs_config::{ApprovalConfig, EnclaveConfig, LifecycleConfig};
use enclave_rs_driver::{Driver, DriverError, DriverRegistry, FailureClass};
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, ErrorCode, EventType, FileChange, ListRequest, Page, Sandbox,
    SandboxFailure, SandboxId, SandboxStats, SandboxStatus,
};
use enclave_rs_store::{Repository, StoreError};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Public entry point for sandbox operations.
pub struct SandboxService {
    repo: Arc<dyn Repository>,
    drivers: Arc<DriverRegistry>,
    lifecycle: LifecycleConfig,
    approval: ApprovalConfig,
    locks: SandboxLocks,
}

/// Why a driver step produced no value.
pub(crate) enum StepFailure {
    Cancelled,
    Unavailable(DriverError),
    Fatal(DriverError),
}

impl StepFailure {
    fn into_failure(self, operation: &str) -> SandboxFailure {
        let (code, message) = match self {
            StepFailure::Cancelled => (ErrorCode::Cancelled, "operation cancelled".to_string()),
            StepFailure::Unavailable(err) => (ErrorCode::DriverUnavailable, err.to_string()),
            StepFailure::Fatal(err @ DriverError::MountFailed(_)) => {
                (ErrorCode::MountFailed, err.to_string())
            }
            StepFailure::Fatal(err) => (ErrorCode::Internal, err.to_string()),
        };
        SandboxFailure {
            code,
            operation: operation.to_string(),
            message,
            details: None,
        }
    }
}

impl SandboxService {
    pub fn new(
        repo: Arc<dyn Repository>,
        drivers: Arc<DriverRegistry>,
        config: &EnclaveConfig,
    ) -> Self {
        Self {
            repo,
            drivers,
            lifecycle: config.lifecycle.clone(),
            approval: config.approval.clone(),
            locks: SandboxLocks::new(),
        }
    }

    /// Per-sandbox locks; hand them to a [`crate::GcService`] sharing this
    /// repository so collection never races a transition.
    pub fn locks(&self) -> &SandboxLocks {
        &self.locks
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn get(&self, ctx: &RequestContext, id: SandboxId) -> Result<Sandbox, EnclaveError> {
        ctx.check()?;
        self.load(id)
    }

    pub fn list(
        &self,
        ctx: &RequestContext,
        request: &ListRequest,
    ) -> Result<Page<Sandbox>, EnclaveError> {
        ctx.check()?;
        Ok(self.repo.list(request)?)
    }

    pub fn audit_log(
        &self,
        ctx: &RequestContext,
        request: &AuditLogRequest,
    ) -> Result<Page<AuditEvent>, EnclaveError> {
        ctx.check()?;
        Ok(self.repo.audit_log(request)?)
    }

    pub fn stats(&self, ctx: &RequestContext) -> Result<SandboxStats, EnclaveError> {
        ctx.check()?;
        Ok(self.repo.stats()?)
    }

    /// Current change set of a sandbox, mounted or not.
    pub async fn changes(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
    ) -> Result<Vec<FileChange>, EnclaveError> {
        let sandbox = self.get(ctx, id)?;
        let driver = self.driver_for(&sandbox)?;
        Ok(ctx.run(driver.changed_files(&sandbox)).await??)
    }

    fn load(&self, id: SandboxId) -> Result<Sandbox, EnclaveError> {
        self.repo.get(id)?.ok_or(EnclaveError::NotFound(id))
    }

    fn driver_for(&self, sandbox: &Sandbox) -> Result<Arc<dyn Driver>, EnclaveError> {
        Ok(self.drivers.get(&sandbox.driver)?)
    }

    /// Read-modify-write with a version check. `change` edits a fresh copy
    /// and returns the audit event committed with it; stale writes are
    /// retried from a new read.
    fn mutate<F>(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        mut change: F,
    ) -> Result<Sandbox, EnclaveError>
    where
        F: FnMut(&mut Sandbox) -> Result<Option<AuditEvent>, EnclaveError>,
    {
        let retries = self.lifecycle.retry_attempts_on_stale_version;
        for attempt in 0..=retries {
            ctx.check()?;
            let current = self.load(id)?;
            let expected = current.version;
            let mut next = current;
            let event = change(&mut next)?;
            next.version = expected + 1;

            let tx = self.repo.begin_tx()?;
            match tx.update_with_version_check(&next, expected) {
                Ok(()) => {}
                Err(StoreError::StaleVersion { found, .. }) => {
                    debug!(
                        "stale write, retrying (sandbox_id={id}, expected={expected}, found={found}, attempt={attempt})"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            let stored = match event {
                Some(event) => Some(tx.log_audit_event(&event)?),
                None => None,
            };
            tx.commit()?;
            if let Some(event) = &stored {
                announce(event);
            }
            return Ok(next);
        }
        warn!("version contention exhausted retries (sandbox_id={id}, retries={retries})");
        Err(EnclaveError::Contention(id))
    }

    /// Run a driver step with transient retries and cancellation.
    async fn drive<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        sandbox: &Sandbox,
        operation: &'static str,
        actor: &Actor,
        mut call: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let retries = self.lifecycle.retry_attempts_on_transient_driver_error;
        let mut attempt = 0u32;
        loop {
            let err = match ctx.run(call()).await {
                Err(_) => return Err(StepFailure::Cancelled),
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
            };
            match err.class() {
                FailureClass::Unavailable => return Err(StepFailure::Unavailable(err)),
                FailureClass::Transient if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "transient driver failure, retrying (sandbox_id={}, operation={operation}, attempt={attempt}, error={err})",
                        sandbox.id
                    );
                    self.record_driver_error(sandbox, operation, &err, actor);
                    let backoff = self
                        .lifecycle
                        .transient_backoff_ms
                        .saturating_mul(u64::from(attempt));
                    if ctx
                        .run(tokio::time::sleep(Duration::from_millis(backoff)))
                        .await
                        .is_err()
                    {
                        return Err(StepFailure::Cancelled);
                    }
                }
                _ => return Err(StepFailure::Fatal(err)),
            }
        }
    }

    /// Move a sandbox to `error` with `failure` as the recorded cause.
    fn fail(&self, id: SandboxId, failure: SandboxFailure, actor: &Actor) -> EnclaveError {
        let settled = RequestContext::new();
        let result = self.mutate(&settled, id, |sandbox| {
            if sandbox.status.is_terminal() {
                return Err(illegal(sandbox, "fail"));
            }
            sandbox.status = SandboxStatus::Error;
            sandbox.error = Some(failure.clone());
            let mut event = sandbox_event(EventType::SandboxError, sandbox, actor)
                .detail("operation", failure.operation.clone())
                .detail("code", failure.code.as_str())
                .detail("message", failure.message.clone());
            if let Some(details) = &failure.details {
                event = event.detail("details", details.clone());
            }
            Ok(Some(event))
        });
        match result {
            Ok(_) => {
                warn!(
                    "sandbox failed (sandbox_id={id}, operation={}, code={}, message={})",
                    failure.operation, failure.code, failure.message
                );
                EnclaveError::SandboxFailed {
                    id,
                    failure: Box::new(failure),
                }
            }
            Err(err) => {
                warn!("could not record sandbox failure (sandbox_id={id}, error={err})");
                err
            }
        }
    }

    /// Audit a driver failure that did not change state.
    fn record_driver_error(
        &self,
        sandbox: &Sandbox,
        operation: &str,
        err: &DriverError,
        actor: &Actor,
    ) {
        let event = sandbox_event(EventType::DriverError, sandbox, actor)
            .detail("operation", operation)
            .detail("error", err.to_string());
        match self.repo.log_audit_event(&event) {
            Ok(stored) => announce(&stored),
            Err(store_err) => warn!(
                "could not audit driver error (sandbox_id={}, error={store_err})",
                sandbox.id
            ),
        }
    }

    /// Sum of change sizes, or `None` when the driver cannot list changes.
    async fn probe_size(
        &self,
        ctx: &RequestContext,
        driver: &Arc<dyn Driver>,
        sandbox: &Sandbox,
    ) -> Option<u64> {
        match ctx.run(driver.changed_files(sandbox)).await {
            Ok(Ok(changes)) => Some(total_size(&changes)),
            Ok(Err(err)) => {
                warn!(
                    "size probe failed (sandbox_id={}, error={err})",
                    sandbox.id
                );
                None
            }
            Err(_) => None,
        }
    }
}

pub(crate) fn total_size(changes: &[FileChange]) -> u64 {
    changes.iter().map(|change| change.size).sum()
}

fn illegal(sandbox: &Sandbox, operation: &'static str) -> EnclaveError {
    EnclaveError::IllegalTransition {
        id: sandbox.id,
        status: sandbox.status,
        operation,
    }
}

/// Fail with `IllegalTransition` unless the record is in one of `allowed`.
fn require(
    sandbox: &Sandbox,
    allowed: &[SandboxStatus],
    operation: &'static str,
) -> Result<(), EnclaveError> {
    if allowed.contains(&sandbox.status) {
        Ok(())
    } else {
        Err(illegal(sandbox, operation))
    }
}
