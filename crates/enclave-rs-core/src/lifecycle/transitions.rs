use super::{SandboxService, StepFailure, illegal, require, total_size};
use crate::approval::{apply_changes, git_commit};
use crate::audit::{Actor, sandbox_event};
use crate::context::RequestContext;
use crate::error::EnclaveError;
use crate::gc::{Reclaimed, reclaim};
use crate::policy::{PolicyDecision, evaluate};
use chrono::Utc;
use enclave_rs_protocol::{
    ApprovalResult, ApproveRequest, ErrorCode, EventType, GcReason, RejectRequest, Sandbox,
    SandboxFailure, SandboxId, SandboxStatus, StopSandboxRequest,
};
use log::{info, warn};

impl SandboxService {
    /// Unmount an active sandbox, keeping its upper layer.
    pub async fn stop(
        &self,
        ctx: &RequestContext,
        request: StopSandboxRequest,
    ) -> Result<Sandbox, EnclaveError> {
        let _guard = ctx.run(self.locks.acquire(request.id)).await?;
        let sandbox = self.get(ctx, request.id)?;
        let actor = Actor::user(request.actor.unwrap_or_else(|| sandbox.owner.clone()));
        self.stop_active(ctx, request.id, &actor).await
    }

    /// Apply a sandbox's changes to the host tree.
    ///
    /// Holds the sandbox's lock throughout, so a concurrent reject waits and
    /// then finds the record approved. An active sandbox is stopped first. A
    /// denying policy leaves the sandbox `stopped` unless the request carries
    /// a manual override; a failure while writing the host tree moves it to
    /// `error` with the partial-application report attached.
    pub async fn approve(
        &self,
        ctx: &RequestContext,
        request: ApproveRequest,
    ) -> Result<ApprovalResult, EnclaveError> {
        let actor = Actor::new(request.actor, request.actor_type);
        let id = request.id;
        let _guard = ctx.run(self.locks.acquire(id)).await?;
        let sandbox = self.ensure_stopped(ctx, id, &actor, "approve").await?;
        let driver = self.driver_for(&sandbox)?;

        let changes = match self
            .drive(ctx, &sandbox, "changed_files", &actor, || {
                driver.changed_files(&sandbox)
            })
            .await
        {
            Ok(changes) => changes,
            Err(StepFailure::Cancelled) => return Err(EnclaveError::Cancelled),
            Err(StepFailure::Unavailable(err)) => {
                return Err(EnclaveError::DriverUnavailable(err.to_string()));
            }
            Err(step) => return Err(self.fail(id, step.into_failure("approve"), &actor)),
        };
        let size = total_size(&changes);

        if let Some(policy) = &request.policy {
            let decision = evaluate(&changes, policy)?;
            self.mutate(ctx, id, |record| {
                require(record, &[SandboxStatus::Stopped], "approve")?;
                record.size_bytes = size;
                let event = match &decision {
                    PolicyDecision::Allow => sandbox_event(EventType::PolicyPassed, record, &actor),
                    PolicyDecision::Deny(reason) => {
                        sandbox_event(EventType::PolicyFailed, record, &actor)
                            .detail("reason", reason.clone())
                            .detail("manual_override", request.manual_override)
                    }
                };
                Ok(Some(
                    event
                        .detail("files", changes.len())
                        .detail("size_bytes", size),
                ))
            })?;
            if let PolicyDecision::Deny(reason) = decision
                && !request.manual_override
            {
                info!("approval denied by policy (sandbox_id={id}, reason={reason})");
                return Err(EnclaveError::PolicyViolation(reason));
            }
        }

        ctx.check()?;
        let root = sandbox.project_root.clone();
        let scope = sandbox.scope_path.clone();
        let applied = tokio::task::spawn_blocking(move || apply_changes(&root, &scope, &changes))
            .await
            .map_err(|err| EnclaveError::Internal(format!("approval task failed: {err}")))?;
        let files_applied = match applied {
            Ok(count) => count,
            Err(err) => {
                let failure = SandboxFailure {
                    code: ErrorCode::Internal,
                    operation: "approve".to_string(),
                    message: err.to_string(),
                    details: Some(err.report()),
                };
                return Err(self.fail(id, failure, &actor));
            }
        };

        let commit_hash = if self.approval.git_commit {
            let message = format!("Apply sandbox {id} ({})", sandbox.scope_path);
            git_commit(&sandbox.project_root, &sandbox.scope_path, &message).await
        } else {
            None
        };

        let settled = RequestContext::new();
        let approved = self.mutate(&settled, id, |record| {
            require(record, &[SandboxStatus::Stopped], "approve")?;
            record.status = SandboxStatus::Approved;
            record.approved_at = Some(Utc::now());
            record.size_bytes = size;
            Ok(Some(
                sandbox_event(EventType::SandboxApproved, record, &actor)
                    .detail("files_applied", files_applied)
                    .detail("size_bytes", size)
                    .detail("commit_hash", commit_hash.clone()),
            ))
        })?;
        info!(
            "sandbox approved (sandbox_id={id}, files_applied={files_applied}, bytes={size})"
        );
        Ok(ApprovalResult {
            sandbox: approved,
            files_applied,
            commit_hash,
        })
    }

    /// Discard a sandbox's changes. The host tree is untouched and the upper
    /// layer stays on disk until the record is collected.
    pub async fn reject(
        &self,
        ctx: &RequestContext,
        request: RejectRequest,
    ) -> Result<Sandbox, EnclaveError> {
        let actor = Actor::new(request.actor, request.actor_type);
        let id = request.id;
        let _guard = ctx.run(self.locks.acquire(id)).await?;
        self.ensure_stopped(ctx, id, &actor, "reject").await?;
        let rejected = self.mutate(ctx, id, |record| {
            require(record, &[SandboxStatus::Stopped], "reject")?;
            record.status = SandboxStatus::Rejected;
            Ok(Some(
                sandbox_event(EventType::SandboxRejected, record, &actor)
                    .detail("size_bytes", record.size_bytes),
            ))
        })?;
        info!("sandbox rejected (sandbox_id={id})");
        Ok(rejected)
    }

    /// Remove a terminal sandbox: delete its record, then its storage.
    ///
    /// Returns `false` when no record exists.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        actor: &Actor,
    ) -> Result<bool, EnclaveError> {
        let _guard = ctx.run(self.locks.acquire(id)).await?;
        let Some(sandbox) = self.repo.get(id)? else {
            return Ok(false);
        };
        if !sandbox.status.is_terminal() {
            return Err(illegal(&sandbox, "delete"));
        }
        let driver = self.driver_for(&sandbox)?;
        match reclaim(
            self.repo.as_ref(),
            driver.as_ref(),
            &sandbox,
            &[GcReason::Manual],
            actor,
        )
        .await?
        {
            Reclaimed::Collected { soft_error } => {
                if let Some(message) = soft_error {
                    warn!("storage cleanup incomplete (sandbox_id={id}, error={message})");
                }
                Ok(true)
            }
            Reclaimed::Skipped => match self.repo.get(id)? {
                Some(current) => Err(illegal(&current, "delete")),
                None => Ok(false),
            },
        }
    }

    /// Stopped record for approve/reject, stopping an active one first.
    async fn ensure_stopped(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        actor: &Actor,
        operation: &'static str,
    ) -> Result<Sandbox, EnclaveError> {
        let sandbox = self.get(ctx, id)?;
        match sandbox.status {
            SandboxStatus::Stopped => Ok(sandbox),
            SandboxStatus::Active => self.stop_active(ctx, id, actor).await,
            _ => Err(illegal(&sandbox, operation)),
        }
    }

    /// `active → stopping → stopped`, recording the final change size.
    pub(super) async fn stop_active(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        actor: &Actor,
    ) -> Result<Sandbox, EnclaveError> {
        let stopping = self.mutate(ctx, id, |record| {
            require(record, &[SandboxStatus::Active], "stop")?;
            record.status = SandboxStatus::Stopping;
            Ok(None)
        })?;
        self.finish_stop(ctx, stopping, actor).await
    }

    /// Unmount a `stopping` sandbox and settle it in `stopped`.
    pub(super) async fn finish_stop(
        &self,
        ctx: &RequestContext,
        sandbox: Sandbox,
        actor: &Actor,
    ) -> Result<Sandbox, EnclaveError> {
        let id = sandbox.id;
        let driver = self.driver_for(&sandbox)?;
        if let Err(step) = self
            .drive(ctx, &sandbox, "unmount", actor, || driver.unmount(&sandbox))
            .await
        {
            return Err(self.fail(id, step.into_failure("stop"), actor));
        }

        let settled = RequestContext::new();
        let size = self.probe_size(&settled, &driver, &sandbox).await;
        let stopped = self.mutate(&settled, id, |record| {
            require(record, &[SandboxStatus::Stopping], "stop")?;
            record.status = SandboxStatus::Stopped;
            record.stopped_at = Some(Utc::now());
            if let Some(size) = size {
                record.size_bytes = size;
            }
            Ok(Some(
                sandbox_event(EventType::SandboxStopped, record, actor)
                    .detail("size_bytes", record.size_bytes),
            ))
        })?;
        info!(
            "sandbox stopped (sandbox_id={id}, size_bytes={})",
            stopped.size_bytes
        );
        Ok(stopped)
    }
}
