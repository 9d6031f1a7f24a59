use super::{SandboxService, StepFailure, require};
use crate::audit::{Actor, sandbox_event};
use crate::context::RequestContext;
use crate::error::EnclaveError;
use chrono::Utc;
use enclave_rs_driver::{ExecConfig, ExecResult};
use enclave_rs_protocol::{EventType, ListRequest, Sandbox, SandboxId, SandboxStatus};
use enclave_rs_store::MAX_PAGE_SIZE;
use log::{debug, info, warn};
use serde::Serialize;

/// What [`SandboxService::recover`] did to each unsettled record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `creating` records whose mount was retried and succeeded.
    pub mounted: Vec<SandboxId>,
    /// `active` records whose view had to be mounted again.
    pub remounted: Vec<SandboxId>,
    /// `stopping` records settled in `stopped`.
    pub stopped: Vec<SandboxId>,
    /// Records whose `size_bytes` was recomputed.
    pub resized: Vec<SandboxId>,
    /// Records that moved to `error` or could not be recovered, and
    /// orphaned storage that could not be removed.
    pub failed: Vec<SandboxId>,
    /// Driver storage removed because no record owned it.
    pub orphans_removed: Vec<SandboxId>,
}

impl SandboxService {
    /// Run a command in an active sandbox and wait for it to exit.
    pub async fn exec(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, EnclaveError> {
        let sandbox = self.active(ctx, id, "exec")?;
        let driver = self.driver_for(&sandbox)?;
        let result = ctx.run(driver.exec(&sandbox, cfg, command, args)).await??;
        self.touch(id);
        debug!(
            "exec finished (sandbox_id={id}, command={command}, status={:?})",
            result.status_code
        );
        Ok(result)
    }

    /// Spawn a command in an active sandbox without waiting; returns its pid.
    pub async fn start_process(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<u32, EnclaveError> {
        let sandbox = self.active(ctx, id, "start_process")?;
        let driver = self.driver_for(&sandbox)?;
        let pid = ctx
            .run(driver.start_process(&sandbox, cfg, command, args))
            .await??;
        self.touch(id);
        info!("process started (sandbox_id={id}, command={command}, pid={pid})");
        Ok(pid)
    }

    /// Recompute `size_bytes` from the current change set.
    pub async fn refresh_size(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
    ) -> Result<Sandbox, EnclaveError> {
        let sandbox = self.get(ctx, id)?;
        require(
            &sandbox,
            &[
                SandboxStatus::Active,
                SandboxStatus::Stopping,
                SandboxStatus::Stopped,
            ],
            "refresh_size",
        )?;
        let driver = self.driver_for(&sandbox)?;
        let changes = ctx.run(driver.changed_files(&sandbox)).await??;
        let size = super::total_size(&changes);
        self.mutate(ctx, id, |record| {
            require(
                record,
                &[
                    SandboxStatus::Active,
                    SandboxStatus::Stopping,
                    SandboxStatus::Stopped,
                ],
                "refresh_size",
            )?;
            record.size_bytes = size;
            Ok(None)
        })
    }

    /// Settle records left mid-flight by a previous process.
    ///
    /// `creating` records get their mount retried, `stopping` records are
    /// unmounted and moved to `stopped`, and `active` or `stopped` records
    /// have their mount state checked and their size recomputed. Finally,
    /// driver storage left behind by records that no longer exist is deleted.
    pub async fn recover(&self, ctx: &RequestContext) -> Result<RecoveryReport, EnclaveError> {
        let actor = Actor::system();
        let mut report = RecoveryReport::default();
        for sandbox in self.unsettled()? {
            let id = sandbox.id;
            let _guard = ctx.run(self.locks.acquire(id)).await?;
            let status = sandbox.status;
            let outcome = match status {
                SandboxStatus::Creating => self
                    .retry_mount(ctx, &sandbox, &actor)
                    .await
                    .map(|_| report.mounted.push(id)),
                SandboxStatus::Stopping => self
                    .finish_stop(ctx, sandbox, &actor)
                    .await
                    .map(|_| report.stopped.push(id)),
                SandboxStatus::Active => {
                    match self.ensure_mounted(ctx, &sandbox, &actor).await {
                        Ok(remounted) => {
                            if remounted {
                                report.remounted.push(id);
                            }
                            self.refresh_size(ctx, id)
                                .await
                                .map(|_| report.resized.push(id))
                        }
                        Err(err) => Err(err),
                    }
                }
                SandboxStatus::Stopped => self
                    .refresh_size(ctx, id)
                    .await
                    .map(|_| report.resized.push(id)),
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                if matches!(err, EnclaveError::Cancelled) {
                    return Err(err);
                }
                warn!("recovery failed (sandbox_id={id}, error={err})");
                report.failed.push(id);
            }
        }
        self.sweep_orphans(ctx, &mut report).await?;
        info!(
            "recovery finished (mounted={}, remounted={}, stopped={}, resized={}, orphans={}, failed={})",
            report.mounted.len(),
            report.remounted.len(),
            report.stopped.len(),
            report.resized.len(),
            report.orphans_removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete storage whose record is gone, e.g. after a crash between a
    /// collection's row delete and its storage cleanup.
    async fn sweep_orphans(
        &self,
        ctx: &RequestContext,
        report: &mut RecoveryReport,
    ) -> Result<(), EnclaveError> {
        for driver in self.drivers.drivers() {
            let stored = match ctx.run(driver.stored_sandboxes()).await? {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(
                        "could not list driver storage (driver={}, error={err})",
                        driver.name()
                    );
                    continue;
                }
            };
            for id in stored {
                let _guard = ctx.run(self.locks.acquire(id)).await?;
                if self.repo.get(id)?.is_some() {
                    continue;
                }
                match ctx.run(driver.remove_orphan(id)).await? {
                    Ok(()) => {
                        info!(
                            "orphaned storage removed (sandbox_id={id}, driver={})",
                            driver.name()
                        );
                        report.orphans_removed.push(id);
                    }
                    Err(err) => {
                        warn!(
                            "orphaned storage removal failed (sandbox_id={id}, driver={}, error={err})",
                            driver.name()
                        );
                        report.failed.push(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn active(
        &self,
        ctx: &RequestContext,
        id: SandboxId,
        operation: &'static str,
    ) -> Result<Sandbox, EnclaveError> {
        let sandbox = self.get(ctx, id)?;
        require(&sandbox, &[SandboxStatus::Active], operation)?;
        Ok(sandbox)
    }

    /// Bump `last_used_at`. Failure only costs idle-timeout accuracy.
    fn touch(&self, id: SandboxId) {
        let settled = RequestContext::new();
        let result = self.mutate(&settled, id, |record| {
            require(record, &[SandboxStatus::Active], "touch")?;
            record.last_used_at = Utc::now();
            Ok(None)
        });
        if let Err(err) = result {
            warn!("could not update last_used_at (sandbox_id={id}, error={err})");
        }
    }

    fn unsettled(&self) -> Result<Vec<Sandbox>, EnclaveError> {
        let mut request = ListRequest {
            status: Some(vec![
                SandboxStatus::Creating,
                SandboxStatus::Active,
                SandboxStatus::Stopping,
                SandboxStatus::Stopped,
            ]),
            page_size: Some(MAX_PAGE_SIZE),
            ..ListRequest::default()
        };
        let mut records = Vec::new();
        loop {
            let page = self.repo.list(&request)?;
            records.extend(page.items);
            match page.next_page_token {
                Some(token) => request.page_token = Some(token),
                None => return Ok(records),
            }
        }
    }

    /// Mount a record stuck in `creating` and move it to `active`.
    async fn retry_mount(
        &self,
        ctx: &RequestContext,
        sandbox: &Sandbox,
        actor: &Actor,
    ) -> Result<Sandbox, EnclaveError> {
        let driver = self.driver_for(sandbox)?;
        match self
            .drive(ctx, sandbox, "mount", actor, || driver.mount(sandbox))
            .await
        {
            Ok(paths) => self.mutate(&RequestContext::new(), sandbox.id, |record| {
                require(record, &[SandboxStatus::Creating], "activate")?;
                record.status = SandboxStatus::Active;
                record.mount_paths = Some(paths.clone());
                record.last_used_at = Utc::now();
                Ok(Some(
                    sandbox_event(EventType::SandboxMounted, record, actor)
                        .detail("merged", paths.merged.display().to_string())
                        .detail("recovered", true),
                ))
            }),
            Err(StepFailure::Unavailable(err)) => {
                Err(EnclaveError::DriverUnavailable(err.to_string()))
            }
            Err(step) => Err(self.fail(sandbox.id, step.into_failure("mount"), actor)),
        }
    }

    /// Mount an `active` record whose view is gone. Returns whether a mount
    /// was needed.
    async fn ensure_mounted(
        &self,
        ctx: &RequestContext,
        sandbox: &Sandbox,
        actor: &Actor,
    ) -> Result<bool, EnclaveError> {
        let driver = self.driver_for(sandbox)?;
        if ctx.run(driver.is_mounted(sandbox)).await?? {
            return Ok(false);
        }
        match self
            .drive(ctx, sandbox, "mount", actor, || driver.mount(sandbox))
            .await
        {
            Ok(_) => {
                info!("active sandbox remounted (sandbox_id={})", sandbox.id);
                Ok(true)
            }
            Err(StepFailure::Unavailable(err)) => {
                Err(EnclaveError::DriverUnavailable(err.to_string()))
            }
            Err(step) => Err(self.fail(sandbox.id, step.into_failure("mount"), actor)),
        }
    }
}
