//! Garbage collection of finished sandboxes.
//!
//! Time-based criteria come from the repository's candidate query. The
//! aggregate size cap is applied here, oldest record first, on top of those
//! candidates.

mod ticker;

pub use ticker::{GC_LOOP_ACTOR, GcLoop};

use crate::audit::{Actor, announce, sandbox_event};
use crate::context::RequestContext;
use crate::error::EnclaveError;
use crate::lifecycle::SandboxLocks;
use chrono::Utc;
use enclave_rs_config::GcConfig;
use enclave_rs_driver::{Driver, DriverRegistry};
use enclave_rs_protocol::{
    EventType, GcItemError, GcPolicy, GcReason, GcRequest, GcResult, ListRequest, Sandbox,
    SandboxId, SandboxStatus,
};
use enclave_rs_store::{MAX_PAGE_SIZE, Repository};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Statuses that may hold reclaimable storage.
const COLLECTABLE: [SandboxStatus; 4] = [
    SandboxStatus::Stopped,
    SandboxStatus::Approved,
    SandboxStatus::Rejected,
    SandboxStatus::Error,
];

/// Outcome of reclaiming one record.
#[derive(Debug)]
pub(crate) enum Reclaimed {
    /// Row deleted. `soft_error` carries a storage cleanup failure.
    Collected { soft_error: Option<String> },
    /// The record changed since it was selected and was left alone.
    Skipped,
}

/// On-demand and periodic garbage collection.
pub struct GcService {
    repo: Arc<dyn Repository>,
    drivers: Arc<DriverRegistry>,
    config: GcConfig,
    locks: SandboxLocks,
}

impl GcService {
    pub fn new(repo: Arc<dyn Repository>, drivers: Arc<DriverRegistry>, config: GcConfig) -> Self {
        Self {
            repo,
            drivers,
            config,
            locks: SandboxLocks::new(),
        }
    }

    /// Share the lifecycle service's per-sandbox locks.
    pub fn with_locks(mut self, locks: SandboxLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Select candidates under the request's policy (or the configured
    /// default) and collect them unless `dry_run` is set.
    ///
    /// Per-record failures are reported in `errors`. Cancellation stops the
    /// run between records and returns what was collected so far.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        request: GcRequest,
    ) -> Result<GcResult, EnclaveError> {
        ctx.check()?;
        let policy = request
            .policy
            .unwrap_or_else(|| self.config.default_policy());
        let limit = request.limit.unwrap_or(self.config.default_gc_limit);
        let actor = Actor::gc(request.actor);
        let plan = self.plan(&policy, limit)?;
        debug!(
            "gc plan ready (candidates={}, limit={limit}, dry_run={})",
            plan.len(),
            request.dry_run
        );

        let mut result = GcResult {
            dry_run: request.dry_run,
            ..GcResult::default()
        };
        for (sandbox, reasons) in plan {
            if request.dry_run {
                result.total_bytes_reclaimed += sandbox.size_bytes;
                result.collected.push(sandbox.id);
                result.reasons.insert(sandbox.id, reasons);
                continue;
            }
            if ctx.is_cancelled() {
                info!(
                    "gc run cancelled (collected={})",
                    result.collected.len()
                );
                break;
            }
            let id = sandbox.id;
            let Ok(_guard) = ctx.run(self.locks.acquire(id)).await else {
                info!(
                    "gc run cancelled (collected={})",
                    result.collected.len()
                );
                break;
            };
            let outcome = match self.drivers.get(&sandbox.driver) {
                Ok(driver) => {
                    reclaim(self.repo.as_ref(), driver.as_ref(), &sandbox, &reasons, &actor).await
                }
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(Reclaimed::Collected { soft_error }) => {
                    result.total_bytes_reclaimed += sandbox.size_bytes;
                    result.collected.push(id);
                    result.reasons.insert(id, reasons);
                    if let Some(message) = soft_error {
                        result.errors.push(GcItemError {
                            sandbox_id: id,
                            message,
                        });
                    }
                }
                Ok(Reclaimed::Skipped) => {
                    debug!("gc candidate changed, skipped (sandbox_id={id})");
                }
                Err(err) => {
                    warn!("gc could not collect sandbox (sandbox_id={id}, error={err})");
                    result.errors.push(GcItemError {
                        sandbox_id: id,
                        message: err.to_string(),
                    });
                }
            }
        }
        info!(
            "gc run finished (collected={}, bytes={}, errors={}, dry_run={})",
            result.collected.len(),
            result.total_bytes_reclaimed,
            result.errors.len(),
            result.dry_run
        );
        Ok(result)
    }

    /// Candidates in collection order with every criterion each one matched.
    fn plan(
        &self,
        policy: &GcPolicy,
        limit: usize,
    ) -> Result<Vec<(Sandbox, Vec<GcReason>)>, EnclaveError> {
        let now = Utc::now();
        let mut plan: Vec<(Sandbox, Vec<GcReason>)> = self
            .repo
            .gc_candidates(policy, now, limit)?
            .into_iter()
            .map(|sandbox| {
                let reasons = policy.reasons(&sandbox, now);
                (sandbox, reasons)
            })
            .collect();

        let Some(cap) = policy.max_total_size_bytes else {
            return Ok(plan);
        };
        let total = self.repo.stats()?.total_size_bytes;
        if total <= cap {
            return Ok(plan);
        }
        let target = (total - cap).min(cap);
        let mut reclaimed: u64 = 0;
        for (sandbox, reasons) in plan.iter_mut() {
            // Time-picked records also answer the cap while the target is unmet.
            if reclaimed < target && sandbox.size_bytes > 0 && !reasons.contains(&GcReason::SizeCap)
            {
                reasons.push(GcReason::SizeCap);
            }
            reclaimed += sandbox.size_bytes;
        }
        let mut picked: HashSet<SandboxId> = plan.iter().map(|(sandbox, _)| sandbox.id).collect();
        for sandbox in self.collectable_oldest_first(policy)? {
            if reclaimed >= target {
                break;
            }
            if picked.contains(&sandbox.id) {
                continue;
            }
            if plan.len() >= limit {
                break;
            }
            reclaimed += sandbox.size_bytes;
            picked.insert(sandbox.id);
            plan.push((sandbox, vec![GcReason::SizeCap]));
        }
        debug!("size cap applied (total={total}, cap={cap}, target={target}, reclaimed={reclaimed})");
        Ok(plan)
    }

    fn collectable_oldest_first(&self, policy: &GcPolicy) -> Result<Vec<Sandbox>, EnclaveError> {
        let mut request = ListRequest {
            status: Some(COLLECTABLE.to_vec()),
            page_size: Some(MAX_PAGE_SIZE),
            ..ListRequest::default()
        };
        let mut records = Vec::new();
        loop {
            let page = self.repo.list(&request)?;
            records.extend(
                page.items
                    .into_iter()
                    .filter(|sandbox| policy.status_eligible(sandbox.status)),
            );
            match page.next_page_token {
                Some(token) => request.page_token = Some(token),
                None => break,
            }
        }
        Ok(records)
    }
}

/// Delete `sandbox`'s row and audit the collection in one transaction, then
/// release its storage.
///
/// The row is only removed while its version still matches the selected
/// copy. Storage cleanup runs after the commit and is not cancellable; its
/// failure is audited and returned as a soft error.
pub(crate) async fn reclaim(
    repo: &dyn Repository,
    driver: &dyn Driver,
    sandbox: &Sandbox,
    reasons: &[GcReason],
    actor: &Actor,
) -> Result<Reclaimed, EnclaveError> {
    let id = sandbox.id;
    {
        let tx = repo.begin_tx()?;
        let unchanged = tx
            .get(id)?
            .is_some_and(|current| current.version == sandbox.version);
        if !unchanged {
            tx.rollback()?;
            return Ok(Reclaimed::Skipped);
        }
        tx.delete(id)?;
        let reasons_value = serde_json::to_value(reasons)
            .map_err(|err| EnclaveError::Internal(err.to_string()))?;
        let event = sandbox_event(EventType::SandboxGcCollected, sandbox, actor)
            .detail("reasons", reasons_value)
            .detail("bytes_reclaimed", sandbox.size_bytes)
            .detail("status", sandbox.status.as_str());
        let stored = tx.log_audit_event(&event)?;
        tx.commit()?;
        announce(&stored);
    }

    let soft_error = match driver.cleanup(sandbox).await {
        Ok(()) => None,
        Err(err) => {
            warn!("storage cleanup failed (sandbox_id={id}, error={err})");
            let event = sandbox_event(EventType::DriverError, sandbox, actor)
                .detail("operation", "cleanup")
                .detail("error", err.to_string());
            match repo.log_audit_event(&event) {
                Ok(stored) => announce(&stored),
                Err(store_err) => {
                    warn!("could not audit cleanup failure (sandbox_id={id}, error={store_err})")
                }
            }
            Some(err.to_string())
        }
    };
    Ok(Reclaimed::Collected { soft_error })
}
