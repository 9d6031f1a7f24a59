use super::{SandboxService, StepFailure, require};
use crate::audit::{Actor, announce, sandbox_event};
use crate::context::RequestContext;
use crate::error::EnclaveError;
use chrono::Utc;
use enclave_rs_protocol::scope::{ROOT_SCOPE, normalize_scope};
use enclave_rs_protocol::{CreateSandboxRequest, EventType, Sandbox, SandboxStatus};
use enclave_rs_store::StoreError;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

impl SandboxService {
    /// Create a sandbox over `scope_path` and mount it.
    ///
    /// A request carrying a known idempotency key returns the existing record
    /// untouched. When the driver is unavailable the record stays in
    /// `creating`; any other driver failure moves it to `error`.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreateSandboxRequest,
    ) -> Result<Sandbox, EnclaveError> {
        ctx.check()?;
        if request.owner.trim().is_empty() {
            return Err(EnclaveError::InvalidArgs("owner must not be empty".to_string()));
        }
        let (project_root, scope_path) = resolve_scope(&request.project_root, &request.scope_path)?;

        if let Some(key) = request.idempotency_key.as_deref()
            && let Some(existing) = self.repo.find_by_idempotency_key(key)?
        {
            info!(
                "idempotent create hit (sandbox_id={}, key={key})",
                existing.id
            );
            return Ok(existing);
        }

        let driver = self.drivers.resolve(request.driver_hint.as_deref())?;
        let mut sandbox = Sandbox::new(
            scope_path,
            project_root,
            request.owner.clone(),
            driver.name(),
        );
        sandbox.idempotency_key = request.idempotency_key.clone();
        let actor = Actor::user(request.owner);

        ctx.check()?;
        if let Some(existing) = self.insert(&sandbox, &actor)? {
            return Ok(existing);
        }
        info!(
            "sandbox created (sandbox_id={}, scope={}, root={}, driver={})",
            sandbox.id,
            sandbox.scope_path,
            sandbox.project_root.display(),
            sandbox.driver
        );

        match self
            .drive(ctx, &sandbox, "mount", &actor, || driver.mount(&sandbox))
            .await
        {
            Ok(paths) => {
                let settled = RequestContext::new();
                self.mutate(&settled, sandbox.id, |record| {
                    require(record, &[SandboxStatus::Creating], "activate")?;
                    record.status = SandboxStatus::Active;
                    record.mount_paths = Some(paths.clone());
                    record.last_used_at = Utc::now();
                    Ok(Some(
                        sandbox_event(EventType::SandboxMounted, record, &actor)
                            .detail("merged", paths.merged.display().to_string()),
                    ))
                })
            }
            Err(StepFailure::Unavailable(err)) => {
                warn!(
                    "driver unavailable, sandbox left creating (sandbox_id={}, error={err})",
                    sandbox.id
                );
                Err(EnclaveError::DriverUnavailable(err.to_string()))
            }
            Err(step) => Err(self.fail(sandbox.id, step.into_failure("mount"), &actor)),
        }
    }

    /// Insert the `creating` record after the overlap check, in one
    /// transaction. Returns the winner of a concurrent idempotent create.
    fn insert(&self, sandbox: &Sandbox, actor: &Actor) -> Result<Option<Sandbox>, EnclaveError> {
        let tx = self.repo.begin_tx()?;
        let conflicts =
            tx.check_scope_overlap(&sandbox.scope_path, &sandbox.project_root, None)?;
        if !conflicts.is_empty() {
            debug!(
                "scope conflict (scope={}, conflicts={})",
                sandbox.scope_path,
                conflicts.len()
            );
            return Err(EnclaveError::ScopeConflict {
                scope_path: sandbox.scope_path.clone(),
                conflicts,
            });
        }
        match tx.create(sandbox) {
            Ok(()) => {}
            Err(StoreError::ConflictIdempotency(existing)) => return Ok(Some(*existing)),
            Err(err) => return Err(err.into()),
        }
        let event = sandbox_event(EventType::SandboxCreated, sandbox, actor)
            .detail("scope_path", sandbox.scope_path.clone())
            .detail("project_root", sandbox.project_root.display().to_string())
            .detail("driver", sandbox.driver.clone());
        let stored = tx.log_audit_event(&event)?;
        tx.commit()?;
        announce(&stored);
        Ok(None)
    }
}

/// Canonical project root and normalized scope for a create request.
///
/// Absolute scopes must lie under the project root. Existing path
/// components are resolved, so a symlink cannot carry the scope outside and
/// aliases of one directory yield the same scope.
pub(crate) fn resolve_scope(
    project_root: &Path,
    raw_scope: &str,
) -> Result<(PathBuf, String), EnclaveError> {
    if !project_root.is_absolute() {
        return Err(EnclaveError::InvalidArgs(format!(
            "project_root must be absolute: {}",
            project_root.display()
        )));
    }
    let root = fs::canonicalize(project_root).map_err(|err| {
        EnclaveError::InvalidArgs(format!(
            "project_root {} is not accessible: {err}",
            project_root.display()
        ))
    })?;
    if !root.is_dir() {
        return Err(EnclaveError::InvalidArgs(format!(
            "project_root is not a directory: {}",
            root.display()
        )));
    }

    let raw_path = Path::new(raw_scope);
    let relative = if raw_path.is_absolute() {
        raw_path
            .strip_prefix(project_root)
            .or_else(|_| raw_path.strip_prefix(&root))
            .map_err(|_| {
                EnclaveError::InvalidArgs(format!(
                    "scope {raw_scope} lies outside project_root {}",
                    project_root.display()
                ))
            })?
            .to_string_lossy()
            .to_string()
    } else {
        raw_scope.to_string()
    };
    let scope = normalize_scope(&relative)?;
    if scope == ROOT_SCOPE {
        return Ok((root, scope));
    }
    let scope = canonical_scope(&root, &scope)?;
    Ok((root, scope))
}

/// Rewrite `scope` through its longest existing prefix. The prefix must
/// resolve inside `root`; the components that do not exist yet are kept.
fn canonical_scope(root: &Path, scope: &str) -> Result<String, EnclaveError> {
    let segments: Vec<&str> = scope.split('/').collect();
    let mut current = root.to_path_buf();
    let mut existing = 0;
    for segment in &segments {
        current.push(segment);
        if fs::symlink_metadata(&current).is_err() {
            break;
        }
        existing += 1;
    }
    if existing == 0 {
        return Ok(scope.to_string());
    }

    let prefix = root.join(segments[..existing].join("/"));
    let resolved = fs::canonicalize(&prefix).map_err(|err| {
        EnclaveError::InvalidArgs(format!("scope {scope} cannot be resolved: {err}"))
    })?;
    let inside = resolved.strip_prefix(root).map_err(|_| {
        EnclaveError::InvalidArgs(format!(
            "scope {scope} escapes project_root through a symlink"
        ))
    })?;
    let mut parts: Vec<String> = inside
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.extend(segments[existing..].iter().map(|segment| segment.to_string()));
    if parts.is_empty() {
        return Ok(ROOT_SCOPE.to_string());
    }
    let canonical = normalize_scope(&parts.join("/"))?;
    if canonical != scope {
        debug!("scope resolved through symlink (scope={scope}, canonical={canonical})");
    }
    Ok(canonical)
}
