use async_trait::async_trait;
use enclave_rs_driver::{Driver, DriverError, ExecConfig, ExecResult};
use enclave_rs_protocol::{FileChange, MountPaths, Sandbox, SandboxId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Driver operations a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Mount,
    Unmount,
    Cleanup,
    ChangedFiles,
    IsMounted,
    VerifyMountIntegrity,
    Exec,
    StartProcess,
    RemoveFromUpper,
    StoredSandboxes,
    RemoveOrphan,
}

/// Failure injected in place of the wrapped driver's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Fatal,
    Transient,
    Unavailable,
    /// Never completes; used to exercise cancellation.
    Hang,
    /// Waits, then lets the wrapped driver run; widens race windows.
    Delay(Duration),
}

impl Fault {
    fn error(self, op: DriverOp) -> DriverError {
        let message = format!("injected {op:?} failure");
        match self {
            Fault::Fatal => DriverError::Fatal(message),
            Fault::Transient => DriverError::Transient(message),
            Fault::Unavailable => DriverError::Unavailable(message),
            Fault::Hang | Fault::Delay(_) => DriverError::Fatal(message),
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    queued: VecDeque<Fault>,
    sticky: Option<Fault>,
}

/// Wraps a real driver and fails selected operations on demand.
pub struct FaultyDriver {
    inner: Arc<dyn Driver>,
    plans: Mutex<HashMap<DriverOp, FaultPlan>>,
    calls: Mutex<HashMap<DriverOp, usize>>,
}

impl FaultyDriver {
    pub fn new(inner: Arc<dyn Driver>) -> Self {
        Self {
            inner,
            plans: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next call of `op` once; queued faults fire in order.
    pub fn fail_next(&self, op: DriverOp, fault: Fault) {
        self.plans.lock().entry(op).or_default().queued.push_back(fault);
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_always(&self, op: DriverOp, fault: Fault) {
        self.plans.lock().entry(op).or_default().sticky = Some(fault);
    }

    pub fn clear(&self, op: DriverOp) {
        self.plans.lock().remove(&op);
    }

    /// Number of times `op` was invoked, including failed calls.
    pub fn calls(&self, op: DriverOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    async fn gate(&self, op: DriverOp) -> Result<(), DriverError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let fault = {
            let mut plans = self.plans.lock();
            plans
                .get_mut(&op)
                .and_then(|plan| plan.queued.pop_front().or(plan.sticky))
        };
        match fault {
            None => Ok(()),
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Delay(wait)) => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
            Some(fault) => Err(fault.error(op)),
        }
    }
}

#[async_trait]
impl Driver for FaultyDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn mount(&self, sandbox: &Sandbox) -> Result<MountPaths, DriverError> {
        self.gate(DriverOp::Mount).await?;
        self.inner.mount(sandbox).await
    }

    async fn unmount(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        self.gate(DriverOp::Unmount).await?;
        self.inner.unmount(sandbox).await
    }

    async fn cleanup(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        self.gate(DriverOp::Cleanup).await?;
        self.inner.cleanup(sandbox).await
    }

    async fn changed_files(&self, sandbox: &Sandbox) -> Result<Vec<FileChange>, DriverError> {
        self.gate(DriverOp::ChangedFiles).await?;
        self.inner.changed_files(sandbox).await
    }

    async fn is_mounted(&self, sandbox: &Sandbox) -> Result<bool, DriverError> {
        self.gate(DriverOp::IsMounted).await?;
        self.inner.is_mounted(sandbox).await
    }

    async fn verify_mount_integrity(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        self.gate(DriverOp::VerifyMountIntegrity).await?;
        self.inner.verify_mount_integrity(sandbox).await
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, DriverError> {
        self.gate(DriverOp::Exec).await?;
        self.inner.exec(sandbox, cfg, command, args).await
    }

    async fn start_process(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<u32, DriverError> {
        self.gate(DriverOp::StartProcess).await?;
        self.inner.start_process(sandbox, cfg, command, args).await
    }

    async fn remove_from_upper(&self, sandbox: &Sandbox, path: &str) -> Result<(), DriverError> {
        self.gate(DriverOp::RemoveFromUpper).await?;
        self.inner.remove_from_upper(sandbox, path).await
    }

    async fn stored_sandboxes(&self) -> Result<Vec<SandboxId>, DriverError> {
        self.gate(DriverOp::StoredSandboxes).await?;
        self.inner.stored_sandboxes().await
    }

    async fn remove_orphan(&self, id: SandboxId) -> Result<(), DriverError> {
        self.gate(DriverOp::RemoveOrphan).await?;
        self.inner.remove_orphan(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::{DriverOp, Fault, FaultyDriver};
    use enclave_rs_driver::{CopyDriver, Driver, FailureClass};
    use enclave_rs_protocol::Sandbox;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn queued_faults_fire_once_then_delegate() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("src")).expect("project");
        let inner = Arc::new(CopyDriver::new(temp.path().join("state")));
        let driver = FaultyDriver::new(inner);
        driver.fail_next(DriverOp::Mount, Fault::Transient);

        let sandbox = Sandbox::new("src", &project, "alice", driver.name());
        let err = driver.mount(&sandbox).await.expect_err("injected");
        assert_eq!(err.class(), FailureClass::Transient);
        driver.mount(&sandbox).await.expect("second mount delegates");
        assert_eq!(driver.calls(DriverOp::Mount), 2);
    }

    #[tokio::test]
    async fn sticky_faults_persist_until_cleared() {
        let temp = tempdir().expect("tempdir");
        let inner = Arc::new(CopyDriver::new(temp.path().join("state")));
        let driver = FaultyDriver::new(inner);
        driver.fail_always(DriverOp::Cleanup, Fault::Fatal);
        let sandbox = Sandbox::new("src", temp.path(), "alice", driver.name());
        assert!(driver.cleanup(&sandbox).await.is_err());
        assert!(driver.cleanup(&sandbox).await.is_err());
        driver.clear(DriverOp::Cleanup);
        driver.cleanup(&sandbox).await.expect("cleanup");
    }
}
