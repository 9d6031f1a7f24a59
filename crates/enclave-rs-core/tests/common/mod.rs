#![allow(dead_code)]

mod contended;

pub use contended::ContendedRepository;

use enclave_rs_config::{EnclaveConfig, LifecycleConfig};
use enclave_rs_core::{GcService, RequestContext, SandboxService};
use enclave_rs_driver::{CopyDriver, Driver, DriverRegistry};
use enclave_rs_protocol::{
    AuditEvent, AuditLogRequest, CreateSandboxRequest, EventType, ListRequest, Sandbox, SandboxId,
};
use enclave_rs_store::{Repository, SqliteRepository};
use enclave_rs_test_utils::{FaultyDriver, ProjectTree};
use std::path::PathBuf;
use std::sync::Arc;

/// Service wired to an in-memory store and a fault-injecting copy driver.
pub struct Harness {
    pub tree: ProjectTree,
    pub driver: Arc<FaultyDriver>,
    pub repo: Arc<dyn Repository>,
    pub service: SandboxService,
    pub gc: GcService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tree(ProjectTree::new())
    }

    pub fn with_tree(tree: ProjectTree) -> Self {
        Self::build(tree, fast_config())
    }

    pub fn build(tree: ProjectTree, config: EnclaveConfig) -> Self {
        let repo: Arc<dyn Repository> =
            Arc::new(SqliteRepository::open_in_memory().expect("in-memory store"));
        Self::with_repo(tree, config, repo)
    }

    pub fn with_repo(tree: ProjectTree, config: EnclaveConfig, repo: Arc<dyn Repository>) -> Self {
        let copy: Arc<dyn Driver> = Arc::new(CopyDriver::new(tree.state_dir()));
        let driver = Arc::new(FaultyDriver::new(copy));
        let drivers = Arc::new(DriverRegistry::new(driver.clone()));
        let service = SandboxService::new(repo.clone(), drivers.clone(), &config);
        let gc = GcService::new(repo.clone(), drivers, config.gc.clone())
            .with_locks(service.locks().clone());
        Self {
            tree,
            driver,
            repo,
            service,
            gc,
        }
    }

    pub fn request(&self, scope: &str, owner: &str) -> CreateSandboxRequest {
        CreateSandboxRequest::new(scope, self.tree.root(), owner)
    }

    pub async fn create(&self, scope: &str, owner: &str) -> Sandbox {
        self.service
            .create(&RequestContext::new(), self.request(scope, owner))
            .await
            .expect("create sandbox")
    }

    pub fn get(&self, id: SandboxId) -> Sandbox {
        self.service
            .get(&RequestContext::new(), id)
            .expect("sandbox exists")
    }

    pub fn all(&self) -> Vec<Sandbox> {
        self.service
            .list(&RequestContext::new(), &ListRequest::default())
            .expect("list")
            .items
    }

    pub fn events(&self, id: SandboxId) -> Vec<AuditEvent> {
        self.service
            .audit_log(
                &RequestContext::new(),
                &AuditLogRequest {
                    sandbox_id: Some(id),
                    limit: 1000,
                    offset: 0,
                },
            )
            .expect("audit log")
            .items
    }

    pub fn event_types(&self, id: SandboxId) -> Vec<EventType> {
        self.events(id)
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

/// Writable view of a mounted sandbox.
pub fn merged(sandbox: &Sandbox) -> PathBuf {
    sandbox
        .mount_paths
        .as_ref()
        .expect("mounted sandbox")
        .merged
        .clone()
}

pub fn fast_config() -> EnclaveConfig {
    EnclaveConfig::builder()
        .lifecycle(LifecycleConfig {
            transient_backoff_ms: 1,
            ..LifecycleConfig::default()
        })
        .build()
}
