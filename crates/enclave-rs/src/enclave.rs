//! Service assembly from configuration.

use enclave_rs_config::EnclaveConfig;
use enclave_rs_core::{EnclaveError, GcLoop, GcService, SandboxService};
use enclave_rs_driver::DriverRegistry;
use enclave_rs_store::{Repository, SqliteRepository};
use log::info;
use std::sync::Arc;

/// A configured sandbox service plus its garbage collector, sharing one
/// repository and one driver registry.
pub struct Enclave {
    config: EnclaveConfig,
    service: Arc<SandboxService>,
    gc: Arc<GcService>,
}

impl Enclave {
    /// Open the configured store and drivers.
    pub fn open(config: EnclaveConfig) -> Result<Self, EnclaveError> {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open(
            config.store.database_path(),
        )?);
        let drivers = Arc::new(DriverRegistry::from_config(&config.driver)?);
        Ok(Self::with_parts(config, repo, drivers))
    }

    /// Assemble from an existing repository and registry.
    pub fn with_parts(
        config: EnclaveConfig,
        repo: Arc<dyn Repository>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        let service = Arc::new(SandboxService::new(repo.clone(), drivers.clone(), &config));
        let gc = Arc::new(
            GcService::new(repo, drivers.clone(), config.gc.clone())
                .with_locks(service.locks().clone()),
        );
        info!(
            "enclave ready (default_driver={}, gc_enabled={})",
            drivers.default_name(),
            config.gc.enabled
        );
        Self {
            config,
            service,
            gc,
        }
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<SandboxService> {
        &self.service
    }

    pub fn gc(&self) -> &Arc<GcService> {
        &self.gc
    }

    /// Periodic collector for this instance, or `None` when disabled.
    pub fn gc_loop(&self) -> Option<GcLoop> {
        self.config
            .gc
            .enabled
            .then(|| GcLoop::new(self.gc.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::Enclave;
    use enclave_rs_config::{DriverConfig, EnclaveConfig, GcConfig, MEMORY_STORE, StoreConfig};
    use enclave_rs_core::RequestContext;
    use enclave_rs_protocol::{CreateSandboxRequest, RejectRequest, SandboxStatus};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn config(state_dir: &std::path::Path) -> EnclaveConfig {
        EnclaveConfig::builder()
            .driver(DriverConfig {
                default: Some("copy".to_string()),
                hint_allowlist: Vec::new(),
                state_dir: Some(state_dir.display().to_string()),
            })
            .store(StoreConfig {
                path: Some(MEMORY_STORE.to_string()),
            })
            .build()
    }

    #[tokio::test]
    async fn opens_from_config_and_runs_a_lifecycle() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("src")).expect("project");
        let enclave = Enclave::open(config(&temp.path().join("state"))).expect("open");
        let ctx = RequestContext::new();

        let sandbox = enclave
            .service()
            .create(&ctx, CreateSandboxRequest::new("src", &project, "alice"))
            .await
            .expect("create");
        assert_eq!(sandbox.driver, "copy");
        let rejected = enclave
            .service()
            .reject(&ctx, RejectRequest::new(sandbox.id, "alice"))
            .await
            .expect("reject");
        assert_eq!(rejected.status, SandboxStatus::Rejected);
    }

    #[test]
    fn gc_loop_follows_config() {
        let temp = tempdir().expect("tempdir");
        let mut config = config(temp.path());
        assert!(Enclave::open(config.clone()).expect("open").gc_loop().is_some());
        config.gc = GcConfig {
            enabled: false,
            ..GcConfig::default()
        };
        assert!(Enclave::open(config).expect("open").gc_loop().is_none());
    }
}
