//! Configuration schema for Enclave.

use directories::ProjectDirs;
use enclave_rs_protocol::GcPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// In-memory SQLite database name.
pub const MEMORY_STORE: &str = ":memory:";

/// Root config for the Enclave service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnclaveConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl EnclaveConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> EnclaveConfigBuilder {
        EnclaveConfigBuilder::new()
    }
}

/// Builder for assembling an `EnclaveConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct EnclaveConfigBuilder {
    config: EnclaveConfig,
}

impl EnclaveConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: EnclaveConfig::default(),
        }
    }

    /// Replace the lifecycle retry configuration.
    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.config.lifecycle = lifecycle;
        self
    }

    /// Replace the garbage-collection configuration.
    pub fn gc(mut self, gc: GcConfig) -> Self {
        self.config.gc = gc;
        self
    }

    /// Replace the driver configuration.
    pub fn driver(mut self, driver: DriverConfig) -> Self {
        self.config.driver = driver;
        self
    }

    /// Replace the store configuration.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Replace the approval configuration.
    pub fn approval(mut self, approval: ApprovalConfig) -> Self {
        self.config.approval = approval;
        self
    }

    /// Finalize and return the built `EnclaveConfig`.
    pub fn build(self) -> EnclaveConfig {
        self.config
    }
}

/// Retry bounds for lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    #[serde(default = "default_retry_attempts_on_stale_version")]
    pub retry_attempts_on_stale_version: u32,
    #[serde(default = "default_retry_attempts_on_transient_driver_error")]
    pub retry_attempts_on_transient_driver_error: u32,
    /// Base backoff between transient driver retries; grows linearly.
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retry_attempts_on_stale_version: default_retry_attempts_on_stale_version(),
            retry_attempts_on_transient_driver_error:
                default_retry_attempts_on_transient_driver_error(),
            transient_backoff_ms: default_transient_backoff_ms(),
        }
    }
}

fn default_retry_attempts_on_stale_version() -> u32 {
    3
}

fn default_retry_attempts_on_transient_driver_error() -> u32 {
    2
}

fn default_transient_backoff_ms() -> u64 {
    100
}

/// Garbage-collection defaults and ticker settings. Durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcConfig {
    /// Run the periodic GC ticker.
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
    /// Ticker period.
    #[serde(default = "default_gc_interval", with = "crate::duration")]
    pub interval: u64,
    #[serde(default = "default_max_age", with = "crate::duration")]
    pub default_max_age: u64,
    #[serde(default = "default_idle_timeout", with = "crate::duration")]
    pub default_idle_timeout: u64,
    #[serde(default = "default_terminal_delay", with = "crate::duration")]
    pub default_terminal_delay: u64,
    #[serde(default = "default_gc_limit")]
    pub default_gc_limit: usize,
    #[serde(default = "default_max_total_size_bytes")]
    pub max_total_size_bytes: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval: default_gc_interval(),
            default_max_age: default_max_age(),
            default_idle_timeout: default_idle_timeout(),
            default_terminal_delay: default_terminal_delay(),
            default_gc_limit: default_gc_limit(),
            max_total_size_bytes: default_max_total_size_bytes(),
        }
    }
}

impl GcConfig {
    /// Policy applied when a GC request does not carry its own.
    pub fn default_policy(&self) -> GcPolicy {
        GcPolicy {
            max_age: Some(self.default_max_age),
            idle_timeout: Some(self.default_idle_timeout),
            include_terminal: true,
            terminal_delay: Some(self.default_terminal_delay),
            max_total_size_bytes: Some(self.max_total_size_bytes),
            statuses: None,
        }
    }
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval() -> u64 {
    15 * 60
}

fn default_max_age() -> u64 {
    24 * 60 * 60
}

fn default_idle_timeout() -> u64 {
    4 * 60 * 60
}

fn default_terminal_delay() -> u64 {
    60 * 60
}

fn default_gc_limit() -> usize {
    100
}

fn default_max_total_size_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}

/// Driver selection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Driver used when a create request carries no hint.
    #[serde(default)]
    pub default: Option<String>,
    /// Driver names a caller may request through `driver_hint`.
    #[serde(default)]
    pub hint_allowlist: Vec<String>,
    /// Root directory for per-sandbox backing storage.
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl DriverConfig {
    /// Configured state directory, else `sandboxes/` under the user data dir.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => PathBuf::from(dir),
            None => data_dir().join("sandboxes"),
        }
    }
}

/// Sandbox record store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite database path; `:memory:` keeps state in memory.
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Configured database path, else `enclave.db` under the user data dir.
    pub fn database_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => data_dir().join("enclave.db"),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_deref() == Some(MEMORY_STORE)
    }
}

fn data_dir() -> PathBuf {
    ProjectDirs::from("dev", "enclave", "enclave")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("enclave"))
}

/// Host-tree behaviour on approval.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ApprovalConfig {
    /// Commit applied changes when the project root is a git work tree.
    #[serde(default)]
    pub git_commit: bool,
}
