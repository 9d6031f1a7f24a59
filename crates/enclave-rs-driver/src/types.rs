//! Confinement and command execution types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How strongly a process is confined to the merged view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confinement {
    /// Bubblewrap namespaces: the host project is read-only and the scope is
    /// replaced by the merged view.
    #[default]
    Namespace,
    /// Plain host process rooted at the merged view with a scrubbed
    /// environment and rlimits.
    Process,
}

/// Network access for confined processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Allow network access.
    #[default]
    Allow,
    /// Unshare the network namespace.
    Deny,
}

/// Resource limits applied via setrlimit before exec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecLimits {
    /// CPU seconds limit.
    pub cpu_seconds: Option<u64>,
    /// Address space limit in bytes.
    pub memory_bytes: Option<u64>,
    /// File descriptor limit.
    pub nofile: Option<u64>,
    /// Process count limit.
    pub pids: Option<u64>,
}

/// Confinement configuration for `exec` and `start_process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub confinement: Confinement,
    #[serde(default)]
    pub network: NetworkMode,
    /// Host variables copied into the child when set.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
    /// Variables set explicitly, overriding inherited ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ExecLimits,
    /// Working directory relative to the scope root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Kill the child after this long (exec only).
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            confinement: Confinement::default(),
            network: NetworkMode::default(),
            inherit_env: default_inherit_env(),
            env: BTreeMap::new(),
            limits: ExecLimits::default(),
            cwd: None,
            timeout: None,
        }
    }
}

impl ExecConfig {
    /// Host-process confinement; used where bubblewrap is not installed.
    pub fn process() -> Self {
        Self {
            confinement: Confinement::Process,
            ..Self::default()
        }
    }
}

fn default_inherit_env() -> Vec<String> {
    ["PATH", "LANG", "TERM"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit status code if the process exited normally.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::{Confinement, ExecConfig, NetworkMode};
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_confine_with_namespaces() {
        let cfg = ExecConfig::default();
        assert_eq!(cfg.confinement, Confinement::Namespace);
        assert_eq!(cfg.network, NetworkMode::Allow);
        assert!(cfg.inherit_env.contains(&"PATH".to_string()));
        assert_eq!(ExecConfig::process().confinement, Confinement::Process);
    }
}
