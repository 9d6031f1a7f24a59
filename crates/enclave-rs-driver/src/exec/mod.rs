//! Running processes against a sandbox's merged view.

#[cfg(target_os = "linux")]
mod bwrap;

use crate::error::DriverError;
use crate::types::{Confinement, ExecConfig, ExecLimits, ExecResult};
use enclave_rs_protocol::scope::{ROOT_SCOPE, normalize_scope};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Host locations a confined process needs to see.
#[derive(Debug, Clone)]
pub struct ExecView {
    /// Host project root, exposed read-only under namespace confinement.
    pub project_root: PathBuf,
    /// Host path of the scope; the merged view is mounted here in the namespace.
    pub scope_root: PathBuf,
    /// Merged view on the host.
    pub merged: PathBuf,
}

/// Run a command to completion, capturing its output.
pub(crate) async fn run(
    view: &ExecView,
    cfg: &ExecConfig,
    command: &str,
    args: &[String],
) -> Result<ExecResult, DriverError> {
    let mut cmd = build_command(view, cfg, command, args, false)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| DriverError::ExecFailed(format!("spawn {command}: {err}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let wait = async {
        let (stdout, stderr) = capture_output(stdout, stderr).await?;
        let status = child.wait().await?;
        Ok::<_, DriverError>(ExecResult {
            status_code: status.code(),
            stdout,
            stderr,
        })
    };

    let result = match cfg.timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            DriverError::ExecFailed(format!("{command} timed out after {}s", limit.as_secs()))
        })??,
        None => wait.await?,
    };
    if result.status_code != Some(0) {
        debug!(
            "sandbox command exited non-zero (command={}, status={:?})",
            command, result.status_code
        );
    }
    Ok(result)
}

/// Spawn a command and hand ownership of the child to the caller.
pub(crate) fn start(
    view: &ExecView,
    cfg: &ExecConfig,
    command: &str,
    args: &[String],
) -> Result<u32, DriverError> {
    let mut cmd = build_command(view, cfg, command, args, true)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|err| DriverError::ExecFailed(format!("spawn {command}: {err}")))?;
    child
        .id()
        .ok_or_else(|| DriverError::ExecFailed(format!("{command} exited before reporting a pid")))
}

fn build_command(
    view: &ExecView,
    cfg: &ExecConfig,
    command: &str,
    args: &[String],
    detached: bool,
) -> Result<Command, DriverError> {
    let cwd = relative_cwd(cfg)?;
    let env = build_env(cfg);
    let mut cmd = match cfg.confinement {
        Confinement::Process => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            cmd.current_dir(join_cwd(&view.merged, &cwd));
            cmd.env_clear();
            cmd.envs(&env);
            cmd
        }
        #[cfg(target_os = "linux")]
        Confinement::Namespace => {
            let inner_cwd = join_cwd(&view.scope_root, &cwd);
            bwrap::command(view, cfg, &inner_cwd, &env, command, args, detached)?
        }
        #[cfg(not(target_os = "linux"))]
        Confinement::Namespace => {
            let _ = detached;
            return Err(DriverError::Unavailable(
                "namespace confinement requires Linux".to_string(),
            ));
        }
    };

    #[cfg(unix)]
    {
        let limits = cfg.limits.clone();
        // SAFETY: the closure only calls async-signal-safe setrlimit.
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits));
        }
    }
    debug!(
        "sandbox command built (confinement={:?}, args_len={}, env_keys={})",
        cfg.confinement,
        args.len(),
        env.len()
    );
    Ok(cmd)
}

fn relative_cwd(cfg: &ExecConfig) -> Result<String, DriverError> {
    match cfg.cwd.as_deref() {
        None => Ok(ROOT_SCOPE.to_string()),
        Some(raw) => normalize_scope(raw).map_err(|err| DriverError::ExecFailed(err.to_string())),
    }
}

fn join_cwd(base: &Path, cwd: &str) -> PathBuf {
    if cwd == ROOT_SCOPE {
        base.to_path_buf()
    } else {
        base.join(cwd)
    }
}

/// Environment for a confined child: inherited allowlist plus explicit values.
pub(crate) fn build_env(cfg: &ExecConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in &cfg.inherit_env {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.clone(), value);
        }
    }
    for (key, value) in &cfg.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Apply rlimits inside the forked child.
#[cfg(unix)]
pub(crate) fn apply_rlimits(limits: &ExecLimits) -> Result<(), std::io::Error> {
    #[cfg(target_os = "linux")]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(target_os = "linux"))]
    type Resource = libc::c_int;

    fn set(resource: Resource, value: Option<u64>) -> Result<(), std::io::Error> {
        if let Some(value) = value {
            let rlim = libc::rlimit {
                rlim_cur: value as libc::rlim_t,
                rlim_max: value as libc::rlim_t,
            };
            // SAFETY: rlim is a valid, initialized rlimit struct.
            let result = unsafe { libc::setrlimit(resource, &rlim) };
            if result != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    set(libc::RLIMIT_CPU, limits.cpu_seconds)?;
    set(libc::RLIMIT_AS, limits.memory_bytes)?;
    set(libc::RLIMIT_NOFILE, limits.nofile)?;
    set(libc::RLIMIT_NPROC, limits.pids)?;
    Ok(())
}

/// Drain stdout and stderr concurrently so neither pipe fills up.
async fn capture_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> Result<(String, String), DriverError> {
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout = stdout;
    let mut stderr = stderr;
    let mut stdout_chunk = vec![0u8; 8192];
    let mut stderr_chunk = vec![0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = async {
                match stdout.as_mut() {
                    Some(reader) => reader.read(&mut stdout_chunk).await,
                    None => Ok(0),
                }
            }, if stdout.is_some() => {
                match read? {
                    0 => stdout = None,
                    n => stdout_buf.extend_from_slice(&stdout_chunk[..n]),
                }
            }
            read = async {
                match stderr.as_mut() {
                    Some(reader) => reader.read(&mut stderr_chunk).await,
                    None => Ok(0),
                }
            }, if stderr.is_some() => {
                match read? {
                    0 => stderr = None,
                    n => stderr_buf.extend_from_slice(&stderr_chunk[..n]),
                }
            }
        }
    }

    let stdout = String::from_utf8(stdout_buf).unwrap_or_else(|err| {
        warn!("sandbox stdout was not valid utf-8; decoding lossily");
        String::from_utf8_lossy(err.as_bytes()).into_owned()
    });
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
    Ok((stdout, stderr))
}

#[cfg(test)]
mod tests {
    use super::{ExecView, build_env, join_cwd, relative_cwd, run};
    use crate::types::ExecConfig;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn view(root: &Path) -> ExecView {
        ExecView {
            project_root: root.to_path_buf(),
            scope_root: root.to_path_buf(),
            merged: root.to_path_buf(),
        }
    }

    #[test]
    fn env_is_scrubbed_to_allowlist() {
        let mut cfg = ExecConfig::process();
        cfg.inherit_env.clear();
        cfg.env.insert("ENCLAVE_TEST".to_string(), "1".to_string());
        let env = build_env(&cfg);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ENCLAVE_TEST"), Some(&"1".to_string()));
    }

    #[test]
    fn cwd_must_stay_inside_scope() {
        let mut cfg = ExecConfig::process();
        cfg.cwd = Some("a/./b".to_string());
        assert_eq!(relative_cwd(&cfg).expect("cwd"), "a/b");
        assert_eq!(join_cwd(Path::new("/m"), "a/b"), Path::new("/m/a/b"));
        cfg.cwd = Some("../outside".to_string());
        assert!(relative_cwd(&cfg).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_confinement_runs_in_merged_view() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "present").expect("write");
        let result = run(
            &view(temp.path()),
            &ExecConfig::process(),
            "sh",
            &["-c".to_string(), "cat marker.txt; printf 'err' 1>&2".to_string()],
        )
        .await
        .expect("run");
        assert_eq!(result.stdout, "present");
        assert_eq!(result.stderr, "err");
        assert_eq!(result.status_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let temp = tempdir().expect("tempdir");
        let mut cfg = ExecConfig::process();
        cfg.timeout = Some(Duration::from_millis(100));
        let err = run(&view(temp.path()), &cfg, "sleep", &["5".to_string()])
            .await
            .expect_err("timeout");
        match err {
            crate::DriverError::ExecFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
