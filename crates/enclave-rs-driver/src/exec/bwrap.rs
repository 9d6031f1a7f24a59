//! Bubblewrap command construction for namespace confinement.

use super::ExecView;
use crate::error::DriverError;
use crate::types::{ExecConfig, NetworkMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Build a bwrap invocation that shows the host project read-only with the
/// merged view bound over the scope.
pub(super) fn command(
    view: &ExecView,
    cfg: &ExecConfig,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    program: &str,
    args: &[String],
    detached: bool,
) -> Result<Command, DriverError> {
    let bwrap_path = which::which("bwrap").map_err(|_| {
        DriverError::Unavailable("bubblewrap (bwrap) not found in PATH".to_string())
    })?;
    let mut cmd = Command::new(bwrap_path);
    cmd.args(bwrap_args(view, cfg, cwd, env, program, args, detached)?);
    Ok(cmd)
}

fn bwrap_args(
    view: &ExecView,
    cfg: &ExecConfig,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    program: &str,
    args: &[String],
    detached: bool,
) -> Result<Vec<String>, DriverError> {
    for path in [&view.project_root, &view.scope_root, &view.merged] {
        if !path.is_absolute() {
            return Err(DriverError::ExecFailed(format!(
                "sandbox paths must be absolute: {}",
                path.display()
            )));
        }
    }
    if !view.merged.is_dir() {
        return Err(DriverError::ExecFailed(format!(
            "merged view missing: {}",
            view.merged.display()
        )));
    }

    let mut out: Vec<String> = Vec::new();
    if !detached {
        out.push("--die-with-parent".to_string());
    }
    out.extend(
        [
            "--new-session",
            "--unshare-user",
            "--uid",
            "0",
            "--gid",
            "0",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-pid",
            "--proc",
            "/proc",
        ]
        .map(str::to_string),
    );
    if cfg.network == NetworkMode::Deny {
        out.push("--unshare-net".to_string());
    }

    for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/opt"] {
        let dir = Path::new(dir);
        bind_if_exists(&mut out, "--ro-bind", dir, dir);
    }
    append_etc_mounts(&mut out);
    out.extend(["--dev", "/dev", "--tmpfs", "/tmp"].map(str::to_string));

    if view.project_root != view.scope_root {
        push_bind(&mut out, "--ro-bind", &view.project_root, &view.project_root);
    }
    push_bind(&mut out, "--bind", &view.merged, &view.scope_root);

    out.push("--chdir".to_string());
    out.push(cwd.display().to_string());
    out.push("--clearenv".to_string());
    for (key, value) in env {
        out.push("--setenv".to_string());
        out.push(key.clone());
        out.push(value.clone());
    }
    out.push("--".to_string());
    out.push(program.to_string());
    out.extend(args.iter().cloned());
    Ok(out)
}

fn push_bind(args: &mut Vec<String>, flag: &str, source: &Path, target: &Path) {
    args.push(flag.to_string());
    args.push(source.display().to_string());
    args.push(target.display().to_string());
}

fn bind_if_exists(args: &mut Vec<String>, flag: &str, source: &Path, target: &Path) {
    if source.exists() {
        push_bind(args, flag, source, target);
    }
}

/// Minimal /etc needed for name resolution and user lookups.
fn append_etc_mounts(args: &mut Vec<String>) {
    args.push("--dir".to_string());
    args.push("/etc".to_string());
    for file in [
        "/etc/hosts",
        "/etc/nsswitch.conf",
        "/etc/passwd",
        "/etc/group",
        "/etc/ld.so.cache",
        "/etc/ssl",
    ] {
        let file = Path::new(file);
        bind_if_exists(args, "--ro-bind", file, file);
    }
    let resolv = Path::new("/etc/resolv.conf");
    let target: PathBuf = fs::canonicalize(resolv).unwrap_or_else(|_| resolv.to_path_buf());
    bind_if_exists(args, "--ro-bind", &target, resolv);
}
