//! Portable driver that materializes the merged view as a private copy.
//!
//! On mount the scope is copied into `<state>/<id>/tree` and its manifest is
//! written to `lower.json`; the copy serves as both upper and merged layer.
//! Changes are the difference between the tree and that manifest.

use super::snapshot::{self, Manifest};
use super::{
    Driver, SandboxStorage, blocking, exec_view, remove_path, scoped_path, stored_ids,
};
use crate::error::DriverError;
use crate::exec;
use crate::types::{ExecConfig, ExecResult};
use async_trait::async_trait;
use enclave_rs_protocol::{FileChange, MountPaths, Sandbox};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Registry name of [`CopyDriver`].
pub const COPY_DRIVER: &str = "copy";

const TREE_DIR: &str = "tree";
const MANIFEST_FILE: &str = "lower.json";
const MOUNTED_MARKER: &str = "mounted";

/// Snapshot-copy driver for hosts without kernel overlay support.
#[derive(Debug, Clone)]
pub struct CopyDriver {
    state_dir: PathBuf,
}

impl CopyDriver {
    /// Create a driver storing sandboxes under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn storage(&self, sandbox: &Sandbox) -> SandboxStorage {
        SandboxStorage::new(&self.state_dir, sandbox.id)
    }

    fn paths(storage: &SandboxStorage, sandbox: &Sandbox) -> MountPaths {
        let tree = storage.join(TREE_DIR);
        MountPaths {
            lower: sandbox.scope_root(),
            upper: tree.clone(),
            work: None,
            merged: tree,
        }
    }
}

fn read_manifest(storage: &SandboxStorage) -> Result<Manifest, DriverError> {
    let path = storage.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            DriverError::Corrupt(format!("manifest missing: {}", path.display()))
        } else {
            DriverError::Io(err)
        }
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

fn check_integrity(storage: &SandboxStorage, sandbox: &Sandbox) -> Result<(), DriverError> {
    if !storage.join(MOUNTED_MARKER).exists() {
        return Err(DriverError::NotMounted(sandbox.id));
    }
    if !storage.join(TREE_DIR).is_dir() || !storage.join(MANIFEST_FILE).is_file() {
        return Err(DriverError::Corrupt(format!(
            "copy storage incomplete: {}",
            storage.root().display()
        )));
    }
    Ok(())
}

fn mount_blocking(storage: SandboxStorage, sandbox: Sandbox) -> Result<MountPaths, DriverError> {
    let paths = CopyDriver::paths(&storage, &sandbox);
    let tree = storage.join(TREE_DIR);
    let marker = storage.join(MOUNTED_MARKER);

    if tree.is_dir() && storage.join(MANIFEST_FILE).is_file() {
        if !marker.exists() {
            fs::write(&marker, b"")?;
        }
        debug!("copy sandbox already materialized (sandbox_id={})", sandbox.id);
        return Ok(paths);
    }

    // A previous attempt died half way; start over.
    storage.remove()?;
    fs::create_dir_all(&tree)?;

    let scope_root = sandbox.scope_root();
    let manifest = if scope_root.is_dir() {
        snapshot::copy_tree(&scope_root, &tree)?
    } else if scope_root.exists() {
        return Err(DriverError::MountFailed(format!(
            "scope is not a directory: {}",
            scope_root.display()
        )));
    } else {
        Manifest::new()
    };
    fs::write(storage.join(MANIFEST_FILE), serde_json::to_vec(&manifest)?)?;
    fs::write(&marker, b"")?;
    info!(
        "copy sandbox mounted (sandbox_id={}, files={})",
        sandbox.id,
        manifest.len()
    );
    Ok(paths)
}

fn revert_path(storage: &SandboxStorage, scope_root: &Path, rel: &str) -> Result<(), DriverError> {
    let manifest = read_manifest(storage)?;
    let target = storage.join(TREE_DIR).join(rel);
    let Some(original) = manifest.get(rel) else {
        return remove_path(&target);
    };
    let host = scope_root.join(rel);
    let current = snapshot::fingerprint(&host)
        .map_err(|err| DriverError::Fatal(format!("lower copy of {rel} unreadable: {err}")))?;
    if current.hash != original.hash {
        return Err(DriverError::Fatal(format!(
            "lower content of {rel} changed since mount"
        )));
    }
    remove_path(&target)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&host, &target)?;
    Ok(())
}

#[async_trait]
impl Driver for CopyDriver {
    fn name(&self) -> &str {
        COPY_DRIVER
    }

    async fn mount(&self, sandbox: &Sandbox) -> Result<MountPaths, DriverError> {
        let storage = self.storage(sandbox);
        let sandbox = sandbox.clone();
        blocking(move || mount_blocking(storage, sandbox)).await
    }

    async fn unmount(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        match fs::remove_file(self.storage(sandbox).join(MOUNTED_MARKER)) {
            Ok(()) => {
                info!("copy sandbox unmounted (sandbox_id={})", sandbox.id);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn cleanup(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        let storage = self.storage(sandbox);
        blocking(move || storage.remove()).await?;
        info!("copy sandbox storage removed (sandbox_id={})", sandbox.id);
        Ok(())
    }

    async fn changed_files(&self, sandbox: &Sandbox) -> Result<Vec<FileChange>, DriverError> {
        let storage = self.storage(sandbox);
        blocking(move || {
            let manifest = read_manifest(&storage)?;
            let tree = storage.join(TREE_DIR);
            if !tree.is_dir() {
                return Err(DriverError::Corrupt(format!(
                    "sandbox tree missing: {}",
                    tree.display()
                )));
            }
            snapshot::diff_against(&manifest, &tree)
        })
        .await
    }

    async fn is_mounted(&self, sandbox: &Sandbox) -> Result<bool, DriverError> {
        Ok(self.storage(sandbox).join(MOUNTED_MARKER).exists())
    }

    async fn verify_mount_integrity(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        check_integrity(&self.storage(sandbox), sandbox)
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, DriverError> {
        let storage = self.storage(sandbox);
        check_integrity(&storage, sandbox)?;
        let view = exec_view(sandbox, storage.join(TREE_DIR));
        exec::run(&view, cfg, command, args).await
    }

    async fn start_process(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<u32, DriverError> {
        let storage = self.storage(sandbox);
        check_integrity(&storage, sandbox)?;
        let view = exec_view(sandbox, storage.join(TREE_DIR));
        exec::start(&view, cfg, command, args)
    }

    async fn remove_from_upper(&self, sandbox: &Sandbox, path: &str) -> Result<(), DriverError> {
        let rel = scoped_path(path)?;
        let storage = self.storage(sandbox);
        let scope_root = sandbox.scope_root();
        debug!(
            "reverting path in copy sandbox (sandbox_id={}, path={})",
            sandbox.id, rel
        );
        blocking(move || revert_path(&storage, &scope_root, &rel)).await
    }

    async fn stored_sandboxes(&self) -> Result<Vec<Uuid>, DriverError> {
        let state_dir = self.state_dir.clone();
        blocking(move || stored_ids(&state_dir)).await
    }

    async fn remove_orphan(&self, id: Uuid) -> Result<(), DriverError> {
        let storage = SandboxStorage::new(&self.state_dir, id);
        blocking(move || storage.remove()).await?;
        info!("orphaned copy storage removed (sandbox_id={id})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CopyDriver, MOUNTED_MARKER};
    use crate::driver::Driver;
    use enclave_rs_protocol::{ChangeKind, Sandbox};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mount_is_idempotent_and_keeps_writes() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src")).expect("src");
        fs::write(project.join("src/a.txt"), "a").expect("a");
        let driver = CopyDriver::new(temp.path().join("state"));
        let sandbox = Sandbox::new("src", &project, "alice", "copy");

        let first = driver.mount(&sandbox).await.expect("mount");
        fs::write(first.merged.join("b.txt"), "b").expect("write");
        let second = driver.mount(&sandbox).await.expect("remount");
        assert_eq!(first, second);
        assert!(second.merged.join("b.txt").exists());
        assert_eq!(first.lower, project.join("src"));
    }

    #[tokio::test]
    async fn changes_survive_unmount_and_vanish_on_cleanup() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        fs::write(project.join("readme.md"), "v1").expect("readme");
        let driver = CopyDriver::new(temp.path().join("state"));
        let sandbox = Sandbox::new(".", &project, "bob", "copy");

        let paths = driver.mount(&sandbox).await.expect("mount");
        fs::write(paths.merged.join("readme.md"), "v2").expect("modify");
        driver.unmount(&sandbox).await.expect("unmount");
        driver.unmount(&sandbox).await.expect("unmount twice");
        assert!(!driver.is_mounted(&sandbox).await.expect("probe"));

        let changes = driver.changed_files(&sandbox).await.expect("changes");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(fs::read_to_string(project.join("readme.md")).expect("host"), "v1");

        driver.cleanup(&sandbox).await.expect("cleanup");
        driver.cleanup(&sandbox).await.expect("cleanup twice");
        assert!(!paths.upper.exists());
        assert!(driver.changed_files(&sandbox).await.is_err());
    }

    #[tokio::test]
    async fn missing_scope_mounts_empty_view() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        let driver = CopyDriver::new(temp.path().join("state"));
        let sandbox = Sandbox::new("src", &project, "alice", "copy");

        let paths = driver.mount(&sandbox).await.expect("mount");
        fs::write(paths.merged.join("new.txt"), "hi").expect("write");
        let changes = driver.changed_files(&sandbox).await.expect("changes");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "new.txt");
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].size, 2);
    }

    #[tokio::test]
    async fn integrity_requires_marker() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        let state = temp.path().join("state");
        let driver = CopyDriver::new(&state);
        let sandbox = Sandbox::new(".", &project, "alice", "copy");

        assert!(driver.verify_mount_integrity(&sandbox).await.is_err());
        driver.mount(&sandbox).await.expect("mount");
        driver.verify_mount_integrity(&sandbox).await.expect("intact");
        fs::remove_file(state.join(sandbox.id.to_string()).join(MOUNTED_MARKER)).expect("marker");
        match driver.verify_mount_integrity(&sandbox).await {
            Err(crate::DriverError::NotMounted(id)) => assert_eq!(id, sandbox.id),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphaned_storage_is_listed_and_removed() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        let driver = CopyDriver::new(temp.path().join("state"));
        assert!(driver.stored_sandboxes().await.expect("empty").is_empty());

        let kept = Sandbox::new(".", &project, "alice", "copy");
        let orphan = Sandbox::new(".", &project, "bob", "copy");
        driver.mount(&kept).await.expect("mount kept");
        driver.mount(&orphan).await.expect("mount orphan");
        let mut both = vec![kept.id, orphan.id];
        both.sort();
        assert_eq!(driver.stored_sandboxes().await.expect("listed"), both);

        driver.remove_orphan(orphan.id).await.expect("remove");
        driver.remove_orphan(orphan.id).await.expect("remove again");
        assert_eq!(driver.stored_sandboxes().await.expect("listed"), vec![kept.id]);
        assert!(driver.is_mounted(&kept).await.expect("kept"));
    }

    #[tokio::test]
    async fn remove_from_upper_reverts_to_lower() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        fs::write(project.join("keep.txt"), "original").expect("keep");
        let driver = CopyDriver::new(temp.path().join("state"));
        let sandbox = Sandbox::new(".", &project, "alice", "copy");
        let paths = driver.mount(&sandbox).await.expect("mount");

        fs::write(paths.merged.join("keep.txt"), "changed").expect("modify");
        fs::write(paths.merged.join("extra.txt"), "extra").expect("add");
        driver
            .remove_from_upper(&sandbox, "keep.txt")
            .await
            .expect("revert");
        driver
            .remove_from_upper(&sandbox, "extra.txt")
            .await
            .expect("drop");
        assert!(driver.changed_files(&sandbox).await.expect("changes").is_empty());
        assert!(driver.remove_from_upper(&sandbox, "..").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_runs_inside_the_copy() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("project");
        let driver = CopyDriver::new(temp.path().join("state"));
        let sandbox = Sandbox::new(".", &project, "alice", "copy");
        driver.mount(&sandbox).await.expect("mount");

        let result = driver
            .exec(
                &sandbox,
                &crate::ExecConfig::process(),
                "sh",
                &["-c".to_string(), "printf hi > out.txt".to_string()],
            )
            .await
            .expect("exec");
        assert_eq!(result.status_code, Some(0));
        assert!(!project.join("out.txt").exists());
        let changes = driver.changed_files(&sandbox).await.expect("changes");
        assert_eq!(changes[0].path, "out.txt");
    }
}
