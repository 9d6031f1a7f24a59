//! Driver trait and helpers shared by the concrete drivers.

pub mod copy;
#[cfg(target_os = "linux")]
pub mod overlay;
pub(crate) mod snapshot;

use crate::error::DriverError;
use crate::exec::ExecView;
use crate::types::{ExecConfig, ExecResult};
use async_trait::async_trait;
use enclave_rs_protocol::scope::{ROOT_SCOPE, normalize_scope};
use enclave_rs_protocol::{FileChange, MountPaths, Sandbox};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// OS mechanism giving a sandbox a private writable view of a host subtree.
///
/// Implementations key all backing storage by sandbox id and never touch
/// the host tree.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry name recorded on each sandbox.
    fn name(&self) -> &str;

    /// Prepare storage and expose the merged view. A no-op returning the
    /// existing paths when already mounted and intact.
    async fn mount(&self, sandbox: &Sandbox) -> Result<MountPaths, DriverError>;

    /// Detach the merged view, keeping the upper layer. Safe when unmounted.
    async fn unmount(&self, sandbox: &Sandbox) -> Result<(), DriverError>;

    /// Delete the upper layer and all backing metadata. Safe in any state.
    async fn cleanup(&self, sandbox: &Sandbox) -> Result<(), DriverError>;

    /// Every path under the scope whose content, mode or existence differs
    /// from the lower layer, sorted by path.
    async fn changed_files(&self, sandbox: &Sandbox) -> Result<Vec<FileChange>, DriverError>;

    async fn is_mounted(&self, sandbox: &Sandbox) -> Result<bool, DriverError>;

    async fn verify_mount_integrity(&self, sandbox: &Sandbox) -> Result<(), DriverError>;

    /// Run a command confined to the merged view and wait for it.
    async fn exec(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, DriverError>;

    /// Spawn a confined command and return its pid without waiting.
    async fn start_process(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<u32, DriverError>;

    /// Drop one path from the upper layer so it reverts to the lower content.
    async fn remove_from_upper(&self, sandbox: &Sandbox, path: &str) -> Result<(), DriverError>;

    /// Ids of every sandbox that has storage under this driver, sorted.
    async fn stored_sandboxes(&self) -> Result<Vec<Uuid>, DriverError>;

    /// Delete the storage of a sandbox whose record no longer exists.
    /// Missing storage is not an error.
    async fn remove_orphan(&self, id: Uuid) -> Result<(), DriverError>;
}

/// Backing storage of one sandbox under a driver's state directory.
#[derive(Debug, Clone)]
pub(crate) struct SandboxStorage {
    root: PathBuf,
}

impl SandboxStorage {
    pub(crate) fn new(state_dir: &Path, id: Uuid) -> Self {
        Self {
            root: state_dir.join(id.to_string()),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove everything; missing storage is not an error.
    pub(crate) fn remove(&self) -> Result<(), DriverError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Sandbox ids with a storage directory under `state_dir`. Entries that
/// are not directories named by a uuid are ignored.
pub(crate) fn stored_ids(state_dir: &Path) -> Result<Vec<Uuid>, DriverError> {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| Uuid::parse_str(name).ok())
        {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

/// Exec view of a sandbox whose merged layer lives at `merged`.
pub(crate) fn exec_view(sandbox: &Sandbox, merged: PathBuf) -> ExecView {
    ExecView {
        project_root: sandbox.project_root.clone(),
        scope_root: sandbox.scope_root(),
        merged,
    }
}

/// Normalize a path relative to the scope; the scope root itself is refused.
pub(crate) fn scoped_path(path: &str) -> Result<String, DriverError> {
    let normalized = normalize_scope(path).map_err(|err| DriverError::Fatal(err.to_string()))?;
    if normalized == ROOT_SCOPE {
        return Err(DriverError::Fatal(
            "refusing to operate on the scope root".to_string(),
        ));
    }
    Ok(normalized)
}

/// Run filesystem-heavy work off the async runtime.
pub(crate) async fn blocking<T, F>(op: F) -> Result<T, DriverError>
where
    F: FnOnce() -> Result<T, DriverError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| DriverError::Fatal(format!("driver task failed: {err}")))?
}

/// Remove a file or directory, treating a missing path as success.
pub(crate) fn remove_path(path: &Path) -> Result<(), DriverError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::{SandboxStorage, remove_path, scoped_path, stored_ids};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn scoped_path_rejects_root_and_escapes() {
        assert_eq!(scoped_path("a/./b").expect("path"), "a/b");
        assert!(scoped_path(".").is_err());
        assert!(scoped_path("../x").is_err());
    }

    #[test]
    fn storage_removal_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let storage = SandboxStorage::new(temp.path(), Uuid::new_v4());
        std::fs::create_dir_all(storage.join("upper")).expect("upper");
        storage.remove().expect("remove");
        assert!(!storage.root().exists());
        storage.remove().expect("remove again");
    }

    #[test]
    fn stored_ids_lists_only_sandbox_directories() {
        let temp = tempdir().expect("tempdir");
        assert!(stored_ids(&temp.path().join("absent")).expect("absent").is_empty());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for id in [first, second] {
            std::fs::create_dir_all(temp.path().join(id.to_string())).expect("storage");
        }
        std::fs::create_dir_all(temp.path().join("scratch")).expect("scratch");
        std::fs::write(temp.path().join(Uuid::new_v4().to_string()), "x").expect("file");

        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(stored_ids(temp.path()).expect("ids"), expected);
    }

    #[test]
    fn remove_path_handles_files_dirs_and_missing() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("f");
        let dir = temp.path().join("d");
        std::fs::write(&file, "x").expect("file");
        std::fs::create_dir_all(dir.join("nested")).expect("dir");
        remove_path(&file).expect("file");
        remove_path(&dir).expect("dir");
        remove_path(&temp.path().join("missing")).expect("missing");
        assert!(!file.exists());
        assert!(!dir.exists());
    }
}
