//! Applies an approved change set to the host tree.
//!
//! Each added or modified file is streamed from driver storage into a hidden
//! sibling of its target, verified against the reported hash, synced, and
//! renamed into place. Deletions run after every write; a deletion whose
//! path changed kind under a write (file to directory or back) is already
//! settled by that write. The first failure stops the run and is reported
//! together with the paths already applied.

use enclave_rs_protocol::scope::{ROOT_SCOPE, normalize_scope};
use enclave_rs_protocol::{ChangeKind, FileChange};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

const COPY_BUFFER: usize = 64 * 1024;

/// Approval stopped part-way; `applied` lists what reached the host.
#[derive(Debug, Clone, Error, Serialize)]
#[error("approval stopped at {path}: {message}")]
pub struct ApplyError {
    pub path: String,
    pub message: String,
    pub applied: Vec<String>,
}

impl ApplyError {
    /// Partial-application report recorded on the failed sandbox.
    pub fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "failed_path": self.path,
            "message": self.message,
            "applied": self.applied,
            "files_applied": self.applied.len(),
        })
    }
}

struct Target<'a> {
    change: &'a FileChange,
    relative: String,
    path: PathBuf,
}

/// Apply `changes` (scope-relative) under `scope_path` of `project_root`.
/// Returns the number of files applied.
pub fn apply_changes(
    project_root: &Path,
    scope_path: &str,
    changes: &[FileChange],
) -> Result<usize, ApplyError> {
    let scope_root = if scope_path == ROOT_SCOPE {
        project_root.to_path_buf()
    } else {
        project_root.join(scope_path)
    };
    let boundary = containment_root(project_root, scope_path).map_err(|err| ApplyError {
        path: scope_path.to_string(),
        message: err.to_string(),
        applied: Vec::new(),
    })?;

    let mut targets = Vec::with_capacity(changes.len());
    for change in changes {
        let target = resolve_target(&scope_root, &boundary, change).map_err(|message| {
            ApplyError {
                path: change.path.clone(),
                message,
                applied: Vec::new(),
            }
        })?;
        targets.push(target);
    }
    targets.sort_by_key(|target| batch(target.change.kind));

    let mut applied: Vec<String> = Vec::with_capacity(targets.len());
    for target in &targets {
        let outcome = match target.change.kind {
            ChangeKind::Added | ChangeKind::Modified => write_file(&scope_root, target),
            ChangeKind::Deleted => match superseded_by(&target.relative, &applied) {
                Some(written) => {
                    debug!(
                        "deletion already covered by a write (path={}, written={written})",
                        target.relative
                    );
                    Ok(())
                }
                None => delete_path(&target.path),
            },
        };
        if let Err(err) = outcome {
            warn!(
                "approval stopped (path={}, applied={}, error={err})",
                target.relative,
                applied.len()
            );
            return Err(ApplyError {
                path: target.relative.clone(),
                message: err.to_string(),
                applied,
            });
        }
        debug!(
            "applied change (path={}, kind={:?})",
            target.relative, target.change.kind
        );
        applied.push(target.relative.clone());
    }
    info!(
        "change set applied (root={}, scope={scope_path}, files={})",
        project_root.display(),
        applied.len()
    );
    Ok(applied.len())
}

fn batch(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Added => 0,
        ChangeKind::Modified => 1,
        ChangeKind::Deleted => 2,
    }
}

/// Canonical directory every target must resolve beneath.
fn containment_root(project_root: &Path, scope_path: &str) -> io::Result<PathBuf> {
    let root = fs::canonicalize(project_root)?;
    if scope_path == ROOT_SCOPE {
        return Ok(root);
    }
    let scope_root = project_root.join(scope_path);
    let resolved = canonical_prefix(&scope_root)?;
    if !resolved.starts_with(&root) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "scope resolves outside the project root",
        ));
    }
    Ok(resolved)
}

/// Canonical form of the deepest existing ancestor, with the missing tail
/// appended lexically.
fn canonical_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while fs::symlink_metadata(&existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = fs::canonicalize(&existing)?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

fn resolve_target<'a>(
    scope_root: &Path,
    boundary: &Path,
    change: &'a FileChange,
) -> Result<Target<'a>, String> {
    let relative = normalize_scope(&change.path).map_err(|err| err.to_string())?;
    if relative == ROOT_SCOPE {
        return Err("change targets the scope root".to_string());
    }
    let path = scope_root.join(&relative);
    let parent = path
        .parent()
        .ok_or_else(|| "change has no parent directory".to_string())?;
    let resolved = canonical_prefix(parent).map_err(|err| err.to_string())?;
    if !resolved.starts_with(boundary) {
        return Err(format!(
            "target resolves outside the scope: {}",
            resolved.display()
        ));
    }
    if matches!(change.kind, ChangeKind::Added | ChangeKind::Modified) && change.source.is_none() {
        return Err("change has no content source".to_string());
    }
    Ok(Target {
        change,
        relative,
        path,
    })
}

fn write_file(scope_root: &Path, target: &Target<'_>) -> io::Result<()> {
    let Some(source) = target.change.source.as_deref() else {
        return Err(io::Error::new(io::ErrorKind::NotFound, "missing source"));
    };
    let parent = prepare_parent(scope_root, &target.path)?;
    let name = target
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = parent.join(format!(".{name}.enclave-{}.tmp", Uuid::new_v4().simple()));
    let result = stage(source, &staging, target.change).and_then(|()| {
        if fs::symlink_metadata(&target.path).is_ok_and(|meta| meta.is_dir()) {
            fs::remove_dir_all(&target.path)?;
        }
        fs::rename(&staging, &target.path)
    });
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result?;
    sync_dir(&parent);
    Ok(())
}

/// Copy `source` to `staging`, checking the hash and applying the mode.
fn stage(source: &Path, staging: &Path, change: &FileChange) -> io::Result<()> {
    let mut input = File::open(source)?;
    let mut output = File::create(staging)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER];
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        output.write_all(&buffer[..read])?;
    }
    let digest = hex::encode(hasher.finalize());
    if let Some(expected) = change.hash.as_deref()
        && expected != digest
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("content changed since listing (expected {expected}, found {digest})"),
        ));
    }
    #[cfg(unix)]
    if let Some(mode) = change.mode {
        use std::os::unix::fs::PermissionsExt;
        output.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
    }
    output.sync_all()
}

/// Create missing parents, replacing any non-directory that stands in the
/// way (the change set deletes it later).
fn prepare_parent(scope_root: &Path, target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent"))?
        .to_path_buf();
    if let Ok(relative) = parent.strip_prefix(scope_root) {
        let mut current = scope_root.to_path_buf();
        for component in relative.components() {
            current.push(component);
            if fs::symlink_metadata(&current).is_ok()
                && !fs::metadata(&current).is_ok_and(|meta| meta.is_dir())
            {
                fs::remove_file(&current)?;
            }
        }
    }
    fs::create_dir_all(&parent)?;
    Ok(parent)
}

/// A written path that changed the kind of `deleted`: a file now stands where
/// one of its ancestors was, or `deleted` became a directory holding new
/// files. Either way the old entry is already gone from the host.
fn superseded_by<'a>(deleted: &str, written: &'a [String]) -> Option<&'a str> {
    written
        .iter()
        .find(|path| is_beneath(deleted, path) || is_beneath(path, deleted))
        .map(String::as_str)
}

fn is_beneath(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn delete_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if is_gone(&err) => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(err) if is_gone(&err) => Ok(()),
        other => other,
    }
}

/// Missing paths and paths under an ancestor that is no longer a directory
/// both count as deleted.
fn is_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        debug!("directory sync failed (dir={}, error={err})", dir.display());
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Stage the scope and commit when `project_root` is a git work tree.
/// Returns the new `HEAD`, or `None` when there is nothing to commit or git
/// is not usable here.
pub async fn git_commit(project_root: &Path, scope_path: &str, message: &str) -> Option<String> {
    match try_git_commit(project_root, scope_path, message).await {
        Ok(hash) => hash,
        Err(err) => {
            warn!(
                "git commit after approval failed (root={}, error={err})",
                project_root.display()
            );
            None
        }
    }
}

async fn try_git_commit(
    project_root: &Path,
    scope_path: &str,
    message: &str,
) -> io::Result<Option<String>> {
    let inside = git(project_root, &["rev-parse", "--is-inside-work-tree"]).await?;
    if inside.as_deref() != Some("true") {
        debug!(
            "project root is not a git work tree (root={})",
            project_root.display()
        );
        return Ok(None);
    }
    git(project_root, &["add", "-A", "--", scope_path]).await?;
    let staged = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .args(["diff", "--cached", "--quiet"])
        .status()
        .await?;
    if staged.success() {
        return Ok(None);
    }
    let mut commit = Vec::new();
    if git(project_root, &["config", "user.email"]).await?.is_none() {
        commit.extend(["-c", "user.name=enclave", "-c", "user.email=enclave@localhost"]);
    }
    commit.extend(["commit", "--no-verify", "-m", message]);
    if git(project_root, &commit).await?.is_none() {
        return Err(io::Error::other("git commit failed"));
    }
    let head = git(project_root, &["rev-parse", "HEAD"]).await?;
    info!(
        "approved changes committed (root={}, commit={:?})",
        project_root.display(),
        head
    );
    Ok(head)
}

/// Trimmed stdout of a successful git invocation, `None` on a non-zero exit.
async fn git(project_root: &Path, args: &[&str]) -> io::Result<Option<String>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        debug!(
            "git exited unsuccessfully (args={args:?}, stderr={})",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::apply_changes;
    use enclave_rs_protocol::{ChangeKind, FileChange};
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn staged(dir: &Path, path: &str, contents: &str, kind: ChangeKind) -> FileChange {
        let source = dir.join(format!("src-{}", path.replace('/', "_")));
        fs::write(&source, contents).expect("source");
        FileChange {
            path: path.to_string(),
            kind,
            size: contents.len() as u64,
            hash: Some(hex::encode(Sha256::digest(contents.as_bytes()))),
            mode: Some(0o640),
            source: Some(source),
        }
    }

    #[test]
    fn applies_adds_modifies_and_deletes() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let storage = temp.path().join("storage");
        fs::create_dir_all(root.join("src")).expect("src");
        fs::create_dir_all(&storage).expect("storage");
        fs::write(root.join("src/keep.txt"), "old").expect("keep");
        fs::write(root.join("src/gone.txt"), "bye").expect("gone");

        let changes = vec![
            FileChange::deleted("gone.txt"),
            staged(&storage, "keep.txt", "new", ChangeKind::Modified),
            staged(&storage, "deep/new.txt", "hi", ChangeKind::Added),
        ];
        let applied = apply_changes(&root, "src", &changes).expect("apply");
        assert_eq!(applied, 3);
        assert_eq!(fs::read_to_string(root.join("src/keep.txt")).expect("keep"), "new");
        assert_eq!(fs::read_to_string(root.join("src/deep/new.txt")).expect("new"), "hi");
        assert!(!root.join("src/gone.txt").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root.join("src/deep/new.txt"))
                .expect("meta")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o640);
        }
        let leftovers: Vec<_> = fs::read_dir(root.join("src"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn escaping_paths_are_refused_before_any_write() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(root.join("src")).expect("src");
        let storage = temp.path().join("storage");
        fs::create_dir_all(&storage).expect("storage");
        let changes = vec![
            staged(&storage, "ok.txt", "fine", ChangeKind::Added),
            staged(&storage, "../outside.txt", "nope", ChangeKind::Added),
        ];
        let err = apply_changes(&root, "src", &changes).expect_err("escape");
        assert!(err.applied.is_empty());
        assert!(!root.join("src/ok.txt").exists());
    }

    #[test]
    fn hash_mismatch_stops_and_reports_progress() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("root");
        let storage = temp.path().join("storage");
        fs::create_dir_all(&storage).expect("storage");
        let good = staged(&storage, "a.txt", "a", ChangeKind::Added);
        let mut bad = staged(&storage, "b.txt", "b", ChangeKind::Added);
        bad.hash = Some("0".repeat(64));
        let err = apply_changes(&root, ".", &[good, bad]).expect_err("mismatch");
        assert_eq!(err.path, "b.txt");
        assert_eq!(err.applied, vec!["a.txt".to_string()]);
        assert!(root.join("a.txt").exists());
        assert!(!root.join("b.txt").exists());
        assert_eq!(err.report()["files_applied"], 1);
    }

    #[test]
    fn file_replaced_by_directory_keeps_new_contents() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let storage = temp.path().join("storage");
        fs::create_dir_all(&root).expect("root");
        fs::create_dir_all(&storage).expect("storage");
        fs::write(root.join("thing"), "was a file").expect("thing");

        let changes = vec![
            FileChange::deleted("thing"),
            staged(&storage, "thing/inner.txt", "x", ChangeKind::Added),
        ];
        let applied = apply_changes(&root, ".", &changes).expect("apply");
        assert_eq!(applied, 2);
        assert!(root.join("thing").is_dir());
        assert_eq!(
            fs::read_to_string(root.join("thing/inner.txt")).expect("inner"),
            "x"
        );
    }

    #[test]
    fn directory_replaced_by_file_is_applied() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let storage = temp.path().join("storage");
        fs::create_dir_all(root.join("d")).expect("d");
        fs::create_dir_all(&storage).expect("storage");
        fs::write(root.join("d/a.txt"), "old").expect("a");

        let changes = vec![
            FileChange::deleted("d/a.txt"),
            staged(&storage, "d", "now a file", ChangeKind::Added),
        ];
        let applied = apply_changes(&root, ".", &changes).expect("apply");
        assert_eq!(applied, 2);
        assert!(root.join("d").is_file());
        assert_eq!(fs::read_to_string(root.join("d")).expect("d"), "now a file");
    }

    #[test]
    fn deleting_under_a_plain_file_counts_as_done() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("root");
        fs::write(root.join("plain"), "file").expect("plain");
        let applied =
            apply_changes(&root, ".", &[FileChange::deleted("plain/child.txt")]).expect("apply");
        assert_eq!(applied, 1);
        assert!(root.join("plain").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_cannot_redirect_writes() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let outside = temp.path().join("outside");
        fs::create_dir_all(root.join("src")).expect("src");
        fs::create_dir_all(&outside).expect("outside");
        std::os::unix::fs::symlink(&outside, root.join("src/link")).expect("symlink");
        let storage = temp.path().join("storage");
        fs::create_dir_all(&storage).expect("storage");
        let changes = vec![staged(&storage, "link/evil.txt", "x", ChangeKind::Added)];
        assert!(apply_changes(&root, "src", &changes).is_err());
        assert!(!outside.join("evil.txt").exists());
    }
}
