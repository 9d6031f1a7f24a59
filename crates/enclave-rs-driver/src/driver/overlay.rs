//! Kernel overlayfs driver for Linux hosts.
//!
//! Layout under `<state>/<id>/`: `upper/`, `work/`, `merged/`, and `lower/`
//! when the host scope does not exist yet. Deletions show up in the upper
//! layer as 0/0 character devices; directories replaced wholesale carry the
//! `overlay.opaque` xattr.

use super::snapshot::{self, Fingerprint};
use super::{
    Driver, SandboxStorage, blocking, exec_view, remove_path, scoped_path, stored_ids,
};
use crate::error::DriverError;
use crate::exec;
use crate::types::{ExecConfig, ExecResult};
use async_trait::async_trait;
use enclave_rs_protocol::{ChangeKind, FileChange, MountPaths, Sandbox};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Registry name of [`OverlayDriver`].
pub const OVERLAY_DRIVER: &str = "overlay";

const LOWER_DIR: &str = "lower";
const UPPER_DIR: &str = "upper";
const WORK_DIR: &str = "work";
const MERGED_DIR: &str = "merged";

/// Three-layer overlayfs composition per sandbox.
#[derive(Debug, Clone)]
pub struct OverlayDriver {
    state_dir: PathBuf,
}

impl OverlayDriver {
    /// Create a driver storing sandboxes under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Check that overlay mounts can work on this host.
    pub fn probe() -> Result<(), DriverError> {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err(DriverError::Unavailable(
                "overlay mounts require root".to_string(),
            ));
        }
        let filesystems = fs::read_to_string("/proc/filesystems").map_err(|err| {
            DriverError::Unavailable(format!("cannot read /proc/filesystems: {err}"))
        })?;
        if !filesystems
            .lines()
            .any(|line| line.split_whitespace().last() == Some("overlay"))
        {
            return Err(DriverError::Unavailable(
                "kernel has no overlay filesystem".to_string(),
            ));
        }
        Ok(())
    }

    fn storage(&self, sandbox: &Sandbox) -> SandboxStorage {
        SandboxStorage::new(&self.state_dir, sandbox.id)
    }
}

/// Lower layer of a sandbox: the recorded one, else the host scope, else the
/// placeholder used when the scope did not exist at mount time.
fn lower_dir(storage: &SandboxStorage, sandbox: &Sandbox) -> PathBuf {
    if let Some(paths) = &sandbox.mount_paths {
        return paths.lower.clone();
    }
    let placeholder = storage.join(LOWER_DIR);
    if placeholder.is_dir() {
        return placeholder;
    }
    sandbox.scope_root()
}

fn c_path(path: &Path) -> Result<CString, DriverError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| DriverError::MountFailed(format!("path contains NUL: {}", path.display())))
}

/// Whether `path` is currently a mount point, per /proc/self/mountinfo.
pub(crate) fn is_mount_point(path: &Path) -> Result<bool, DriverError> {
    let info = fs::read_to_string("/proc/self/mountinfo")?;
    let wanted = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    Ok(info.lines().any(|line| {
        line.split(' ')
            .nth(4)
            .map(|field| PathBuf::from(unescape_mountinfo(field)) == wanted)
            .unwrap_or(false)
    }))
}

/// Decode the octal escapes (`\040` etc.) mountinfo uses for whitespace.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\'
            && let Some(digits) = bytes.get(idx + 1..idx + 4)
            && let Some(value) = std::str::from_utf8(digits)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
        {
            out.push(value);
            idx += 4;
            continue;
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn mount_options(lower: &Path, upper: &Path, work: &Path) -> Result<String, DriverError> {
    for path in [lower, upper, work] {
        let text = path.display().to_string();
        if text.contains(',') || text.contains(':') {
            return Err(DriverError::MountFailed(format!(
                "overlay layer path contains ',' or ':': {text}"
            )));
        }
    }
    Ok(format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    ))
}

fn mount_blocking(storage: SandboxStorage, sandbox: Sandbox) -> Result<MountPaths, DriverError> {
    OverlayDriver::probe()?;
    let upper = storage.join(UPPER_DIR);
    let work = storage.join(WORK_DIR);
    let merged = storage.join(MERGED_DIR);

    let scope_root = sandbox.scope_root();
    let lower = if scope_root.is_dir() {
        scope_root
    } else if scope_root.exists() {
        return Err(DriverError::MountFailed(format!(
            "scope is not a directory: {}",
            scope_root.display()
        )));
    } else {
        let placeholder = storage.join(LOWER_DIR);
        fs::create_dir_all(&placeholder)?;
        placeholder
    };
    let paths = MountPaths {
        lower: lower.clone(),
        upper: upper.clone(),
        work: Some(work.clone()),
        merged: merged.clone(),
    };

    if merged.is_dir() && is_mount_point(&merged)? {
        debug!("overlay already mounted (sandbox_id={})", sandbox.id);
        return Ok(paths);
    }

    for dir in [&upper, &work, &merged] {
        fs::create_dir_all(dir)?;
    }
    let options = c_string(&mount_options(&lower, &upper, &work)?)?;
    let target = c_path(&merged)?;
    // SAFETY: every pointer refers to a live NUL-terminated string.
    let result = unsafe {
        libc::mount(
            c"overlay".as_ptr(),
            target.as_ptr(),
            c"overlay".as_ptr(),
            0,
            options.as_ptr().cast(),
        )
    };
    if result != 0 {
        return Err(DriverError::from_mount_errno(
            "mount overlay",
            io::Error::last_os_error(),
        ));
    }
    info!(
        "overlay mounted (sandbox_id={}, merged={})",
        sandbox.id,
        merged.display()
    );
    Ok(paths)
}

fn c_string(value: &str) -> Result<CString, DriverError> {
    CString::new(value).map_err(|_| DriverError::MountFailed("mount options contain NUL".into()))
}

fn unmount_blocking(merged: &Path, flags: libc::c_int) -> Result<(), DriverError> {
    if !merged.exists() || !is_mount_point(merged)? {
        return Ok(());
    }
    let target = c_path(merged)?;
    // SAFETY: target is a live NUL-terminated path.
    if unsafe { libc::umount2(target.as_ptr(), flags) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            return Ok(());
        }
        return Err(DriverError::from_mount_errno("umount overlay", err));
    }
    Ok(())
}

/// Lazily detach any view still mounted, then delete the storage.
fn remove_storage(storage: &SandboxStorage, id: Uuid) -> Result<(), DriverError> {
    if let Err(err) = unmount_blocking(&storage.join(MERGED_DIR), libc::MNT_DETACH) {
        warn!("lazy unmount before removal failed (sandbox_id={id}, error={err})");
    }
    storage.remove()
}

fn is_whiteout(meta: &Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn is_opaque(path: &Path) -> bool {
    let Ok(target) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    [c"trusted.overlay.opaque", c"user.overlay.opaque"]
        .iter()
        .any(|name| {
            let mut buf = [0u8; 4];
            // SAFETY: buffers are valid for the declared length.
            let len = unsafe {
                libc::lgetxattr(
                    target.as_ptr(),
                    name.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            len == 1 && buf[0] == b'y'
        })
}

/// Fingerprint of a regular file in the lower layer, if there is one.
fn lower_file(path: &Path) -> Result<Option<Fingerprint>, DriverError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(snapshot::fingerprint(path)?)),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Record every lower regular file at or below `rel` as deleted, skipping
/// paths the upper layer still provides.
fn delete_lower_subtree(
    lower: &Path,
    upper: &Path,
    rel: &str,
    deleted: &mut BTreeSet<String>,
) -> Result<(), DriverError> {
    let start = lower.join(rel);
    if !start.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(&start) {
        let entry = entry.map_err(snapshot::walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = snapshot::relative(lower, entry.path()) else {
            continue;
        };
        let shadowed = fs::symlink_metadata(upper.join(&path))
            .map(|meta| !is_whiteout(&meta))
            .unwrap_or(false);
        if !shadowed {
            deleted.insert(path);
        }
    }
    Ok(())
}

/// Walk the upper layer and translate it into a change set.
pub(crate) fn overlay_changes(lower: &Path, upper: &Path) -> Result<Vec<FileChange>, DriverError> {
    let mut changes = Vec::new();
    let mut deleted = BTreeSet::new();
    if !upper.is_dir() {
        return Err(DriverError::Corrupt(format!(
            "upper layer missing: {}",
            upper.display()
        )));
    }

    let mut walker = WalkDir::new(upper).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(snapshot::walk_error)?;
        let Some(rel) = snapshot::relative(upper, entry.path()) else {
            continue;
        };
        let meta = entry.metadata().map_err(snapshot::walk_error)?;
        let lower_path = lower.join(&rel);

        if is_whiteout(&meta) {
            delete_lower_subtree(lower, upper, &rel, &mut deleted)?;
            continue;
        }
        if meta.is_dir() {
            if lower_path.is_dir() && is_opaque(entry.path()) {
                delete_lower_subtree(lower, upper, &rel, &mut deleted)?;
            } else if lower_path.is_file() {
                deleted.insert(rel);
            }
            continue;
        }
        if !meta.is_file() {
            continue;
        }

        let current = snapshot::fingerprint(entry.path())?;
        let kind = match lower_file(&lower_path)? {
            // Copied up for a metadata-only touch.
            Some(original) if original.hash == current.hash && original.mode == current.mode => {
                continue;
            }
            Some(_) => ChangeKind::Modified,
            None => {
                if lower_path.is_dir() {
                    delete_lower_subtree(lower, upper, &rel, &mut deleted)?;
                }
                ChangeKind::Added
            }
        };
        changes.push(snapshot::content_change(
            &rel,
            kind,
            &current,
            entry.path().to_path_buf(),
        ));
    }

    changes.extend(deleted.into_iter().map(FileChange::deleted));
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

#[async_trait]
impl Driver for OverlayDriver {
    fn name(&self) -> &str {
        OVERLAY_DRIVER
    }

    async fn mount(&self, sandbox: &Sandbox) -> Result<MountPaths, DriverError> {
        let storage = self.storage(sandbox);
        let sandbox = sandbox.clone();
        blocking(move || mount_blocking(storage, sandbox)).await
    }

    async fn unmount(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        let merged = self.storage(sandbox).join(MERGED_DIR);
        blocking(move || unmount_blocking(&merged, 0)).await?;
        info!("overlay unmounted (sandbox_id={})", sandbox.id);
        Ok(())
    }

    async fn cleanup(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        let storage = self.storage(sandbox);
        let id = sandbox.id;
        blocking(move || remove_storage(&storage, id)).await?;
        info!("overlay storage removed (sandbox_id={id})");
        Ok(())
    }

    async fn changed_files(&self, sandbox: &Sandbox) -> Result<Vec<FileChange>, DriverError> {
        let storage = self.storage(sandbox);
        let lower = lower_dir(&storage, sandbox);
        blocking(move || overlay_changes(&lower, &storage.join(UPPER_DIR))).await
    }

    async fn is_mounted(&self, sandbox: &Sandbox) -> Result<bool, DriverError> {
        let merged = self.storage(sandbox).join(MERGED_DIR);
        blocking(move || Ok(merged.is_dir() && is_mount_point(&merged)?)).await
    }

    async fn verify_mount_integrity(&self, sandbox: &Sandbox) -> Result<(), DriverError> {
        if !self.is_mounted(sandbox).await? {
            return Err(DriverError::NotMounted(sandbox.id));
        }
        let storage = self.storage(sandbox);
        for dir in [UPPER_DIR, WORK_DIR] {
            if !storage.join(dir).is_dir() {
                return Err(DriverError::Corrupt(format!(
                    "overlay {dir} layer missing for sandbox {}",
                    sandbox.id
                )));
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, DriverError> {
        self.verify_mount_integrity(sandbox).await?;
        let view = exec_view(sandbox, self.storage(sandbox).join(MERGED_DIR));
        exec::run(&view, cfg, command, args).await
    }

    async fn start_process(
        &self,
        sandbox: &Sandbox,
        cfg: &ExecConfig,
        command: &str,
        args: &[String],
    ) -> Result<u32, DriverError> {
        self.verify_mount_integrity(sandbox).await?;
        let view = exec_view(sandbox, self.storage(sandbox).join(MERGED_DIR));
        exec::start(&view, cfg, command, args)
    }

    async fn remove_from_upper(&self, sandbox: &Sandbox, path: &str) -> Result<(), DriverError> {
        let rel = scoped_path(path)?;
        if self.is_mounted(sandbox).await? {
            return Err(DriverError::Fatal(
                "unmount the sandbox before editing its upper layer".to_string(),
            ));
        }
        let target = self.storage(sandbox).join(UPPER_DIR).join(&rel);
        blocking(move || remove_path(&target)).await
    }

    async fn stored_sandboxes(&self) -> Result<Vec<Uuid>, DriverError> {
        let state_dir = self.state_dir.clone();
        blocking(move || stored_ids(&state_dir)).await
    }

    async fn remove_orphan(&self, id: Uuid) -> Result<(), DriverError> {
        let storage = SandboxStorage::new(&self.state_dir, id);
        blocking(move || remove_storage(&storage, id)).await?;
        info!("orphaned overlay storage removed (sandbox_id={id})");
        Ok(())
    }
}
