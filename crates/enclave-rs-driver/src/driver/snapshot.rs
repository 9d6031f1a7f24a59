//! Content fingerprints and tree manifests.
//!
//! Only regular files take part in change sets. Symlinks are copied into
//! views but never reported.

use crate::error::DriverError;
use enclave_rs_protocol::{ChangeKind, FileChange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Size, permission bits, and SHA-256 of one regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Fingerprint {
    pub(crate) size: u64,
    pub(crate) mode: u32,
    pub(crate) hash: String,
}

/// Regular files of a tree keyed by `/`-separated relative path.
pub(crate) type Manifest = BTreeMap<String, Fingerprint>;

/// Hex SHA-256 of a file's content and its length.
pub(crate) fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

pub(crate) fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let meta = fs::metadata(path)?;
    let (hash, size) = hash_file(path)?;
    Ok(Fingerprint {
        size,
        mode: file_mode(&meta),
        hash,
    })
}

#[cfg(unix)]
pub(crate) fn file_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Relative `/`-separated form of `path` under `root`.
pub(crate) fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub(crate) fn walk_error(err: walkdir::Error) -> DriverError {
    match err.into_io_error() {
        Some(err) => DriverError::Io(err),
        None => DriverError::Fatal("filesystem loop while walking sandbox tree".to_string()),
    }
}

/// Fingerprint every regular file below `root`.
pub(crate) fn scan_tree(root: &Path) -> Result<Manifest, DriverError> {
    let mut manifest = Manifest::new();
    if !root.is_dir() {
        return Ok(manifest);
    }
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = relative(root, entry.path()) {
            manifest.insert(rel, fingerprint(entry.path())?);
        }
    }
    Ok(manifest)
}

/// Copy `src` into `dst` (directories, regular files, symlinks) and return
/// the manifest of the copy.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<Manifest, DriverError> {
    fs::create_dir_all(dst)?;
    let mut manifest = Manifest::new();
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(walk_error)?;
        let Some(rel) = relative(src, entry.path()) else {
            continue;
        };
        let target = dst.join(&rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            manifest.insert(rel, fingerprint(&target)?);
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(manifest)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link: PathBuf = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Ok(())
}

/// Changes that turn `before` into the current content of `tree`.
pub(crate) fn diff_against(before: &Manifest, tree: &Path) -> Result<Vec<FileChange>, DriverError> {
    let after = scan_tree(tree)?;
    let mut changes = Vec::new();
    for (path, current) in &after {
        let kind = match before.get(path) {
            None => ChangeKind::Added,
            Some(old) if old.hash != current.hash || old.mode != current.mode => {
                ChangeKind::Modified
            }
            Some(_) => continue,
        };
        changes.push(content_change(path, kind, current, tree.join(path)));
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changes.push(FileChange::deleted(path.clone()));
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

pub(crate) fn content_change(
    path: &str,
    kind: ChangeKind,
    fingerprint: &Fingerprint,
    source: PathBuf,
) -> FileChange {
    FileChange {
        path: path.to_string(),
        kind,
        size: fingerprint.size,
        hash: Some(fingerprint.hash.clone()),
        mode: Some(fingerprint.mode),
        source: Some(source),
    }
}
