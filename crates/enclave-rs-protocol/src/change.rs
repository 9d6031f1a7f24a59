//! Change-set and conflict value types.

use crate::{SandboxId, SandboxStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a path diverges from the lower layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A single file that differs between the upper and lower layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the sandbox scope, `/`-separated.
    pub path: String,
    pub kind: ChangeKind,
    /// Size in bytes for added/modified entries, zero for deletions.
    pub size: u64,
    /// Hex SHA-256 of the new content for added/modified entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Unix permission bits of the new content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Location of the new content inside driver storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl FileChange {
    /// Build a deletion entry.
    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            size: 0,
            hash: None,
            mode: None,
            source: None,
        }
    }
}

/// Relation of an existing scope to the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRelation {
    /// Same scope after normalization.
    Equal,
    /// Existing scope contains the requested one.
    Ancestor,
    /// Existing scope lies inside the requested one.
    Descendant,
}

/// A live sandbox whose scope conflicts with a requested scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    pub sandbox_id: SandboxId,
    pub scope_path: String,
    pub status: SandboxStatus,
    pub relation: ConflictRelation,
}
