//! Lexical scope normalization and conflict detection.
//!
//! Scopes are stored relative to their project root using `/` separators.
//! The whole project is represented as [`ROOT_SCOPE`].

use crate::ConflictRelation;
use std::path::{Component, Path};
use thiserror::Error;

/// Scope covering an entire project root.
pub const ROOT_SCOPE: &str = ".";

/// Errors produced while normalizing a scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The scope climbs above its project root.
    #[error("scope escapes project root: {0}")]
    Escapes(String),
    /// The scope contains a platform prefix (drive letter, UNC).
    #[error("scope has an unsupported prefix: {0}")]
    Prefix(String),
}

/// Normalize a scope lexically: drop `.` and duplicate separators, resolve
/// `..`, and strip a leading root so `/a/b` and `a/b` are the same scope.
pub fn normalize_scope(raw: &str) -> Result<String, ScopeError> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Prefix(_) => return Err(ScopeError::Prefix(raw.to_string())),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ScopeError::Escapes(raw.to_string()));
                }
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
        }
    }
    if parts.is_empty() {
        return Ok(ROOT_SCOPE.to_string());
    }
    Ok(parts.join("/"))
}

/// Relation of `existing` to `requested`, or `None` when they are disjoint.
/// Both inputs must already be normalized.
pub fn relation(existing: &str, requested: &str) -> Option<ConflictRelation> {
    let existing = segments(existing);
    let requested = segments(requested);
    if existing == requested {
        return Some(ConflictRelation::Equal);
    }
    if requested.starts_with(&existing) {
        return Some(ConflictRelation::Ancestor);
    }
    if existing.starts_with(&requested) {
        return Some(ConflictRelation::Descendant);
    }
    None
}

/// Whether `scope` equals or lies beneath `prefix` (both normalized).
pub fn is_within(scope: &str, prefix: &str) -> bool {
    segments(scope).starts_with(&segments(prefix))
}

fn segments(scope: &str) -> Vec<String> {
    if scope == ROOT_SCOPE {
        return Vec::new();
    }
    scope.split('/').map(fold_case).collect()
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn fold_case(segment: &str) -> String {
    segment.to_lowercase()
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn fold_case(segment: &str) -> String {
    segment.to_string()
}

#[cfg(test)]
mod tests {
    use super::{ROOT_SCOPE, ScopeError, is_within, normalize_scope, relation};
    use crate::ConflictRelation;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_dots_and_separators() {
        assert_eq!(normalize_scope("a//b/./c").as_deref(), Ok("a/b/c"));
        assert_eq!(normalize_scope("/a/b/../b/./c").as_deref(), Ok("a/b/c"));
        assert_eq!(normalize_scope("./").as_deref(), Ok(ROOT_SCOPE));
        assert_eq!(normalize_scope("").as_deref(), Ok(ROOT_SCOPE));
    }

    #[test]
    fn rejects_escaping_scopes() {
        assert_eq!(
            normalize_scope("a/../../etc"),
            Err(ScopeError::Escapes("a/../../etc".to_string()))
        );
    }

    #[test]
    fn detects_equal_ancestor_and_descendant() {
        assert_eq!(relation("a/b", "a/b"), Some(ConflictRelation::Equal));
        assert_eq!(relation("a", "a/b"), Some(ConflictRelation::Ancestor));
        assert_eq!(relation("a/b/c", "a/b"), Some(ConflictRelation::Descendant));
        assert_eq!(relation(ROOT_SCOPE, "a"), Some(ConflictRelation::Ancestor));
        assert_eq!(relation("a/bc", "a/b"), None);
        assert_eq!(relation("x", "a/b"), None);
    }

    #[test]
    fn prefix_matching_respects_segments() {
        assert!(is_within("src/util", "src"));
        assert!(is_within("src", ROOT_SCOPE));
        assert!(!is_within("srcs", "src"));
    }
}
