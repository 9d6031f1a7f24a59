//! Auto-approval policy evaluation.

use crate::error::EnclaveError;
use enclave_rs_protocol::{ApprovalPolicy, ChangeKind, FileChange};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Outcome of evaluating a change set against an approval policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Decide whether `changes` may be approved without a manual override.
///
/// Fails only when a forbidden pattern is not a valid glob.
pub fn evaluate(
    changes: &[FileChange],
    policy: &ApprovalPolicy,
) -> Result<PolicyDecision, EnclaveError> {
    if policy.require_manual {
        return Ok(PolicyDecision::Deny(
            "policy requires manual approval".to_string(),
        ));
    }
    if let Some(max_files) = policy.max_files
        && changes.len() > max_files
    {
        return Ok(PolicyDecision::Deny(format!(
            "{} changed files exceed the limit of {max_files}",
            changes.len()
        )));
    }
    if let Some(max_bytes) = policy.max_total_bytes {
        let total: u64 = changes.iter().map(|change| change.size).sum();
        if total > max_bytes {
            return Ok(PolicyDecision::Deny(format!(
                "{total} changed bytes exceed the limit of {max_bytes}"
            )));
        }
    }
    if !policy.allow_deletions
        && let Some(deleted) = changes
            .iter()
            .find(|change| change.kind == ChangeKind::Deleted)
    {
        return Ok(PolicyDecision::Deny(format!(
            "deletion of {} is not allowed",
            deleted.path
        )));
    }
    if !policy.forbidden_path_patterns.is_empty() {
        let forbidden = compile(&policy.forbidden_path_patterns)?;
        if let Some(hit) = changes.iter().find(|change| forbidden.is_match(&change.path)) {
            return Ok(PolicyDecision::Deny(format!(
                "{} matches a forbidden path pattern",
                hit.path
            )));
        }
    }
    Ok(PolicyDecision::Allow)
}

/// `*` stays within one path segment; `**` crosses segments.
fn compile(patterns: &[String]) -> Result<GlobSet, EnclaveError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| EnclaveError::InvalidArgs(format!("pattern {pattern}: {err}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| EnclaveError::InvalidArgs(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{PolicyDecision, evaluate};
    use enclave_rs_protocol::{ApprovalPolicy, ChangeKind, FileChange};
    use pretty_assertions::assert_eq;

    fn added(path: &str, size: u64) -> FileChange {
        FileChange {
            path: path.to_string(),
            kind: ChangeKind::Added,
            size,
            hash: None,
            mode: None,
            source: None,
        }
    }

    #[test]
    fn empty_policy_allows_everything() {
        let changes = vec![added("a.txt", 10), FileChange::deleted("b.txt")];
        let decision = evaluate(&changes, &ApprovalPolicy::default()).expect("evaluate");
        assert_eq!(decision, PolicyDecision::Allow);
    }

    #[test]
    fn limits_on_count_and_size() {
        let changes = vec![added("a", 10), added("b", 10)];
        let by_count = ApprovalPolicy {
            max_files: Some(1),
            ..ApprovalPolicy::default()
        };
        assert!(!evaluate(&changes, &by_count).expect("evaluate").is_allowed());
        let by_size = ApprovalPolicy {
            max_total_bytes: Some(19),
            ..ApprovalPolicy::default()
        };
        assert!(!evaluate(&changes, &by_size).expect("evaluate").is_allowed());
        let roomy = ApprovalPolicy {
            max_files: Some(2),
            max_total_bytes: Some(20),
            ..ApprovalPolicy::default()
        };
        assert!(evaluate(&changes, &roomy).expect("evaluate").is_allowed());
    }

    #[test]
    fn deletions_and_manual_requirement() {
        let changes = vec![FileChange::deleted("old.rs")];
        let no_deletes = ApprovalPolicy {
            allow_deletions: false,
            ..ApprovalPolicy::default()
        };
        assert!(!evaluate(&changes, &no_deletes).expect("evaluate").is_allowed());
        let manual = ApprovalPolicy {
            require_manual: true,
            ..ApprovalPolicy::default()
        };
        assert!(!evaluate(&[], &manual).expect("evaluate").is_allowed());
    }

    #[test]
    fn forbidden_patterns_honour_double_star() {
        let policy = ApprovalPolicy {
            forbidden_path_patterns: vec!["**/*.pem".to_string(), "*.env".to_string()],
            ..ApprovalPolicy::default()
        };
        let deep = vec![added("certs/prod/server.pem", 1)];
        assert!(!evaluate(&deep, &policy).expect("evaluate").is_allowed());
        let top = vec![added("server.pem", 1)];
        assert!(!evaluate(&top, &policy).expect("evaluate").is_allowed());
        let nested_env = vec![added("config/.env", 1)];
        assert!(evaluate(&nested_env, &policy).expect("evaluate").is_allowed());
        let root_env = vec![added("prod.env", 1)];
        assert!(!evaluate(&root_env, &policy).expect("evaluate").is_allowed());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let policy = ApprovalPolicy {
            forbidden_path_patterns: vec!["[".to_string()],
            ..ApprovalPolicy::default()
        };
        assert!(evaluate(&[added("a", 1)], &policy).is_err());
    }
}
