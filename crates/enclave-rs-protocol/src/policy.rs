//! Garbage-collection and approval policy records.

use crate::{Sandbox, SandboxStatus};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Criterion that made a sandbox eligible for collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcReason {
    MaxAge,
    IdleTimeout,
    TerminalDelay,
    SizeCap,
    /// Explicit delete requested by a caller.
    Manual,
}

/// GC selection policy. Durations are whole seconds; criteria combine with OR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Collect records created more than this many seconds ago.
    #[serde(default)]
    pub max_age: Option<u64>,
    /// Collect records whose `last_used_at` is older than this.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    /// Consider approved/rejected records against `terminal_delay`.
    #[serde(default)]
    pub include_terminal: bool,
    #[serde(default)]
    pub terminal_delay: Option<u64>,
    /// Aggregate size cap, enforced by the GC service oldest-first.
    #[serde(default)]
    pub max_total_size_bytes: Option<u64>,
    /// Optional allow-list of statuses eligible at all.
    #[serde(default)]
    pub statuses: Option<Vec<SandboxStatus>>,
}

impl GcPolicy {
    /// Whether a record in `status` may be collected under this policy.
    pub fn status_eligible(&self, status: SandboxStatus) -> bool {
        if matches!(
            status,
            SandboxStatus::Creating | SandboxStatus::Active | SandboxStatus::Stopping
        ) {
            return false;
        }
        self.statuses
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&status))
    }

    /// Every time-based criterion the sandbox matches, paired with the
    /// timestamp that criterion measured, in evaluation order.
    pub fn matched_criteria(
        &self,
        sandbox: &Sandbox,
        now: DateTime<Utc>,
    ) -> Vec<(GcReason, DateTime<Utc>)> {
        let mut matched = Vec::new();
        if !self.status_eligible(sandbox.status) {
            return matched;
        }
        if let Some(cutoff) = self.max_age.and_then(|secs| cutoff(now, secs))
            && sandbox.created_at <= cutoff
        {
            matched.push((GcReason::MaxAge, sandbox.created_at));
        }
        if let Some(cutoff) = self.idle_timeout.and_then(|secs| cutoff(now, secs))
            && sandbox.last_used_at <= cutoff
        {
            matched.push((GcReason::IdleTimeout, sandbox.last_used_at));
        }
        if self.include_terminal
            && let Some(finished_at) = terminal_timestamp(sandbox)
            && let Some(cutoff) = cutoff(now, self.terminal_delay.unwrap_or(0))
            && finished_at <= cutoff
        {
            matched.push((GcReason::TerminalDelay, finished_at));
        }
        matched
    }

    /// Reasons only, without timestamps.
    pub fn reasons(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> Vec<GcReason> {
        self.matched_criteria(sandbox, now)
            .into_iter()
            .map(|(reason, _)| reason)
            .collect()
    }
}

fn cutoff(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    now.checked_sub_signed(TimeDelta::try_seconds(secs)?)
}

fn terminal_timestamp(sandbox: &Sandbox) -> Option<DateTime<Utc>> {
    match sandbox.status {
        SandboxStatus::Approved => sandbox.approved_at.or(sandbox.stopped_at),
        SandboxStatus::Rejected => sandbox.stopped_at,
        _ => None,
    }
}

/// Auto-approval policy evaluated against a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
    /// Globs (with `**`) matched against scope-relative change paths.
    #[serde(default)]
    pub forbidden_path_patterns: Vec<String>,
    #[serde(default = "default_allow_deletions")]
    pub allow_deletions: bool,
    /// Always deny auto-approval; a manual override is required.
    #[serde(default)]
    pub require_manual: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            max_files: None,
            max_total_bytes: None,
            forbidden_path_patterns: Vec::new(),
            allow_deletions: default_allow_deletions(),
            require_manual: false,
        }
    }
}

fn default_allow_deletions() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{ApprovalPolicy, GcPolicy, GcReason};
    use crate::{Sandbox, SandboxStatus};
    use chrono::{TimeDelta, Utc};
    use pretty_assertions::assert_eq;

    fn sandbox_aged(status: SandboxStatus, hours: i64) -> Sandbox {
        let mut sandbox = Sandbox::new("src", "/p", "alice", "copy");
        let at = Utc::now() - TimeDelta::hours(hours);
        sandbox.status = status;
        sandbox.created_at = at;
        sandbox.last_used_at = at;
        sandbox.stopped_at = Some(at);
        if status == SandboxStatus::Approved {
            sandbox.approved_at = Some(at);
        }
        sandbox
    }

    #[test]
    fn live_statuses_are_never_eligible() {
        let policy = GcPolicy {
            max_age: Some(0),
            ..GcPolicy::default()
        };
        for status in [
            SandboxStatus::Creating,
            SandboxStatus::Active,
            SandboxStatus::Stopping,
        ] {
            let sandbox = sandbox_aged(status, 48);
            assert!(policy.reasons(&sandbox, Utc::now()).is_empty());
        }
    }

    #[test]
    fn reports_every_matching_criterion() {
        let policy = GcPolicy {
            max_age: Some(3600),
            idle_timeout: Some(3600),
            include_terminal: true,
            terminal_delay: Some(60),
            ..GcPolicy::default()
        };
        let sandbox = sandbox_aged(SandboxStatus::Rejected, 5);
        assert_eq!(
            policy.reasons(&sandbox, Utc::now()),
            vec![
                GcReason::MaxAge,
                GcReason::IdleTimeout,
                GcReason::TerminalDelay
            ]
        );
    }

    #[test]
    fn status_allow_list_restricts_candidates() {
        let policy = GcPolicy {
            max_age: Some(60),
            statuses: Some(vec![SandboxStatus::Rejected]),
            ..GcPolicy::default()
        };
        let approved = sandbox_aged(SandboxStatus::Approved, 2);
        let rejected = sandbox_aged(SandboxStatus::Rejected, 2);
        assert!(policy.reasons(&approved, Utc::now()).is_empty());
        assert_eq!(policy.reasons(&rejected, Utc::now()), vec![GcReason::MaxAge]);
    }

    #[test]
    fn terminal_delay_ignores_stopped_records() {
        let policy = GcPolicy {
            include_terminal: true,
            terminal_delay: Some(0),
            ..GcPolicy::default()
        };
        let stopped = sandbox_aged(SandboxStatus::Stopped, 2);
        assert!(policy.reasons(&stopped, Utc::now()).is_empty());
    }

    #[test]
    fn approval_policy_defaults_allow_deletions() {
        let policy: ApprovalPolicy = serde_json::from_str("{}").expect("policy");
        assert_eq!(policy, ApprovalPolicy::default());
        assert!(policy.allow_deletions);
        assert!(!policy.require_manual);
    }
}
