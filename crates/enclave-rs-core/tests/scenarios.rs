mod common;

use chrono::{Duration, Utc};
use common::{Harness, merged};
use enclave_rs_core::{EnclaveError, RequestContext};
use enclave_rs_protocol::{
    ApproveRequest, ChangeKind, ErrorCode, EventType, GcPolicy, GcRequest, RejectRequest, Sandbox,
    SandboxStatus, StopSandboxRequest,
};
use enclave_rs_store::SandboxStore;
use enclave_rs_test_utils::{DriverOp, Fault, ProjectTree, read_file, write_file};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn create_then_approve_applies_new_file() {
    let harness = Harness::new();
    let sandbox = harness.create("src", "alice").await;
    assert_eq!(sandbox.status, SandboxStatus::Active);
    assert_eq!(sandbox.version, 2);

    write_file(&merged(&sandbox), "new.txt", "hi");
    let result = harness
        .service
        .approve(&RequestContext::new(), ApproveRequest::new(sandbox.id, "alice"))
        .await
        .expect("approve");

    assert_eq!(result.files_applied, 1);
    assert_eq!(result.sandbox.status, SandboxStatus::Approved);
    assert!(result.sandbox.approved_at.is_some());
    assert_eq!(result.sandbox.size_bytes, 2);
    assert_eq!(
        read_file(&harness.tree.root(), "src/new.txt").as_deref(),
        Some("hi")
    );
    assert_eq!(
        harness.event_types(sandbox.id),
        vec![
            EventType::SandboxCreated,
            EventType::SandboxMounted,
            EventType::SandboxStopped,
            EventType::SandboxApproved,
        ]
    );
}

#[tokio::test]
async fn overlapping_scope_is_refused_without_side_effects() {
    let harness = Harness::new();
    let first = harness.create("src", "alice").await;

    let err = harness
        .service
        .create(&RequestContext::new(), harness.request("src/util", "bob"))
        .await
        .expect_err("overlap refused");

    assert_eq!(err.code(), ErrorCode::ScopeConflict);
    match err {
        EnclaveError::ScopeConflict { conflicts, .. } => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].sandbox_id, first.id);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.all().len(), 1);
    let stats = harness.service.stats(&RequestContext::new()).expect("stats");
    assert_eq!(stats.count, 1);
    assert_eq!(harness.event_types(first.id).len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_alias_conflicts_with_its_target() {
    let harness = Harness::with_tree(ProjectTree::new().with_files(&[("inside/a.txt", "a")]));
    let root = harness.tree.root();
    std::os::unix::fs::symlink(root.join("inside"), root.join("alias")).expect("alias");

    let first = harness.create("alias", "alice").await;
    assert_eq!(first.scope_path, "inside");

    let err = harness
        .service
        .create(&RequestContext::new(), harness.request("inside", "bob"))
        .await
        .expect_err("same directory");
    assert_eq!(err.code(), ErrorCode::ScopeConflict);
    assert_eq!(harness.all().len(), 1);
}

#[tokio::test]
async fn idempotent_create_returns_original_record() {
    let harness = Harness::new();
    let ctx = RequestContext::new();
    let first = harness
        .service
        .create(&ctx, harness.request("x", "alice").with_idempotency_key("K"))
        .await
        .expect("first create");
    let second = harness
        .service
        .create(&ctx, harness.request("y", "alice").with_idempotency_key("K"))
        .await
        .expect("second create");

    assert_eq!(second.id, first.id);
    assert_eq!(second.scope_path, "x");
    assert_eq!(harness.all().len(), 1);
    assert_eq!(harness.driver.calls(DriverOp::Mount), 1);
}

fn finished(harness: &Harness, scope: &str, size: u64, age_hours: i64) -> Sandbox {
    let mut sandbox = Sandbox::new(scope, harness.tree.root(), "alice", "copy");
    let at = Utc::now() - Duration::hours(age_hours);
    sandbox.status = SandboxStatus::Rejected;
    sandbox.size_bytes = size;
    sandbox.created_at = at;
    sandbox.last_used_at = at;
    sandbox.stopped_at = Some(at);
    harness.repo.create(&sandbox).expect("seed record");
    sandbox
}

#[tokio::test]
async fn size_cap_dry_run_selects_oldest_first() {
    let harness = Harness::new();
    let oldest = finished(&harness, "a", 10, 3);
    let middle = finished(&harness, "b", 20, 2);
    let _newest = finished(&harness, "c", 40, 1);

    let result = harness
        .gc
        .run(
            &RequestContext::new(),
            GcRequest {
                policy: Some(GcPolicy {
                    max_total_size_bytes: Some(30),
                    ..GcPolicy::default()
                }),
                dry_run: true,
                limit: Some(10),
                actor: "ops".to_string(),
            },
        )
        .await
        .expect("gc");

    assert!(result.dry_run);
    assert_eq!(result.collected, vec![oldest.id, middle.id]);
    assert_eq!(result.total_bytes_reclaimed, 30);
    assert_eq!(harness.all().len(), 3);
    assert_eq!(harness.driver.calls(DriverOp::Cleanup), 0);
    assert!(harness.event_types(oldest.id).is_empty());
}

#[tokio::test]
async fn reject_keeps_changes_until_collected() {
    let harness = Harness::with_tree(ProjectTree::new().with_files(&[("lib/a.txt", "old")]));
    let ctx = RequestContext::new();
    let sandbox = harness.create("lib", "bob").await;
    write_file(&merged(&sandbox), "a.txt", "new");
    harness
        .service
        .stop(
            &ctx,
            StopSandboxRequest {
                id: sandbox.id,
                actor: None,
            },
        )
        .await
        .expect("stop");

    let rejected = harness
        .service
        .reject(&ctx, RejectRequest::new(sandbox.id, "bob"))
        .await
        .expect("reject");
    assert_eq!(rejected.status, SandboxStatus::Rejected);
    assert_eq!(read_file(&harness.tree.root(), "lib/a.txt").as_deref(), Some("old"));

    let changes = harness.service.changes(&ctx, sandbox.id).await.expect("changes");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, "a.txt");
    assert_eq!(changes[0].kind, ChangeKind::Modified);

    let result = harness
        .gc
        .run(
            &ctx,
            GcRequest {
                policy: Some(GcPolicy {
                    include_terminal: true,
                    terminal_delay: Some(0),
                    ..GcPolicy::default()
                }),
                dry_run: false,
                limit: None,
                actor: "ops".to_string(),
            },
        )
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![sandbox.id]);
    assert!(result.errors.is_empty());
    assert!(harness.all().is_empty());
    assert!(!merged(&sandbox).exists());
    assert_eq!(
        harness.event_types(sandbox.id).last(),
        Some(&EventType::SandboxGcCollected)
    );
}

#[tokio::test]
async fn fatal_mount_failure_leaves_error_record() {
    let harness = Harness::new();
    harness.driver.fail_next(DriverOp::Mount, Fault::Fatal);

    let err = harness
        .service
        .create(&RequestContext::new(), harness.request("src", "alice"))
        .await
        .expect_err("mount fails");
    assert_eq!(err.code(), ErrorCode::Internal);
    let record = err.to_record();
    assert!(record.details.is_some());

    let records = harness.all();
    assert_eq!(records.len(), 1);
    let sandbox = &records[0];
    assert_eq!(sandbox.status, SandboxStatus::Error);
    assert!(sandbox.mount_paths.is_none());
    let failure = sandbox.error.as_ref().expect("failure recorded");
    assert_eq!(failure.operation, "mount");
    assert_eq!(
        harness.event_types(sandbox.id),
        vec![EventType::SandboxCreated, EventType::SandboxError]
    );
}
