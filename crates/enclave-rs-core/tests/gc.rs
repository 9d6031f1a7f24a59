mod common;

use chrono::{Duration, Utc};
use common::Harness;
use enclave_rs_core::{GcLoop, GcService, RequestContext};
use enclave_rs_protocol::{
    EventType, GcPolicy, GcReason, GcRequest, RejectRequest, Sandbox, SandboxStatus,
};
use enclave_rs_store::SandboxStore;
use enclave_rs_test_utils::{DriverOp, Fault};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn seed(harness: &Harness, scope: &str, status: SandboxStatus, age_hours: i64) -> Sandbox {
    let mut sandbox = Sandbox::new(scope, harness.tree.root(), "alice", "copy");
    let at = Utc::now() - Duration::hours(age_hours);
    sandbox.status = status;
    sandbox.created_at = at;
    sandbox.last_used_at = at;
    if status.is_terminal() || status == SandboxStatus::Stopped {
        sandbox.stopped_at = Some(at);
    }
    harness.repo.create(&sandbox).expect("seed record");
    sandbox
}

fn request(policy: GcPolicy, dry_run: bool) -> GcRequest {
    GcRequest {
        policy: Some(policy),
        dry_run,
        limit: None,
        actor: "ops".to_string(),
    }
}

#[tokio::test]
async fn live_records_are_never_collected() {
    let harness = Harness::new();
    let active = harness.create("live", "alice").await;
    let _creating = seed(&harness, "pending", SandboxStatus::Creating, 48);
    let _stopping = seed(&harness, "halting", SandboxStatus::Stopping, 48);
    let stopped = seed(&harness, "parked", SandboxStatus::Stopped, 48);

    let policy = GcPolicy {
        max_age: Some(0),
        idle_timeout: Some(0),
        ..GcPolicy::default()
    };
    let result = harness
        .gc
        .run(&RequestContext::new(), request(policy, false))
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![stopped.id]);
    assert_eq!(
        result.reasons[&stopped.id],
        vec![GcReason::MaxAge, GcReason::IdleTimeout]
    );
    assert_eq!(harness.all().len(), 3);
    assert_eq!(harness.get(active.id).status, SandboxStatus::Active);
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let harness = Harness::new();
    let old = seed(&harness, "old", SandboxStatus::Rejected, 30);
    let policy = GcPolicy {
        max_age: Some(3600),
        include_terminal: true,
        terminal_delay: Some(60),
        ..GcPolicy::default()
    };

    let result = harness
        .gc
        .run(&RequestContext::new(), request(policy, true))
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![old.id]);
    assert_eq!(
        result.reasons[&old.id],
        vec![GcReason::MaxAge, GcReason::TerminalDelay]
    );
    assert_eq!(harness.all().len(), 1);
    assert_eq!(harness.driver.calls(DriverOp::Cleanup), 0);
    assert!(harness.event_types(old.id).is_empty());
}

#[tokio::test]
async fn cleanup_failure_is_a_soft_error() {
    let harness = Harness::new();
    let doomed = seed(&harness, "doomed", SandboxStatus::Error, 10);
    harness.driver.fail_next(DriverOp::Cleanup, Fault::Fatal);

    let result = harness
        .gc
        .run(
            &RequestContext::new(),
            request(
                GcPolicy {
                    max_age: Some(60),
                    ..GcPolicy::default()
                },
                false,
            ),
        )
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![doomed.id]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].sandbox_id, doomed.id);
    assert!(harness.all().is_empty());
    assert_eq!(
        harness.event_types(doomed.id),
        vec![EventType::SandboxGcCollected, EventType::DriverError]
    );
}

#[tokio::test]
async fn limit_bounds_each_run() {
    let harness = Harness::new();
    for (index, scope) in ["a", "b", "c"].iter().enumerate() {
        seed(&harness, scope, SandboxStatus::Rejected, 10 + index as i64);
    }
    let mut gc_request = request(
        GcPolicy {
            max_age: Some(60),
            ..GcPolicy::default()
        },
        false,
    );
    gc_request.limit = Some(2);
    let result = harness
        .gc
        .run(&RequestContext::new(), gc_request)
        .await
        .expect("gc");
    assert_eq!(result.collected.len(), 2);
    assert_eq!(harness.all().len(), 1);
    assert_eq!(harness.all()[0].scope_path, "a");
}

#[tokio::test]
async fn status_allow_list_narrows_candidates() {
    let harness = Harness::new();
    let rejected = seed(&harness, "r", SandboxStatus::Rejected, 10);
    let _errored = seed(&harness, "e", SandboxStatus::Error, 10);
    let policy = GcPolicy {
        max_age: Some(60),
        statuses: Some(vec![SandboxStatus::Rejected]),
        ..GcPolicy::default()
    };
    let result = harness
        .gc
        .run(&RequestContext::new(), request(policy, true))
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![rejected.id]);
}

#[tokio::test]
async fn size_cap_adds_to_time_based_picks() {
    let harness = Harness::new();
    let mut big = seed(&harness, "big", SandboxStatus::Approved, 5);
    big.size_bytes = 100;
    big.version += 1;
    harness
        .repo
        .update_with_version_check(&big, 1)
        .expect("size update");
    let mut small = seed(&harness, "small", SandboxStatus::Rejected, 1);
    small.size_bytes = 50;
    small.version += 1;
    harness
        .repo
        .update_with_version_check(&small, 1)
        .expect("size update");

    let policy = GcPolicy {
        max_age: Some(3 * 3600),
        max_total_size_bytes: Some(60),
        ..GcPolicy::default()
    };
    let result = harness
        .gc
        .run(&RequestContext::new(), request(policy, true))
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![big.id]);
    assert_eq!(
        result.reasons[&big.id],
        vec![GcReason::MaxAge, GcReason::SizeCap]
    );
    assert_eq!(result.total_bytes_reclaimed, 100);
}

#[tokio::test]
async fn size_cap_reason_stops_once_target_is_met() {
    let harness = Harness::new();
    let sized = |scope: &str, age_hours: i64, bytes: u64| {
        let mut sandbox = seed(&harness, scope, SandboxStatus::Approved, age_hours);
        sandbox.size_bytes = bytes;
        sandbox.version += 1;
        harness
            .repo
            .update_with_version_check(&sandbox, 1)
            .expect("size update");
        sandbox
    };
    let oldest = sized("oldest", 6, 100);
    let older = sized("older", 5, 30);
    let fresh = sized("fresh", 1, 20);

    let policy = GcPolicy {
        max_age: Some(3 * 3600),
        max_total_size_bytes: Some(100),
        ..GcPolicy::default()
    };
    let result = harness
        .gc
        .run(&RequestContext::new(), request(policy, true))
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![oldest.id, older.id]);
    assert_eq!(
        result.reasons[&oldest.id],
        vec![GcReason::MaxAge, GcReason::SizeCap]
    );
    assert_eq!(result.reasons[&older.id], vec![GcReason::MaxAge]);
    assert!(!result.reasons.contains_key(&fresh.id));
}

#[tokio::test]
async fn rejected_sandbox_storage_is_released() {
    let harness = Harness::new();
    let sandbox = harness.create("src", "alice").await;
    harness
        .service
        .reject(&RequestContext::new(), RejectRequest::new(sandbox.id, "alice"))
        .await
        .expect("reject");

    let result = harness
        .gc
        .run(
            &RequestContext::new(),
            request(
                GcPolicy {
                    include_terminal: true,
                    terminal_delay: Some(0),
                    ..GcPolicy::default()
                },
                false,
            ),
        )
        .await
        .expect("gc");
    assert_eq!(result.collected, vec![sandbox.id]);
    assert_eq!(harness.driver.calls(DriverOp::Cleanup), 1);
    let events = harness.events(sandbox.id);
    let collected = events.last().expect("event");
    assert_eq!(collected.event_type, EventType::SandboxGcCollected);
    assert_eq!(collected.actor, "ops");
    assert_eq!(collected.details["reasons"], serde_json::json!(["terminal_delay"]));
}

#[tokio::test]
async fn gc_loop_collects_on_tick_and_stops_on_shutdown() {
    let harness = Harness::new();
    let old = seed(&harness, "old", SandboxStatus::Error, 48);
    let service = Arc::new(GcService::new(
        harness.repo.clone(),
        Arc::new(enclave_rs_driver::DriverRegistry::new(harness.driver.clone())),
        harness.gc.config().clone(),
    ));
    let shutdown = CancellationToken::new();
    let handle = GcLoop::new(service)
        .with_interval(std::time::Duration::from_millis(10))
        .spawn(shutdown.clone());

    for _ in 0..100 {
        if harness.all().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.expect("loop joins");
    assert!(harness.all().iter().all(|sandbox| sandbox.id != old.id));
}
