//! Observability tests for workflow tracing.
//!
//! Exercise the structured emitters and a full workflow run under a captured
//! subscriber.

use std::sync::Arc;

use patchflow_core::fakes::FakeVcs;
use patchflow_core::obs::{
    emit_dry_run, emit_stash_restore_failed, emit_step, emit_workflow_finished,
    emit_workflow_started, workflow_span,
};
use patchflow_core::{RollbackEngine, RollbackPlan};
use tracing::Instrument;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_workflow_started_and_finished() {
    emit_workflow_started("patch", "wf-123", false);
    emit_workflow_finished("patch", "wf-123", 1200, true);
}

#[traced_test]
#[test]
fn test_emit_step_inside_span() {
    let span = workflow_span("sync", "wf-456");
    span.in_scope(|| emit_step("sync.fetch"));
}

#[traced_test]
#[test]
fn test_emit_dry_run_action() {
    emit_dry_run("push branch fix/eof");
}

#[traced_test]
#[test]
fn test_emit_stash_restore_failed_warns() {
    let error = "CONFLICT (content): Merge conflict in src/lib.rs";
    emit_stash_restore_failed("patchflow-1234", &error);
}

#[traced_test]
#[tokio::test]
async fn test_instrumented_future_carries_span() {
    let span = workflow_span("release", "wf-789");
    async { emit_step("tag") }.instrument(span).await;
}

#[traced_test]
#[tokio::test]
async fn test_rollback_run_emits_lifecycle() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.add_commit("c1", Some("c0"), "first");
    vcs.set_local_head("main", "c1");

    let result = RollbackEngine::new(vcs.clone(), "patchflow")
        .rollback(RollbackPlan::last_commit(), false, true)
        .await
        .unwrap();

    assert!(result.dry_run);
    assert_eq!(result.planned, vec!["would reset --hard HEAD~1".to_string()]);
}
