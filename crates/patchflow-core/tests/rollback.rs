//! Rollback validation, dry runs and dispatch.

use std::sync::Arc;

use patchflow_core::fakes::FakeVcs;
use patchflow_core::{RollbackEngine, RollbackPlan, RollbackType, WorkflowError};

/// `main` at `c2` → `c1` → `c0`.
fn repo() -> Arc<FakeVcs> {
    let vcs = Arc::new(FakeVcs::new());
    vcs.add_commit("c1", Some("c0"), "first");
    vcs.add_commit("c2", Some("c1"), "second");
    vcs.set_local_head("main", "c2");
    vcs
}

fn engine(vcs: &Arc<FakeVcs>) -> RollbackEngine {
    RollbackEngine::new(vcs.clone(), "patchflow")
}

#[tokio::test]
async fn specific_commit_requires_target() {
    let vcs = repo();
    let plan = RollbackPlan::new(RollbackType::SpecificCommit, None);
    let err = engine(&vcs).rollback(plan, true, false).await.unwrap_err();
    assert!(matches!(err, WorkflowError::MissingParameter(_)));
    assert!(vcs.calls().is_empty());
}

#[tokio::test]
async fn unknown_commit_is_rejected_before_mutation() {
    let vcs = repo();
    let err = engine(&vcs)
        .rollback(RollbackPlan::specific_commit("deadbeef"), true, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::InvalidCommitHash { ref reference } if reference == "deadbeef"
    ));
    assert!(vcs.mutating_calls().is_empty());
    assert!(vcs.local_tag_names().is_empty());
}

#[tokio::test]
async fn last_commit_on_root_is_invalid() {
    let vcs = Arc::new(FakeVcs::new());
    let err = engine(&vcs)
        .rollback(RollbackPlan::last_commit(), false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidCommitHash { .. }));
    assert!(vcs.mutating_calls().is_empty());
}

#[tokio::test]
async fn dry_run_never_mutates() {
    let plans = [
        RollbackPlan::last_commit(),
        RollbackPlan::previous_branch(),
        RollbackPlan::specific_commit("c0"),
    ];
    for plan in plans {
        let vcs = repo();
        vcs.write_file("wip.txt", "draft");
        let kind = plan.kind;

        let result = engine(&vcs).rollback(plan, true, true).await.unwrap();

        assert!(result.dry_run, "{kind}");
        assert!(vcs.mutating_calls().is_empty(), "{kind}: {:?}", vcs.mutating_calls());
        assert!(result.backup.is_none());
        assert!(result.stash.is_none());
        assert_eq!(result.planned.len(), 3, "{kind}: {:?}", result.planned);
        assert!(result.planned[0].starts_with("would create backup tag backup/rollback-"));
        assert_eq!(result.planned[1], "would stash uncommitted changes");
        assert_eq!(vcs.head_of("main").as_deref(), Some("c2"));
    }
}

#[tokio::test]
async fn last_commit_resets_and_tags_backup() {
    let vcs = repo();
    let result = engine(&vcs)
        .rollback(RollbackPlan::last_commit(), true, false)
        .await
        .unwrap();

    assert_eq!(result.previous_head.as_deref(), Some("c2"));
    assert_eq!(result.new_head.as_deref(), Some("c1"));
    assert_eq!(vcs.head_of("main").as_deref(), Some("c1"));

    let backup = result.backup.clone().unwrap();
    assert!(backup.starts_with("backup/rollback-"));
    assert_eq!(result.plan.backup, Some(backup.clone()));
    assert_eq!(vcs.local_tag_names(), vec![backup]);
}

#[tokio::test]
async fn specific_commit_resets_to_target() {
    let vcs = repo();
    let result = engine(&vcs)
        .rollback(RollbackPlan::specific_commit("c0"), false, false)
        .await
        .unwrap();
    assert_eq!(result.new_head.as_deref(), Some("c0"));
    assert!(result.backup.is_none());
    assert_eq!(vcs.call_count("create_tag"), 0);
}

#[tokio::test]
async fn previous_branch_checks_it_out() {
    let vcs = repo();
    vcs.set_local_head("feature", "c1");
    vcs.set_previous_branch("feature");

    let result = engine(&vcs)
        .rollback(RollbackPlan::previous_branch(), false, false)
        .await
        .unwrap();

    assert_eq!(vcs.branch().as_deref(), Some("feature"));
    assert_eq!(result.new_head.as_deref(), Some("c1"));
}

#[tokio::test]
async fn dirty_tree_is_stashed_and_kept() {
    let vcs = repo();
    vcs.write_file("wip.txt", "draft");

    let result = engine(&vcs)
        .rollback(RollbackPlan::last_commit(), false, false)
        .await
        .unwrap();

    let stash = result.stash.unwrap();
    assert!(stash.label.starts_with("patchflow-rollback-"));
    assert_eq!(vcs.stash_count(), 1);
    assert_eq!(vcs.call_count("stash_pop"), 0);
}

#[tokio::test]
async fn backup_failure_is_not_fatal() {
    let vcs = repo();
    vcs.fail("create_tag", "tag already exists");

    let result = engine(&vcs)
        .rollback(RollbackPlan::last_commit(), true, false)
        .await
        .unwrap();

    assert!(result.backup.is_none());
    assert_eq!(vcs.head_of("main").as_deref(), Some("c1"));
}
