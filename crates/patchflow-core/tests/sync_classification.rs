//! Branch classification and synchronizer behavior.

use std::sync::Arc;

use patchflow_core::fakes::FakeVcs;
use patchflow_core::{BranchRelationship, BranchSynchronizer, Classification, SyncOptions};

#[test]
fn classification_is_total_and_ordered() {
    let shas = ["a", "b", "c"];
    for local in shas {
        for remote in shas {
            for base in shas {
                let expected = if local == remote {
                    Classification::InSync
                } else if base == remote {
                    Classification::Ahead
                } else if base == local {
                    Classification::Behind
                } else {
                    Classification::Diverged
                };
                assert_eq!(
                    BranchRelationship::classify(local, remote, base),
                    expected,
                    "local={local} remote={remote} base={base}"
                );
            }
        }
    }
}

/// `main` at `l1`, `origin/main` at `r1`, both children of `c0`.
fn diverged() -> Arc<FakeVcs> {
    let vcs = Arc::new(FakeVcs::new());
    vcs.add_commit("l1", Some("c0"), "local work");
    vcs.add_commit("r1", Some("c0"), "remote work");
    vcs.set_local_head("main", "l1");
    vcs.set_remote_head("main", "r1");
    vcs
}

#[tokio::test]
async fn ahead_branch_is_left_alone() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.add_commit("l1", Some("c0"), "local work");
    vcs.set_local_head("main", "l1");

    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(Some("main"), SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.relationship.classification, Classification::Ahead);
    assert_eq!(result.relationship.merge_base, "c0");
    assert!(vcs.mutating_calls().is_empty());
}

#[tokio::test]
async fn diverged_without_force_reports_only() {
    let vcs = diverged();
    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.relationship.classification, Classification::Diverged);
    assert!(!result.force_reset);
    assert!(result.message.contains("force"));
    assert_eq!(vcs.head_of("main").as_deref(), Some("l1"));
}

#[tokio::test]
async fn diverged_with_force_resets_even_when_dirty() {
    let vcs = diverged();
    vcs.write_file("scratch.txt", "lost on reset");

    let options = SyncOptions {
        force: true,
        ..Default::default()
    };
    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, options)
        .await
        .unwrap();

    assert!(result.force_reset);
    assert_eq!(vcs.head_of("main").as_deref(), Some("r1"));
    assert!(vcs.worktree().is_empty());
}

#[tokio::test]
async fn dry_run_plans_reset_and_cleanup_without_mutating() {
    let vcs = diverged();
    vcs.set_local_head("stale", "c0");

    let options = SyncOptions {
        force: true,
        cleanup_orphaned: true,
        validate_tags: true,
        dry_run: true,
        ..Default::default()
    };
    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, options)
        .await
        .unwrap();

    assert!(result.dry_run);
    assert!(!result.force_reset);
    assert!(result.orphaned_branches_removed.is_empty());
    assert_eq!(
        result.planned,
        vec![
            "would reset --hard origin/main".to_string(),
            "would delete branch stale".to_string(),
        ]
    );
    assert!(result.tags.is_some());
    assert!(vcs.mutating_calls().is_empty());
    assert_eq!(vcs.head_of("main").as_deref(), Some("l1"));
}

#[tokio::test]
async fn orphaned_branches_are_deleted_except_current() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.set_local_head("stale", "c0");
    vcs.set_local_head("feature", "c0");
    vcs.set_remote_head("feature", "c0");

    let options = SyncOptions {
        cleanup_orphaned: true,
        ..Default::default()
    };
    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, options)
        .await
        .unwrap();

    assert_eq!(result.orphaned_branches_removed, vec!["stale".to_string()]);
    assert!(vcs.head_of("stale").is_none());
    assert!(vcs.head_of("feature").is_some());
    assert!(vcs.head_of("main").is_some());
}

#[tokio::test]
async fn tag_validation_flags_duplicates_and_unpushed() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.add_local_tag("v1.0.0", "c0");
    vcs.add_local_tag("1.0.0", "c0");
    vcs.add_local_tag("v1.1.0", "c0");
    vcs.add_remote_tag("v1.0.0");
    vcs.add_remote_tag("v1.1.0");

    let options = SyncOptions {
        validate_tags: true,
        ..Default::default()
    };
    let result = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, options)
        .await
        .unwrap();

    let tags = result.tags.unwrap();
    assert_eq!(tags.local_count, 3);
    assert_eq!(tags.remote_count, 2);
    assert_eq!(
        tags.duplicates,
        vec![vec!["1.0.0".to_string(), "v1.0.0".to_string()]]
    );
    assert_eq!(tags.missing_upstream, vec!["1.0.0".to_string()]);
}

#[tokio::test]
async fn detached_head_without_branch_is_rejected() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.set_branch(None);
    let err = BranchSynchronizer::new(vcs.clone(), "origin")
        .sync(None, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, patchflow_core::WorkflowError::NoCurrentBranch));
    assert_eq!(vcs.call_count("fetch"), 0);
}
