//! Read-only queries about the repository and its working tree.

use std::sync::Arc;

use crate::backend::{IdentityResolver, VcsBackend};
use crate::error::{Result, WorkflowError};
use crate::model::{RepoIdentity, WorkingTreeState};

#[derive(Clone)]
pub struct RepositoryInspector {
    vcs: Arc<dyn VcsBackend>,
    identity: Arc<dyn IdentityResolver>,
}

impl RepositoryInspector {
    pub fn new(vcs: Arc<dyn VcsBackend>, identity: Arc<dyn IdentityResolver>) -> Self {
        Self { vcs, identity }
    }

    /// Name of the checked-out branch. Detached HEAD is an error.
    pub async fn current_branch(&self) -> Result<String> {
        match self.vcs.current_branch().await? {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(WorkflowError::NoCurrentBranch),
        }
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        self.vcs.is_dirty().await
    }

    /// Owner, name and fork chain of the current repository.
    pub async fn identity(&self) -> Result<RepoIdentity> {
        self.identity.resolve().await
    }

    pub async fn working_tree_state(&self) -> Result<WorkingTreeState> {
        Ok(WorkingTreeState {
            dirty: self.is_dirty().await?,
            stash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeVcs, StaticIdentity};

    fn inspector(vcs: Arc<FakeVcs>) -> RepositoryInspector {
        RepositoryInspector::new(vcs, Arc::new(StaticIdentity::standalone("me", "widgets")))
    }

    #[tokio::test]
    async fn test_detached_head_is_no_current_branch() {
        let vcs = Arc::new(FakeVcs::new());
        vcs.set_branch(None);
        let err = inspector(vcs).current_branch().await.unwrap_err();
        assert!(matches!(err, WorkflowError::NoCurrentBranch));
    }

    #[tokio::test]
    async fn test_working_tree_state_reflects_changes() {
        let vcs = Arc::new(FakeVcs::new());
        let insp = inspector(vcs.clone());
        assert!(!insp.working_tree_state().await.unwrap().dirty);

        vcs.write_file("src/lib.rs", "changed");
        let state = insp.working_tree_state().await.unwrap();
        assert!(state.dirty);
        assert!(state.stash.is_none());
        assert!(vcs.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_identity_failure_propagates() {
        let insp = RepositoryInspector::new(
            Arc::new(FakeVcs::new()),
            Arc::new(StaticIdentity::unavailable("gh: not logged in")),
        );
        let err = insp.identity().await.unwrap_err();
        assert!(matches!(err, WorkflowError::IdentityUnavailable(_)));
    }
}
