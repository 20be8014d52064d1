//! Contracts for the external collaborators: the version-control backend,
//! the code-hosting API, the identity resolver and interactive confirmation.
//!
//! Production implementations live in [`crate::git`] and [`crate::github`];
//! in-memory ones for tests live in [`crate::fakes`].

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    NewIssue, NewPullRequest, OpenPullRequest, PipelineStatus, PrState, RepoIdentity, RepoRef,
    StashRef,
};

/// Version-control operations the workflows need.
///
/// Every method maps onto one backend command. Mutating methods are the ones
/// dry runs must never call.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Root of the working tree.
    fn workdir(&self) -> &Path;

    /// Current branch name, `None` on a detached HEAD.
    async fn current_branch(&self) -> Result<Option<String>>;

    /// Whether the working tree has uncommitted or untracked changes.
    async fn is_dirty(&self) -> Result<bool>;

    /// Paths with uncommitted or untracked changes.
    async fn changed_files(&self) -> Result<Vec<String>>;

    /// Paths with a line starting with a `<<<<<<< ` conflict marker.
    async fn conflicted_files(&self) -> Result<Vec<String>>;

    async fn fetch(&self, remote: &str) -> Result<()>;

    /// Resolve a revision to a commit id, `None` when it does not exist.
    async fn rev_parse(&self, rev: &str) -> Result<Option<String>>;

    /// `rev-parse --verify <rev>^{commit}`: `None` unless `rev` names a commit.
    async fn verify_commit(&self, rev: &str) -> Result<Option<String>>;

    async fn merge_base(&self, a: &str, b: &str) -> Result<String>;

    /// Committed contents of `path` at `rev` (`show <rev>:<path>`), `None`
    /// when either does not exist.
    async fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>>;

    /// One-line log of `range`, newest first, at most `limit` entries.
    async fn log_oneline(&self, range: &str, limit: usize) -> Result<Vec<String>>;

    /// Stash all changes (including untracked) under `label`.
    async fn stash_push(&self, label: &str) -> Result<StashRef>;

    async fn stash_pop(&self, stash: &StashRef) -> Result<()>;

    async fn reset_hard(&self, rev: &str) -> Result<()>;

    /// Throw away uncommitted and untracked changes.
    async fn discard_changes(&self) -> Result<()>;

    async fn checkout(&self, rev: &str) -> Result<()>;

    /// `checkout -`: return to the previously checked-out branch.
    async fn checkout_previous(&self) -> Result<()>;

    /// Create `name` at `start` (HEAD when `None`) and check it out.
    async fn create_branch(&self, name: &str, start: Option<&str>) -> Result<()>;

    async fn branch_exists(&self, name: &str) -> Result<bool>;

    async fn stage_all(&self) -> Result<()>;

    /// Commit staged changes, returning the new commit id.
    async fn commit(&self, message: &str) -> Result<String>;

    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()>;

    /// Merge `rev` into the current branch; `Ok(false)` on conflicts.
    async fn merge(&self, rev: &str) -> Result<bool>;

    async fn merge_abort(&self) -> Result<()>;

    /// Lightweight tag at `target`.
    async fn create_tag(&self, name: &str, target: &str) -> Result<()>;

    async fn create_annotated_tag(&self, name: &str, message: &str, target: &str) -> Result<()>;

    async fn push_tag(&self, remote: &str, tag: &str) -> Result<()>;

    async fn local_tags(&self) -> Result<Vec<String>>;

    /// Tag names on `remote` (`ls-remote --tags`).
    async fn remote_tags(&self, remote: &str) -> Result<Vec<String>>;

    async fn local_branches(&self) -> Result<Vec<String>>;

    /// Branch names tracked from `remote`, without the `remote/` prefix.
    async fn remote_branches(&self, remote: &str) -> Result<Vec<String>>;

    /// Force-delete a local branch.
    async fn delete_branch(&self, name: &str) -> Result<()>;

    async fn remote_url(&self, remote: &str) -> Result<String>;
}

/// Code-hosting operations (issues, pull requests, CI runs).
#[async_trait]
pub trait HostingApi: Send + Sync {
    /// Returns the raw command output (a URL or a number).
    async fn create_issue(&self, issue: &NewIssue) -> Result<String>;

    /// Returns the raw command output (a URL or a number).
    async fn create_pr(&self, pr: &NewPullRequest) -> Result<String>;

    async fn pr_state(&self, repo: &RepoRef, number: u64) -> Result<PrState>;

    async fn merge_pr(&self, repo: &RepoRef, number: u64) -> Result<()>;

    async fn list_open_prs(&self, repo: &RepoRef) -> Result<Vec<OpenPullRequest>>;

    /// Status of the most recent CI run for `reference` (tag, branch or sha).
    async fn pipeline_status(&self, repo: &RepoRef, reference: &str) -> Result<PipelineStatus>;

    /// Login of the authenticated user.
    async fn current_user(&self) -> Result<String>;
}

/// Maps the working directory onto its hosting identity and fork chain.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self) -> Result<RepoIdentity>;
}

/// Interactive yes/no confirmation.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}
