//! Fork-aware routing of pull requests and issues.
//!
//! Branches are always pushed to the contributor's own repository. Pull
//! requests can target that repository, its upstream or the root of the fork
//! chain; cross-fork PRs name their head as `<owner>:<branch>`.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backend::{HostingApi, IdentityResolver, VcsBackend};
use crate::error::{Result, WorkflowError};
use crate::model::{
    ForkTarget, IssueReference, NewIssue, NewPullRequest, PrReference, RepoIdentity, RepoRef,
};

/// Commits listed in a PR body.
const MAX_BODY_COMMITS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub description: String,
    pub branch: String,
    pub base: String,
    pub target: ForkTarget,
    pub issue: Option<IssueReference>,
    pub affected_files: BTreeSet<String>,

    /// Overrides the default `Patch: <description>` title.
    pub title: Option<String>,
}

impl PrRequest {
    pub fn new(
        description: impl Into<String>,
        branch: impl Into<String>,
        base: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            branch: branch.into(),
            base: base.into(),
            target: ForkTarget::Current,
            issue: None,
            affected_files: BTreeSet::new(),
            title: None,
        }
    }

    pub fn with_target(mut self, target: ForkTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_issue(mut self, issue: Option<IssueReference>) -> Self {
        self.issue = issue;
        self
    }

    pub fn with_affected_files(mut self, files: BTreeSet<String>) -> Self {
        self.affected_files = files;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub target: ForkTarget,
}

/// Repository a PR is opened against, and how its head is named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutedTarget {
    pub repo: RepoRef,
    pub current: RepoRef,
    pub cross_fork: bool,
}

impl RoutedTarget {
    pub fn head(&self, branch: &str) -> String {
        if self.cross_fork {
            format!("{}:{branch}", self.current.owner)
        } else {
            branch.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrResult {
    pub pr: PrReference,
    pub repo: RepoRef,
    pub head: String,
}

pub struct ForkRouter {
    vcs: Arc<dyn VcsBackend>,
    hosting: Arc<dyn HostingApi>,
    resolver: Arc<dyn IdentityResolver>,
    identity: OnceCell<RepoIdentity>,
    remote: String,
}

impl ForkRouter {
    pub fn new(
        vcs: Arc<dyn VcsBackend>,
        hosting: Arc<dyn HostingApi>,
        resolver: Arc<dyn IdentityResolver>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            hosting,
            resolver,
            identity: OnceCell::new(),
            remote: remote.into(),
        }
    }

    pub fn hosting(&self) -> &Arc<dyn HostingApi> {
        &self.hosting
    }

    /// Identity of the current repository, resolved once per router.
    pub async fn identity(&self) -> Result<&RepoIdentity> {
        self.identity
            .get_or_try_init(|| self.resolver.resolve())
            .await
    }

    /// Map `target` onto a repository in the fork chain.
    pub async fn resolve_target(&self, target: ForkTarget) -> Result<RoutedTarget> {
        let chain = &self.identity().await?.fork_chain;
        let repo = chain
            .resolve(target)
            .cloned()
            .ok_or_else(|| WorkflowError::TargetForkUnavailable {
                target: target.to_string(),
                current: chain.current.to_string(),
            })?;
        Ok(RoutedTarget {
            cross_fork: repo != chain.current,
            current: chain.current.clone(),
            repo,
        })
    }

    /// Push `branch` to the current repository's remote with upstream tracking.
    pub async fn push_branch(&self, branch: &str) -> Result<()> {
        info!(branch = %branch, remote = %self.remote, "pushing branch");
        self.vcs.push(&self.remote, branch, true).await
    }

    /// Open a PR for an already pushed branch.
    pub async fn open_pr(&self, request: &PrRequest) -> Result<PrResult> {
        let target = self.resolve_target(request.target).await?;
        let head = target.head(&request.branch);
        let body = self.pr_body(request).await;
        let title = request
            .title
            .clone()
            .unwrap_or_else(|| format!("Patch: {}", request.description));

        let output = self
            .hosting
            .create_pr(&NewPullRequest {
                repo: target.repo.clone(),
                title,
                body,
                base: request.base.clone(),
                head: head.clone(),
            })
            .await
            .map_err(|e| WorkflowError::PrCreationFailed(e.to_string()))?;
        let pr = PrReference::parse(&output).ok_or_else(|| {
            WorkflowError::PrCreationFailed(format!("unrecognized PR output: {}", output.trim()))
        })?;

        info!(repo = %target.repo, head = %head, pr = pr.number, "opened pull request");
        Ok(PrResult {
            pr,
            repo: target.repo,
            head,
        })
    }

    /// Resolve the target, push the branch, then open the PR.
    ///
    /// An unavailable target fails before anything is pushed.
    pub async fn create_pr(&self, request: &PrRequest) -> Result<PrResult> {
        self.resolve_target(request.target).await?;
        self.push_branch(&request.branch).await?;
        self.open_pr(request).await
    }

    pub async fn create_issue(&self, request: &IssueRequest) -> Result<IssueReference> {
        let target = self
            .resolve_target(request.target)
            .await
            .map_err(|e| WorkflowError::IssueCreationFailed(e.to_string()))?;
        let output = self
            .hosting
            .create_issue(&NewIssue {
                repo: target.repo.clone(),
                title: request.title.clone(),
                body: request.body.clone(),
                labels: request.labels.clone(),
            })
            .await
            .map_err(|e| WorkflowError::IssueCreationFailed(e.to_string()))?;
        let issue = IssueReference::parse(&output).ok_or_else(|| {
            WorkflowError::IssueCreationFailed(format!(
                "unrecognized issue output: {}",
                output.trim()
            ))
        })?;
        info!(repo = %target.repo, issue = issue.number, "created issue");
        Ok(issue)
    }

    async fn pr_body(&self, request: &PrRequest) -> String {
        let mut body = format!("## Description\n\n{}\n", request.description);

        if !request.affected_files.is_empty() {
            body.push_str("\n## Affected files\n\n");
            for file in &request.affected_files {
                body.push_str(&format!("- `{file}`\n"));
            }
        }

        let range = format!("{}/{}..{}", self.remote, request.base, request.branch);
        match self.vcs.log_oneline(&range, MAX_BODY_COMMITS).await {
            Ok(commits) if !commits.is_empty() => {
                body.push_str("\n## Commits\n\n");
                for commit in commits {
                    body.push_str(&format!("- {commit}\n"));
                }
            }
            Ok(_) => {}
            Err(e) => warn!(range = %range, error = %e, "could not list commits for PR body"),
        }

        if let Some(issue) = &request.issue {
            body.push_str(&format!("\nFixes #{}\n", issue.number));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeHosting, FakeVcs, StaticIdentity};

    fn router(
        vcs: &Arc<FakeVcs>,
        hosting: &Arc<FakeHosting>,
        identity: StaticIdentity,
    ) -> ForkRouter {
        ForkRouter::new(vcs.clone(), hosting.clone(), Arc::new(identity), "origin")
    }

    #[tokio::test]
    async fn test_same_fork_head_is_branch() {
        let vcs = Arc::new(FakeVcs::new());
        let hosting = Arc::new(FakeHosting::new());
        let r = router(&vcs, &hosting, StaticIdentity::standalone("me", "widgets"));

        let target = r.resolve_target(ForkTarget::Current).await.unwrap();
        assert!(!target.cross_fork);
        assert_eq!(target.head("patch/x"), "patch/x");
    }

    #[tokio::test]
    async fn test_resolver_called_once() {
        let vcs = Arc::new(FakeVcs::new());
        let hosting = Arc::new(FakeHosting::new());
        let r = router(
            &vcs,
            &hosting,
            StaticIdentity::forked("me", "upstream-org", None, "widgets"),
        );
        let first = r.identity().await.unwrap().clone();
        let second = r.identity().await.unwrap();
        assert_eq!(&first, second);
    }

    #[tokio::test]
    async fn test_pr_body_lists_files_commits_and_issue() {
        let vcs = Arc::new(FakeVcs::new());
        vcs.write_file("src/a.rs", "fix");
        vcs.create_branch("patch/a", None).await.unwrap();
        vcs.commit("Patch: fix a").await.unwrap();

        let hosting = Arc::new(FakeHosting::new());
        let r = router(&vcs, &hosting, StaticIdentity::standalone("me", "widgets"));
        let request = PrRequest::new("fix a", "patch/a", "main")
            .with_issue(Some(IssueReference {
                number: 7,
                url: None,
            }))
            .with_affected_files(["src/a.rs".to_string()].into_iter().collect());

        r.create_pr(&request).await.unwrap();

        let pr = &hosting.prs()[0];
        assert_eq!(pr.title, "Patch: fix a");
        assert!(pr.body.contains("- `src/a.rs`"));
        assert!(pr.body.contains("Patch: fix a"));
        assert!(pr.body.contains("Fixes #7"));
    }

    #[tokio::test]
    async fn test_hosting_failure_is_pr_creation_failure() {
        let vcs = Arc::new(FakeVcs::new());
        let hosting = Arc::new(FakeHosting::new());
        hosting.fail("create_pr", "GraphQL: No commits between main and patch/a");
        let r = router(&vcs, &hosting, StaticIdentity::standalone("me", "widgets"));

        let err = r
            .open_pr(&PrRequest::new("x", "patch/a", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PrCreationFailed(_)));
    }
}
