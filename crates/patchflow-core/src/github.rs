//! `gh` executable adapter implementing [`HostingApi`] and
//! [`IdentityResolver`] for GitHub.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{HostingApi, IdentityResolver, VcsBackend};
use crate::error::{Result, WorkflowError};
use crate::model::{
    ForkChain, NewIssue, NewPullRequest, OpenPullRequest, PipelineStatus, PrState, RepoIdentity,
    RepoRef,
};

/// Runs the GitHub CLI in a fixed working directory.
#[derive(Debug, Clone)]
pub struct GhCli {
    workdir: PathBuf,
}

impl GhCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    async fn run(&self, call: &str, args: &[&str]) -> Result<String> {
        debug!(command = %format!("gh {}", args.join(" ")), "running gh");
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .map_err(|e| WorkflowError::hosting(call, format!("failed to run gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            let detail = if detail.is_empty() {
                "GitHub CLI command failed".to_string()
            } else {
                detail.to_string()
            };
            return Err(WorkflowError::hosting(call, detail));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Extract `(owner, repo)` from a GitHub remote URL (https or ssh forms).
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let normalized = url.trim().trim_end_matches('/').trim_end_matches(".git");
    let path = normalized
        .strip_prefix("https://github.com/")
        .or_else(|| normalized.strip_prefix("http://github.com/"))
        .or_else(|| normalized.strip_prefix("ssh://git@github.com/"))
        .or_else(|| normalized.strip_prefix("git@github.com:"))?;

    let mut parts = path.split('/');
    let owner = parts.next()?.trim();
    let repo = parts.next()?.trim();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Deserialize)]
struct GhLogin {
    login: String,
}

fn parse_login(json: &str) -> Result<String> {
    let user: GhLogin = serde_json::from_str(json)
        .map_err(|e| WorkflowError::hosting("api user", e.to_string()))?;
    Ok(user.login)
}

#[derive(Debug, Deserialize)]
struct GhRepoSummary {
    name: String,
    owner: GhLogin,
}

impl From<GhRepoSummary> for RepoRef {
    fn from(r: GhRepoSummary) -> Self {
        RepoRef::new(r.owner.login, r.name)
    }
}

#[derive(Debug, Deserialize)]
struct GhRepoDetail {
    parent: Option<GhRepoSummary>,
    source: Option<GhRepoSummary>,
}

/// Build a fork chain from a `gh api repos/{owner}/{repo}` response.
fn chain_from_repo_json(current: RepoRef, json: &str) -> serde_json::Result<ForkChain> {
    let detail: GhRepoDetail = serde_json::from_str(json)?;
    Ok(ForkChain {
        current,
        upstream: detail.parent.map(RepoRef::from),
        root: detail.source.map(RepoRef::from),
    })
}

#[derive(Debug, Deserialize)]
struct GhPrState {
    state: String,
}

fn parse_pr_state(json: &str) -> Result<PrState> {
    let parsed: GhPrState = serde_json::from_str(json)
        .map_err(|e| WorkflowError::hosting("pr view", e.to_string()))?;
    match parsed.state.to_ascii_uppercase().as_str() {
        "MERGED" => Ok(PrState::Merged),
        "CLOSED" => Ok(PrState::Closed),
        "OPEN" => Ok(PrState::Open),
        other => Err(WorkflowError::hosting(
            "pr view",
            format!("unexpected pull request state {other}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct GhFile {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPrListItem {
    number: u64,
    title: String,
    head_ref_name: String,
    author: GhLogin,
    #[serde(default)]
    files: Vec<GhFile>,
}

fn parse_open_prs(json: &str) -> Result<Vec<OpenPullRequest>> {
    let items: Vec<GhPrListItem> = serde_json::from_str(json)
        .map_err(|e| WorkflowError::hosting("pr list", e.to_string()))?;
    Ok(items
        .into_iter()
        .map(|item| OpenPullRequest {
            number: item.number,
            title: item.title,
            head_branch: item.head_ref_name,
            author: item.author.login,
            files: item.files.into_iter().map(|f| f.path).collect(),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct GhRun {
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
}

fn pipeline_from_runs(json: &str) -> Result<PipelineStatus> {
    let runs: Vec<GhRun> = serde_json::from_str(json)
        .map_err(|e| WorkflowError::hosting("run list", e.to_string()))?;
    let Some(run) = runs.first() else {
        return Ok(PipelineStatus::Unknown);
    };
    if run.status != "completed" {
        return Ok(PipelineStatus::Pending);
    }
    match run.conclusion.as_deref() {
        Some("success") => Ok(PipelineStatus::Success),
        Some("") | None => Ok(PipelineStatus::Unknown),
        Some(_) => Ok(PipelineStatus::Failure),
    }
}

#[async_trait]
impl HostingApi for GhCli {
    async fn create_issue(&self, issue: &NewIssue) -> Result<String> {
        let repo = issue.repo.to_string();
        let base = [
            "issue",
            "create",
            "--repo",
            repo.as_str(),
            "--title",
            issue.title.as_str(),
            "--body",
            issue.body.as_str(),
        ];
        let mut args: Vec<&str> = base.to_vec();
        for label in &issue.labels {
            args.extend(["--label", label.as_str()]);
        }

        match self.run("issue create", &args).await {
            Err(WorkflowError::Hosting { message, .. })
                if !issue.labels.is_empty() && message.to_lowercase().contains("label") =>
            {
                warn!(repo = %repo, error = %message, "issue labels rejected, retrying without labels");
                self.run("issue create", &base).await
            }
            other => other,
        }
    }

    async fn create_pr(&self, pr: &NewPullRequest) -> Result<String> {
        let repo = pr.repo.to_string();
        self.run(
            "pr create",
            &[
                "pr", "create", "--repo", &repo, "--title", &pr.title, "--body", &pr.body,
                "--base", &pr.base, "--head", &pr.head,
            ],
        )
        .await
    }

    async fn pr_state(&self, repo: &RepoRef, number: u64) -> Result<PrState> {
        let repo = repo.to_string();
        let number = number.to_string();
        let out = self
            .run(
                "pr view",
                &["pr", "view", &number, "--repo", &repo, "--json", "state"],
            )
            .await?;
        parse_pr_state(&out)
    }

    async fn merge_pr(&self, repo: &RepoRef, number: u64) -> Result<()> {
        let repo = repo.to_string();
        let number = number.to_string();
        self.run(
            "pr merge",
            &["pr", "merge", &number, "--repo", &repo, "--merge"],
        )
        .await
        .map(|_| ())
    }

    async fn list_open_prs(&self, repo: &RepoRef) -> Result<Vec<OpenPullRequest>> {
        let repo = repo.to_string();
        let out = self
            .run(
                "pr list",
                &[
                    "pr",
                    "list",
                    "--repo",
                    &repo,
                    "--state",
                    "open",
                    "--limit",
                    "100",
                    "--json",
                    "number,title,headRefName,author,files",
                ],
            )
            .await?;
        parse_open_prs(&out)
    }

    async fn pipeline_status(&self, repo: &RepoRef, reference: &str) -> Result<PipelineStatus> {
        let repo = repo.to_string();
        let out = self
            .run(
                "run list",
                &[
                    "run",
                    "list",
                    "--repo",
                    &repo,
                    "--branch",
                    reference,
                    "--limit",
                    "1",
                    "--json",
                    "status,conclusion",
                ],
            )
            .await?;
        pipeline_from_runs(&out)
    }

    async fn current_user(&self) -> Result<String> {
        let out = self.run("api user", &["api", "user"]).await?;
        parse_login(&out)
    }
}

/// Resolves identity from the remote URL and the fork chain from the GitHub API.
pub struct GhIdentityResolver {
    vcs: Arc<dyn VcsBackend>,
    gh: GhCli,
    remote: String,
}

impl GhIdentityResolver {
    pub fn new(vcs: Arc<dyn VcsBackend>, remote: impl Into<String>) -> Self {
        let gh = GhCli::new(vcs.workdir().to_path_buf());
        Self {
            vcs,
            gh,
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for GhIdentityResolver {
    async fn resolve(&self) -> Result<RepoIdentity> {
        let url = self
            .vcs
            .remote_url(&self.remote)
            .await
            .map_err(|e| WorkflowError::IdentityUnavailable(e.to_string()))?;
        let (owner, name) = parse_github_remote(&url).ok_or_else(|| {
            WorkflowError::IdentityUnavailable(format!("not a GitHub remote: {url}"))
        })?;

        let endpoint = format!("repos/{owner}/{name}");
        let json = self
            .gh
            .run("api repos", &["api", &endpoint])
            .await
            .map_err(|e| WorkflowError::IdentityUnavailable(e.to_string()))?;
        let fork_chain = chain_from_repo_json(RepoRef::new(&owner, &name), &json)
            .map_err(|e| WorkflowError::IdentityUnavailable(e.to_string()))?;

        Ok(RepoIdentity {
            owner,
            name,
            remote: self.remote.clone(),
            fork_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_remote_forms() {
        let expected = Some(("octo".to_string(), "widgets".to_string()));
        assert_eq!(parse_github_remote("https://github.com/octo/widgets.git"), expected);
        assert_eq!(parse_github_remote("https://github.com/octo/widgets/"), expected);
        assert_eq!(parse_github_remote("git@github.com:octo/widgets.git"), expected);
        assert_eq!(parse_github_remote("ssh://git@github.com/octo/widgets"), expected);
        assert_eq!(parse_github_remote("https://gitlab.com/octo/widgets"), None);
        assert_eq!(parse_github_remote("https://github.com/octo"), None);
    }

    #[test]
    fn test_chain_from_fork_json() {
        let json = r#"{
            "name": "widgets",
            "fork": true,
            "parent": {"name": "widgets", "owner": {"login": "team"}},
            "source": {"name": "widgets", "owner": {"login": "origin-org"}}
        }"#;
        let chain = chain_from_repo_json(RepoRef::new("me", "widgets"), json).unwrap();
        assert_eq!(chain.upstream, Some(RepoRef::new("team", "widgets")));
        assert_eq!(chain.root, Some(RepoRef::new("origin-org", "widgets")));
    }

    #[test]
    fn test_chain_from_non_fork_json() {
        let json = r#"{"name": "widgets", "fork": false}"#;
        let chain = chain_from_repo_json(RepoRef::new("me", "widgets"), json).unwrap();
        assert_eq!(chain, ForkChain::standalone(RepoRef::new("me", "widgets")));
    }

    #[test]
    fn test_parse_pr_state() {
        assert_eq!(parse_pr_state(r#"{"state":"MERGED"}"#).unwrap(), PrState::Merged);
        assert_eq!(parse_pr_state(r#"{"state":"OPEN"}"#).unwrap(), PrState::Open);
        assert_eq!(parse_pr_state(r#"{"state":"CLOSED"}"#).unwrap(), PrState::Closed);
        assert!(parse_pr_state(r#"{"state":"DRAFTY"}"#).is_err());
        assert!(parse_pr_state("not json").is_err());
    }

    #[test]
    fn test_parse_open_prs() {
        let json = r#"[{
            "number": 12,
            "title": "Patch: fix typo",
            "headRefName": "patch/fix-typo",
            "author": {"login": "alice"},
            "files": [{"path": "README.md", "additions": 1, "deletions": 1}]
        }]"#;
        let prs = parse_open_prs(json).unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].number, 12);
        assert_eq!(prs[0].author, "alice");
        assert!(prs[0].files.contains("README.md"));
    }

    #[test]
    fn test_parse_login_from_user_json() {
        let json = r#"{"login": "alice", "id": 42, "type": "User"}"#;
        assert_eq!(parse_login(json).unwrap(), "alice");
        assert!(parse_login("{}").is_err());
    }

    #[test]
    fn test_pipeline_from_runs() {
        assert_eq!(pipeline_from_runs("[]").unwrap(), PipelineStatus::Unknown);
        assert_eq!(
            pipeline_from_runs(r#"[{"status":"in_progress","conclusion":""}]"#).unwrap(),
            PipelineStatus::Pending
        );
        assert_eq!(
            pipeline_from_runs(r#"[{"status":"completed","conclusion":"success"}]"#).unwrap(),
            PipelineStatus::Success
        );
        assert_eq!(
            pipeline_from_runs(r#"[{"status":"completed","conclusion":"failure"}]"#).unwrap(),
            PipelineStatus::Failure
        );
    }
}
