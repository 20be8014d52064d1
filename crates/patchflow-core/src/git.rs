//! `git` executable adapter implementing [`VcsBackend`].

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::backend::VcsBackend;
use crate::error::{Result, WorkflowError};
use crate::model::StashRef;

/// Start of a conflict hunk; only matched at the beginning of a line.
const CONFLICT_MARKER_PATTERN: &str = "^<<<<<<< ";

/// Runs `git` in a fixed working directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(command = %format!("git {}", args.join(" ")), "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .map_err(|e| WorkflowError::git(args.join(" "), format!("failed to run git: {e}")))
    }

    /// Run git and return trimmed stdout, or a `Git` error carrying stderr.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(WorkflowError::git(args.join(" "), stderr_of(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git where a non-zero exit means "no" rather than failure.
    async fn probe(&self, args: &[&str]) -> Result<Option<String>> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!out.is_empty()).then_some(out))
    }

    async fn lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(split_lines(&self.run(args).await?))
    }

    /// Resolve a stash label to its current `stash@{n}` name.
    async fn find_stash(&self, label: &str) -> Result<Option<String>> {
        let listing = self.run(&["stash", "list", "--format=%gd%x09%s"]).await?;
        Ok(listing.lines().find_map(|line| {
            let (name, subject) = line.split_once('\t')?;
            subject.ends_with(label).then(|| name.to_string())
        }))
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}

fn split_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Path column of one `git status --porcelain` line.
fn porcelain_path(line: &str) -> Option<String> {
    let path = line.get(3..)?;
    let path = path.rsplit(" -> ").next().unwrap_or(path);
    let path = path.trim().trim_matches('"');
    (!path.is_empty()).then(|| path.to_string())
}

/// Tag names from `git ls-remote --tags` output, peeled entries dropped.
fn parse_ls_remote_tags(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix("refs/tags/"))
        .filter(|name| !name.ends_with("^{}"))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl VcsBackend for GitCli {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        self.probe(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
    }

    async fn is_dirty(&self) -> Result<bool> {
        Ok(!self.run(&["status", "--porcelain"]).await?.is_empty())
    }

    async fn changed_files(&self) -> Result<Vec<String>> {
        let output = self
            .output(&["status", "--porcelain", "--untracked-files=all"])
            .await?;
        if !output.status.success() {
            return Err(WorkflowError::git("status --porcelain", stderr_of(&output)));
        }
        // Leading spaces are significant in porcelain output, so no trim here.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(porcelain_path)
            .collect())
    }

    async fn conflicted_files(&self) -> Result<Vec<String>> {
        let args = ["grep", "--untracked", "-l", "-E", "-e", CONFLICT_MARKER_PATTERN];
        let output = self.output(&args).await?;
        match output.status.code() {
            Some(0) => Ok(split_lines(&String::from_utf8_lossy(&output.stdout))),
            // git grep exits 1 when nothing matched
            Some(1) => Ok(Vec::new()),
            _ => Err(WorkflowError::git(args.join(" "), stderr_of(&output))),
        }
    }

    async fn fetch(&self, remote: &str) -> Result<()> {
        let output = self.output(&["fetch", remote]).await?;
        if !output.status.success() {
            return Err(WorkflowError::FetchFailed(stderr_of(&output)));
        }
        Ok(())
    }

    async fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        self.probe(&["rev-parse", "--verify", "--quiet", rev]).await
    }

    async fn verify_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        self.probe(&["rev-parse", "--verify", "--quiet", &spec])
            .await
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.run(&["merge-base", a, b]).await
    }

    async fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>> {
        let object = format!("{rev}:{path}");
        let output = self.output(&["show", &object]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    async fn log_oneline(&self, range: &str, limit: usize) -> Result<Vec<String>> {
        let limit = limit.to_string();
        self.lines(&["log", "--oneline", "-n", &limit, range]).await
    }

    async fn stash_push(&self, label: &str) -> Result<StashRef> {
        self.run(&["stash", "push", "--include-untracked", "-m", label])
            .await?;
        Ok(StashRef::new(label))
    }

    async fn stash_pop(&self, stash: &StashRef) -> Result<()> {
        let name = self.find_stash(&stash.label).await?.ok_or_else(|| {
            WorkflowError::git("stash pop", format!("no stash labelled {}", stash.label))
        })?;
        self.run(&["stash", "pop", &name]).await.map(|_| ())
    }

    async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run(&["reset", "--hard", rev]).await.map(|_| ())
    }

    async fn discard_changes(&self) -> Result<()> {
        self.run(&["reset", "--hard", "HEAD"]).await?;
        self.run(&["clean", "-fd"]).await.map(|_| ())
    }

    async fn checkout(&self, rev: &str) -> Result<()> {
        self.run(&["checkout", rev]).await.map(|_| ())
    }

    async fn checkout_previous(&self) -> Result<()> {
        self.run(&["checkout", "-"]).await.map(|_| ())
    }

    async fn create_branch(&self, name: &str, start: Option<&str>) -> Result<()> {
        let mut args = vec!["checkout", "-b", name];
        if let Some(start) = start {
            args.push(start);
        }
        self.run(&args).await.map(|_| ())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        let full = format!("refs/heads/{name}");
        let output = self
            .output(&["show-ref", "--verify", "--quiet", &full])
            .await?;
        Ok(output.status.success())
    }

    async fn stage_all(&self) -> Result<()> {
        self.run(&["add", "-A"]).await.map(|_| ())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message]).await?;
        self.run(&["rev-parse", "HEAD"]).await
    }

    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("--set-upstream");
        }
        args.extend([remote, branch]);
        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(WorkflowError::PushFailed {
                branch: branch.to_string(),
                message: stderr_of(&output),
            });
        }
        Ok(())
    }

    async fn merge(&self, rev: &str) -> Result<bool> {
        let output = self.output(&["merge", "--no-edit", rev]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let unmerged = self
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        if unmerged.is_empty() {
            return Err(WorkflowError::git(
                format!("merge {rev}"),
                stderr_of(&output),
            ));
        }
        Ok(false)
    }

    async fn merge_abort(&self) -> Result<()> {
        self.run(&["merge", "--abort"]).await.map(|_| ())
    }

    async fn create_tag(&self, name: &str, target: &str) -> Result<()> {
        self.run(&["tag", name, target]).await.map(|_| ())
    }

    async fn create_annotated_tag(&self, name: &str, message: &str, target: &str) -> Result<()> {
        self.run(&["tag", "-a", name, "-m", message, target])
            .await
            .map(|_| ())
    }

    async fn push_tag(&self, remote: &str, tag: &str) -> Result<()> {
        let refspec = format!("refs/tags/{tag}");
        self.run(&["push", remote, &refspec]).await.map(|_| ())
    }

    async fn local_tags(&self) -> Result<Vec<String>> {
        self.lines(&["tag", "--list"]).await
    }

    async fn remote_tags(&self, remote: &str) -> Result<Vec<String>> {
        let out = self.run(&["ls-remote", "--tags", remote]).await?;
        Ok(parse_ls_remote_tags(&out))
    }

    async fn local_branches(&self) -> Result<Vec<String>> {
        self.lines(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])
            .await
    }

    async fn remote_branches(&self, remote: &str) -> Result<Vec<String>> {
        let prefix = format!("refs/remotes/{remote}");
        let out = self
            .lines(&["for-each-ref", "--format=%(refname)", &prefix])
            .await?;
        let strip = format!("{prefix}/");
        Ok(out
            .iter()
            .filter_map(|r| r.strip_prefix(&strip))
            .filter(|name| *name != "HEAD")
            .map(str::to_string)
            .collect())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name]).await.map(|_| ())
    }

    async fn remote_url(&self, remote: &str) -> Result<String> {
        self.run(&["remote", "get-url", remote]).await
    }
}
