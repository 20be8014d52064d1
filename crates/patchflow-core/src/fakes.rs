//! In-memory fakes for the collaborator traits (testing only).
//!
//! `FakeVcs`, `FakeHosting`, `StaticIdentity` and `AutoConfirm` satisfy the
//! trait contracts without spawning processes. Every backend call is recorded
//! so tests can assert call counts, in particular that dry runs issue no
//! mutating call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{Confirmer, HostingApi, IdentityResolver, VcsBackend};
use crate::error::{Result, WorkflowError};
use crate::model::{
    ForkChain, NewIssue, NewPullRequest, OpenPullRequest, PipelineStatus, PrState, RepoIdentity,
    RepoRef, StashRef,
};

/// Conflict hunks start with this at the beginning of a line.
const CONFLICT_MARKER: &str = "<<<<<<< ";

/// Backend operations that change the working tree, refs or the remote.
const MUTATING_OPS: &[&str] = &[
    "stash_push",
    "stash_pop",
    "reset_hard",
    "discard_changes",
    "checkout",
    "checkout_previous",
    "create_branch",
    "stage_all",
    "commit",
    "push",
    "merge",
    "merge_abort",
    "create_tag",
    "create_annotated_tag",
    "push_tag",
    "delete_branch",
];

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCall {
    pub op: &'static str,
    pub args: Vec<String>,
}

impl VcsCall {
    pub fn is_mutating(&self) -> bool {
        MUTATING_OPS.contains(&self.op)
    }
}

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeCommit {
    parent: Option<String>,
    message: String,
}

#[derive(Debug, Default)]
struct FakeVcsState {
    branch: Option<String>,
    previous_branch: Option<String>,
    heads: BTreeMap<String, String>,
    remote_heads: BTreeMap<String, String>,
    commits: HashMap<String, FakeCommit>,
    /// Committed file contents per commit.
    trees: HashMap<String, BTreeMap<String, String>>,
    worktree: BTreeMap<String, String>,
    stashes: Vec<(String, BTreeMap<String, String>)>,
    local_tags: BTreeMap<String, String>,
    remote_tags: BTreeSet<String>,
    merge_conflicts: BTreeSet<String>,
    failures: HashMap<&'static str, String>,
    calls: Vec<VcsCall>,
    next_commit: u64,
}

impl FakeVcsState {
    fn head(&self) -> Option<String> {
        self.branch
            .as_ref()
            .and_then(|b| self.heads.get(b))
            .cloned()
    }

    fn resolve(&self, remote: &str, rev: &str) -> Option<String> {
        if let Some(base) = rev.strip_suffix("~1") {
            let sha = self.resolve(remote, base)?;
            return self.commits.get(&sha)?.parent.clone();
        }
        if rev == "HEAD" {
            return self.head();
        }
        if let Some(branch) = rev.strip_prefix(&format!("{remote}/")) {
            if let Some(sha) = self.remote_heads.get(branch) {
                return Some(sha.clone());
            }
        }
        if let Some(sha) = self.heads.get(rev) {
            return Some(sha.clone());
        }
        if let Some(sha) = self.local_tags.get(rev) {
            return Some(sha.clone());
        }
        self.commits.contains_key(rev).then(|| rev.to_string())
    }

    fn ancestors(&self, sha: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = Some(sha.to_string());
        while let Some(current) = cursor {
            cursor = self.commits.get(&current).and_then(|c| c.parent.clone());
            out.push(current);
        }
        out
    }

    fn new_commit(&mut self, message: &str) -> String {
        self.next_commit += 1;
        let sha = format!("{:040x}", 0xfeed_0000_u64 + self.next_commit);
        let tree = self
            .head()
            .and_then(|h| self.trees.get(&h).cloned())
            .unwrap_or_default();
        self.trees.insert(sha.clone(), tree);
        self.commits.insert(
            sha.clone(),
            FakeCommit {
                parent: self.head(),
                message: message.to_string(),
            },
        );
        if let Some(branch) = self.branch.clone() {
            self.heads.insert(branch, sha.clone());
        }
        sha
    }

    fn switch_to(&mut self, branch: &str) {
        self.previous_branch = self.branch.replace(branch.to_string());
    }
}

/// In-memory git repository with one remote.
///
/// Starts on `main` at commit `c0`, with `origin/main` at the same commit and
/// a clean working tree. Uncommitted changes are modelled as a path → content
/// map.
#[derive(Debug)]
pub struct FakeVcs {
    workdir: PathBuf,
    remote: String,
    remote_url: String,
    state: Mutex<FakeVcsState>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVcs {
    pub fn new() -> Self {
        let mut state = FakeVcsState::default();
        state.commits.insert(
            "c0".to_string(),
            FakeCommit {
                parent: None,
                message: "initial".to_string(),
            },
        );
        state.heads.insert("main".to_string(), "c0".to_string());
        state.remote_heads.insert("main".to_string(), "c0".to_string());
        state.branch = Some("main".to_string());

        Self {
            workdir: std::env::temp_dir(),
            remote: "origin".to_string(),
            remote_url: "https://github.com/me/widgets.git".to_string(),
            state: Mutex::new(state),
        }
    }

    // -- setup ------------------------------------------------------------

    /// Add a commit `sha` on top of `parent`.
    pub fn add_commit(&self, sha: &str, parent: Option<&str>, message: &str) {
        self.state.lock().unwrap().commits.insert(
            sha.to_string(),
            FakeCommit {
                parent: parent.map(str::to_string),
                message: message.to_string(),
            },
        );
    }

    /// Record `path` with `content` in the committed tree of `sha`.
    pub fn commit_file(&self, sha: &str, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .trees
            .entry(sha.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
    }

    pub fn set_local_head(&self, branch: &str, sha: &str) {
        let mut st = self.state.lock().unwrap();
        st.heads.insert(branch.to_string(), sha.to_string());
    }

    pub fn set_remote_head(&self, branch: &str, sha: &str) {
        let mut st = self.state.lock().unwrap();
        st.remote_heads.insert(branch.to_string(), sha.to_string());
    }

    pub fn remove_remote_branch(&self, branch: &str) {
        self.state.lock().unwrap().remote_heads.remove(branch);
    }

    /// Switch branch without recording a call.
    pub fn set_branch(&self, branch: Option<&str>) {
        self.state.lock().unwrap().branch = branch.map(str::to_string);
    }

    /// Make `branch` the one `checkout -` returns to.
    pub fn set_previous_branch(&self, branch: &str) {
        self.state.lock().unwrap().previous_branch = Some(branch.to_string());
    }

    /// Write an uncommitted change.
    pub fn write_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .worktree
            .insert(path.to_string(), content.to_string());
    }

    pub fn add_local_tag(&self, name: &str, sha: &str) {
        self.state
            .lock()
            .unwrap()
            .local_tags
            .insert(name.to_string(), sha.to_string());
    }

    pub fn add_remote_tag(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .remote_tags
            .insert(name.to_string());
    }

    /// Merging `rev` reports conflicts.
    pub fn conflict_on_merge(&self, rev: &str) {
        self.state
            .lock()
            .unwrap()
            .merge_conflicts
            .insert(rev.to_string());
    }

    /// Make every later call to `op` fail with `message`.
    pub fn fail(&self, op: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, message.to_string());
    }

    // -- inspection ---------------------------------------------------------

    pub fn calls(&self) -> Vec<VcsCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<VcsCall> {
        self.calls().into_iter().filter(VcsCall::is_mutating).collect()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    pub fn branch(&self) -> Option<String> {
        self.state.lock().unwrap().branch.clone()
    }

    pub fn head_of(&self, branch: &str) -> Option<String> {
        self.state.lock().unwrap().heads.get(branch).cloned()
    }

    pub fn remote_head_of(&self, branch: &str) -> Option<String> {
        self.state.lock().unwrap().remote_heads.get(branch).cloned()
    }

    pub fn worktree(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().worktree.clone()
    }

    pub fn stash_count(&self) -> usize {
        self.state.lock().unwrap().stashes.len()
    }

    pub fn local_tag_names(&self) -> Vec<String> {
        self.state.lock().unwrap().local_tags.keys().cloned().collect()
    }

    pub fn parent_of(&self, sha: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .and_then(|c| c.parent.clone())
    }

    pub fn commit_message(&self, sha: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .map(|c| c.message.clone())
    }

    // -- internals ----------------------------------------------------------

    /// Record the call and lock the state.
    fn enter(&self, op: &'static str, args: &[&str]) -> std::sync::MutexGuard<'_, FakeVcsState> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(VcsCall {
            op,
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        st
    }

    fn check(st: &FakeVcsState, op: &'static str) -> Result<()> {
        match st.failures.get(op) {
            Some(message) => Err(match op {
                "fetch" => WorkflowError::FetchFailed(message.clone()),
                _ => WorkflowError::git(op, message.clone()),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VcsBackend for FakeVcs {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        let st = self.enter("current_branch", &[]);
        Self::check(&st, "current_branch")?;
        Ok(st.branch.clone())
    }

    async fn is_dirty(&self) -> Result<bool> {
        let st = self.enter("is_dirty", &[]);
        Self::check(&st, "is_dirty")?;
        Ok(!st.worktree.is_empty())
    }

    async fn changed_files(&self) -> Result<Vec<String>> {
        let st = self.enter("changed_files", &[]);
        Self::check(&st, "changed_files")?;
        Ok(st.worktree.keys().cloned().collect())
    }

    async fn conflicted_files(&self) -> Result<Vec<String>> {
        let st = self.enter("conflicted_files", &[]);
        Self::check(&st, "conflicted_files")?;
        Ok(st
            .worktree
            .iter()
            .filter(|(_, content)| content.lines().any(|l| l.starts_with(CONFLICT_MARKER)))
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn fetch(&self, remote: &str) -> Result<()> {
        let st = self.enter("fetch", &[remote]);
        Self::check(&st, "fetch")
    }

    async fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let st = self.enter("rev_parse", &[rev]);
        Self::check(&st, "rev_parse")?;
        Ok(st.resolve(&self.remote, rev))
    }

    async fn verify_commit(&self, rev: &str) -> Result<Option<String>> {
        let st = self.enter("verify_commit", &[rev]);
        Self::check(&st, "verify_commit")?;
        Ok(st.resolve(&self.remote, rev))
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let st = self.enter("merge_base", &[a, b]);
        Self::check(&st, "merge_base")?;
        let left: BTreeSet<String> = st.ancestors(a).into_iter().collect();
        st.ancestors(b)
            .into_iter()
            .find(|sha| left.contains(sha))
            .ok_or_else(|| WorkflowError::git("merge-base", format!("no merge base for {a} {b}")))
    }

    async fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>> {
        let st = self.enter("show_file", &[rev, path]);
        Self::check(&st, "show_file")?;
        Ok(st
            .resolve(&self.remote, rev)
            .and_then(|sha| st.trees.get(&sha)?.get(path).cloned()))
    }

    async fn log_oneline(&self, range: &str, limit: usize) -> Result<Vec<String>> {
        let st = self.enter("log_oneline", &[range]);
        Self::check(&st, "log_oneline")?;
        let (from, to) = range.split_once("..").unwrap_or(("", range));
        let stop = st.resolve(&self.remote, from);
        let Some(tip) = st.resolve(&self.remote, to) else {
            return Ok(Vec::new());
        };
        Ok(st
            .ancestors(&tip)
            .into_iter()
            .take_while(|sha| Some(sha) != stop.as_ref())
            .take(limit)
            .map(|sha| {
                let message = st.commits.get(&sha).map(|c| c.message.as_str()).unwrap_or("");
                format!("{} {}", &sha[..sha.len().min(7)], message)
            })
            .collect())
    }

    async fn stash_push(&self, label: &str) -> Result<StashRef> {
        let mut st = self.enter("stash_push", &[label]);
        Self::check(&st, "stash_push")?;
        let changes = std::mem::take(&mut st.worktree);
        st.stashes.push((label.to_string(), changes));
        Ok(StashRef::new(label))
    }

    async fn stash_pop(&self, stash: &StashRef) -> Result<()> {
        let mut st = self.enter("stash_pop", &[&stash.label]);
        Self::check(&st, "stash_pop")?;
        let idx = st
            .stashes
            .iter()
            .position(|(label, _)| *label == stash.label)
            .ok_or_else(|| {
                WorkflowError::git("stash pop", format!("no stash labelled {}", stash.label))
            })?;
        let (_, changes) = st.stashes.remove(idx);
        st.worktree.extend(changes);
        Ok(())
    }

    async fn reset_hard(&self, rev: &str) -> Result<()> {
        let mut st = self.enter("reset_hard", &[rev]);
        Self::check(&st, "reset_hard")?;
        let sha = st
            .resolve(&self.remote, rev)
            .ok_or_else(|| WorkflowError::git("reset --hard", format!("unknown revision {rev}")))?;
        if let Some(branch) = st.branch.clone() {
            st.heads.insert(branch, sha);
        }
        st.worktree.clear();
        Ok(())
    }

    async fn discard_changes(&self) -> Result<()> {
        let mut st = self.enter("discard_changes", &[]);
        Self::check(&st, "discard_changes")?;
        st.worktree.clear();
        Ok(())
    }

    async fn checkout(&self, rev: &str) -> Result<()> {
        let mut st = self.enter("checkout", &[rev]);
        Self::check(&st, "checkout")?;
        if !st.heads.contains_key(rev) {
            return Err(WorkflowError::git(
                format!("checkout {rev}"),
                format!("pathspec '{rev}' did not match any branch"),
            ));
        }
        st.switch_to(rev);
        Ok(())
    }

    async fn checkout_previous(&self) -> Result<()> {
        let mut st = self.enter("checkout_previous", &[]);
        Self::check(&st, "checkout_previous")?;
        let previous = st
            .previous_branch
            .clone()
            .ok_or_else(|| WorkflowError::git("checkout -", "no previous branch"))?;
        st.switch_to(&previous);
        Ok(())
    }

    async fn create_branch(&self, name: &str, start: Option<&str>) -> Result<()> {
        let mut st = self.enter("create_branch", &[name, start.unwrap_or("HEAD")]);
        Self::check(&st, "create_branch")?;
        if st.heads.contains_key(name) {
            return Err(WorkflowError::git(
                "checkout -b",
                format!("a branch named '{name}' already exists"),
            ));
        }
        let sha = st
            .resolve(&self.remote, start.unwrap_or("HEAD"))
            .ok_or_else(|| WorkflowError::git("checkout -b", "invalid start point"))?;
        st.heads.insert(name.to_string(), sha);
        st.switch_to(name);
        Ok(())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        let st = self.enter("branch_exists", &[name]);
        Self::check(&st, "branch_exists")?;
        Ok(st.heads.contains_key(name))
    }

    async fn stage_all(&self) -> Result<()> {
        let st = self.enter("stage_all", &[]);
        Self::check(&st, "stage_all")
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let mut st = self.enter("commit", &[message]);
        Self::check(&st, "commit")?;
        if st.worktree.is_empty() {
            return Err(WorkflowError::git("commit", "nothing to commit, working tree clean"));
        }
        let changes = std::mem::take(&mut st.worktree);
        let sha = st.new_commit(message);
        st.trees.entry(sha.clone()).or_default().extend(changes);
        Ok(sha)
    }

    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let upstream = if set_upstream { "--set-upstream" } else { "" };
        let mut st = self.enter("push", &[remote, branch, upstream]);
        if let Some(message) = st.failures.get("push") {
            return Err(WorkflowError::PushFailed {
                branch: branch.to_string(),
                message: message.clone(),
            });
        }
        let sha = st.heads.get(branch).cloned().ok_or_else(|| WorkflowError::PushFailed {
            branch: branch.to_string(),
            message: format!("src refspec {branch} does not match any"),
        })?;
        st.remote_heads.insert(branch.to_string(), sha);
        Ok(())
    }

    async fn merge(&self, rev: &str) -> Result<bool> {
        let mut st = self.enter("merge", &[rev]);
        Self::check(&st, "merge")?;
        if st.resolve(&self.remote, rev).is_none() {
            return Err(WorkflowError::git(
                format!("merge {rev}"),
                format!("merge: {rev} - not something we can merge"),
            ));
        }
        if st.merge_conflicts.contains(rev) {
            return Ok(false);
        }
        st.new_commit(&format!("Merge {rev}"));
        Ok(true)
    }

    async fn merge_abort(&self) -> Result<()> {
        let st = self.enter("merge_abort", &[]);
        Self::check(&st, "merge_abort")
    }

    async fn create_tag(&self, name: &str, target: &str) -> Result<()> {
        let mut st = self.enter("create_tag", &[name, target]);
        Self::check(&st, "create_tag")?;
        let sha = st
            .resolve(&self.remote, target)
            .ok_or_else(|| WorkflowError::git("tag", format!("unknown revision {target}")))?;
        st.local_tags.insert(name.to_string(), sha);
        Ok(())
    }

    async fn create_annotated_tag(&self, name: &str, message: &str, target: &str) -> Result<()> {
        let mut st = self.enter("create_annotated_tag", &[name, message, target]);
        Self::check(&st, "create_annotated_tag")?;
        let sha = st
            .resolve(&self.remote, target)
            .ok_or_else(|| WorkflowError::git("tag -a", format!("unknown revision {target}")))?;
        st.local_tags.insert(name.to_string(), sha);
        Ok(())
    }

    async fn push_tag(&self, remote: &str, tag: &str) -> Result<()> {
        let mut st = self.enter("push_tag", &[remote, tag]);
        Self::check(&st, "push_tag")?;
        st.remote_tags.insert(tag.to_string());
        Ok(())
    }

    async fn local_tags(&self) -> Result<Vec<String>> {
        let st = self.enter("local_tags", &[]);
        Self::check(&st, "local_tags")?;
        Ok(st.local_tags.keys().cloned().collect())
    }

    async fn remote_tags(&self, remote: &str) -> Result<Vec<String>> {
        let st = self.enter("remote_tags", &[remote]);
        Self::check(&st, "remote_tags")?;
        Ok(st.remote_tags.iter().cloned().collect())
    }

    async fn local_branches(&self) -> Result<Vec<String>> {
        let st = self.enter("local_branches", &[]);
        Self::check(&st, "local_branches")?;
        Ok(st.heads.keys().cloned().collect())
    }

    async fn remote_branches(&self, remote: &str) -> Result<Vec<String>> {
        let st = self.enter("remote_branches", &[remote]);
        Self::check(&st, "remote_branches")?;
        Ok(st.remote_heads.keys().cloned().collect())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let mut st = self.enter("delete_branch", &[name]);
        Self::check(&st, "delete_branch")?;
        if st.branch.as_deref() == Some(name) {
            return Err(WorkflowError::git(
                "branch -D",
                format!("cannot delete branch '{name}' checked out"),
            ));
        }
        st.heads.remove(name);
        Ok(())
    }

    async fn remote_url(&self, remote: &str) -> Result<String> {
        let st = self.enter("remote_url", &[remote]);
        Self::check(&st, "remote_url")?;
        Ok(self.remote_url.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeHosting
// ---------------------------------------------------------------------------

/// One recorded hosting API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostingCall {
    pub op: &'static str,
    pub repo: String,
}

#[derive(Debug, Default)]
struct FakeHostingState {
    issues: Vec<NewIssue>,
    prs: Vec<NewPullRequest>,
    next_number: u64,
    pr_states: Vec<PrState>,
    state_polls: usize,
    merged: bool,
    open_prs: Vec<OpenPullRequest>,
    pipeline: PipelineStatus,
    bare_numbers: bool,
    user: Option<String>,
    failures: HashMap<&'static str, String>,
    calls: Vec<HostingCall>,
}

/// In-memory hosting service. Issue and PR numbers share one counter.
#[derive(Debug, Default)]
pub struct FakeHosting {
    state: Mutex<FakeHostingState>,
}

impl FakeHosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `create_*` with bare numbers instead of URLs.
    pub fn respond_with_bare_numbers(&self) {
        self.state.lock().unwrap().bare_numbers = true;
    }

    /// States returned by successive `pr_state` calls; the last one repeats.
    pub fn script_pr_states(&self, states: Vec<PrState>) {
        self.state.lock().unwrap().pr_states = states;
    }

    pub fn add_open_pr(&self, pr: OpenPullRequest) {
        self.state.lock().unwrap().open_prs.push(pr);
    }

    /// Login reported for the authenticated user (default `me`).
    pub fn set_user(&self, login: &str) {
        self.state.lock().unwrap().user = Some(login.to_string());
    }

    pub fn set_pipeline(&self, status: PipelineStatus) {
        self.state.lock().unwrap().pipeline = status;
    }

    pub fn fail(&self, op: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, message.to_string());
    }

    pub fn issues(&self) -> Vec<NewIssue> {
        self.state.lock().unwrap().issues.clone()
    }

    pub fn prs(&self) -> Vec<NewPullRequest> {
        self.state.lock().unwrap().prs.clone()
    }

    pub fn calls(&self) -> Vec<HostingCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    fn enter(&self, op: &'static str, repo: &RepoRef) -> Result<std::sync::MutexGuard<'_, FakeHostingState>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(HostingCall {
            op,
            repo: repo.to_string(),
        });
        if let Some(message) = st.failures.get(op) {
            return Err(WorkflowError::hosting(op, message.clone()));
        }
        Ok(st)
    }
}

#[async_trait]
impl HostingApi for FakeHosting {
    async fn create_issue(&self, issue: &NewIssue) -> Result<String> {
        let mut st = self.enter("create_issue", &issue.repo)?;
        st.next_number += 1;
        let number = st.next_number;
        st.issues.push(issue.clone());
        Ok(if st.bare_numbers {
            number.to_string()
        } else {
            format!("https://github.com/{}/issues/{number}", issue.repo)
        })
    }

    async fn create_pr(&self, pr: &NewPullRequest) -> Result<String> {
        let mut st = self.enter("create_pr", &pr.repo)?;
        st.next_number += 1;
        let number = st.next_number;
        st.prs.push(pr.clone());
        Ok(if st.bare_numbers {
            format!("{number}\n")
        } else {
            format!("https://github.com/{}/pull/{number}\n", pr.repo)
        })
    }

    async fn pr_state(&self, repo: &RepoRef, _number: u64) -> Result<PrState> {
        let mut st = self.enter("pr_state", repo)?;
        if st.merged {
            return Ok(PrState::Merged);
        }
        let idx = st.state_polls.min(st.pr_states.len().saturating_sub(1));
        st.state_polls += 1;
        Ok(st.pr_states.get(idx).copied().unwrap_or(PrState::Open))
    }

    async fn merge_pr(&self, repo: &RepoRef, _number: u64) -> Result<()> {
        let mut st = self.enter("merge_pr", repo)?;
        st.merged = true;
        Ok(())
    }

    async fn list_open_prs(&self, repo: &RepoRef) -> Result<Vec<OpenPullRequest>> {
        let st = self.enter("list_open_prs", repo)?;
        Ok(st.open_prs.clone())
    }

    async fn pipeline_status(&self, repo: &RepoRef, _reference: &str) -> Result<PipelineStatus> {
        let st = self.enter("pipeline_status", repo)?;
        Ok(st.pipeline)
    }

    async fn current_user(&self) -> Result<String> {
        let st = self.enter("current_user", &RepoRef::new("", ""))?;
        Ok(st.user.clone().unwrap_or_else(|| "me".to_string()))
    }
}

// ---------------------------------------------------------------------------
// StaticIdentity / AutoConfirm
// ---------------------------------------------------------------------------

/// Identity resolver returning a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    identity: std::result::Result<RepoIdentity, String>,
}

impl StaticIdentity {
    pub fn new(fork_chain: ForkChain) -> Self {
        Self {
            identity: Ok(RepoIdentity {
                owner: fork_chain.current.owner.clone(),
                name: fork_chain.current.name.clone(),
                remote: "origin".to_string(),
                fork_chain,
            }),
        }
    }

    /// A repository that is not a fork.
    pub fn standalone(owner: &str, name: &str) -> Self {
        Self::new(ForkChain::standalone(RepoRef::new(owner, name)))
    }

    /// `owner/name` forked from `upstream/name`, whose root is `root/name`.
    pub fn forked(owner: &str, upstream: &str, root: Option<&str>, name: &str) -> Self {
        Self::new(ForkChain {
            current: RepoRef::new(owner, name),
            upstream: Some(RepoRef::new(upstream, name)),
            root: root.map(|r| RepoRef::new(r, name)),
        })
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            identity: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self) -> Result<RepoIdentity> {
        self.identity
            .clone()
            .map_err(WorkflowError::IdentityUnavailable)
    }
}

/// Confirmer with a fixed answer that counts how often it was asked.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    answer: bool,
    asked: AtomicUsize,
}

impl AutoConfirm {
    pub fn yes() -> Self {
        Self {
            answer: true,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn no() -> Self {
        Self {
            answer: false,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Confirmer for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_vcs_commit_and_push() {
        let vcs = FakeVcs::new();
        vcs.write_file("a.txt", "a");
        vcs.create_branch("patch/a", None).await.unwrap();
        let sha = vcs.commit("Patch: a").await.unwrap();
        vcs.push("origin", "patch/a", true).await.unwrap();

        assert_eq!(vcs.remote_head_of("patch/a"), Some(sha.clone()));
        assert_eq!(vcs.verify_commit("HEAD~1").await.unwrap().as_deref(), Some("c0"));
        assert!(vcs.worktree().is_empty());
        assert_eq!(vcs.mutating_calls().len(), 3);
    }

    #[tokio::test]
    async fn fake_vcs_show_file_reads_commits_not_worktree() {
        let vcs = FakeVcs::new();
        vcs.commit_file("c0", "VERSION", "1.0.0\n");
        vcs.write_file("VERSION", "5.0.0\n");
        assert_eq!(
            vcs.show_file("origin/main", "VERSION").await.unwrap().as_deref(),
            Some("1.0.0\n")
        );

        let sha = vcs.commit("bump").await.unwrap();
        assert_eq!(vcs.show_file(&sha, "VERSION").await.unwrap().as_deref(), Some("5.0.0\n"));
        assert_eq!(vcs.show_file("nope", "VERSION").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fake_vcs_conflicts_need_marker_at_line_start() {
        let vcs = FakeVcs::new();
        vcs.write_file("lint.rs", "let m = \"<<<<<<< HEAD\";\n");
        vcs.write_file("merged.rs", "fn a() {}\n<<<<<<< Updated upstream\n=======\n>>>>>>> Stashed\n");
        assert_eq!(vcs.conflicted_files().await.unwrap(), vec!["merged.rs"]);
    }

    #[tokio::test]
    async fn fake_vcs_merge_unknown_revision_fails() {
        let vcs = FakeVcs::new();
        assert!(vcs.merge("origin/missing").await.is_err());
        assert!(vcs.merge("main").await.unwrap());
    }

    #[tokio::test]
    async fn fake_vcs_merge_base_walks_parents() {
        let vcs = FakeVcs::new();
        vcs.add_commit("l1", Some("c0"), "local");
        vcs.add_commit("r1", Some("c0"), "remote");
        assert_eq!(vcs.merge_base("l1", "r1").await.unwrap(), "c0");
        assert_eq!(vcs.merge_base("l1", "c0").await.unwrap(), "c0");
    }

    #[tokio::test]
    async fn fake_vcs_stash_roundtrip() {
        let vcs = FakeVcs::new();
        vcs.write_file("wip.txt", "draft");
        let stash = vcs.stash_push("label-1").await.unwrap();
        assert!(!vcs.is_dirty().await.unwrap());
        vcs.stash_pop(&stash).await.unwrap();
        assert_eq!(vcs.worktree().get("wip.txt").map(String::as_str), Some("draft"));
        assert_eq!(vcs.stash_count(), 0);
    }

    #[tokio::test]
    async fn fake_hosting_numbers_and_states() {
        let hosting = FakeHosting::new();
        let repo = RepoRef::new("me", "widgets");
        hosting.script_pr_states(vec![PrState::Open, PrState::Merged]);
        assert_eq!(hosting.pr_state(&repo, 1).await.unwrap(), PrState::Open);
        assert_eq!(hosting.pr_state(&repo, 1).await.unwrap(), PrState::Merged);
        assert_eq!(hosting.pr_state(&repo, 1).await.unwrap(), PrState::Merged);

        hosting.fail("merge_pr", "not mergeable");
        assert!(hosting.merge_pr(&repo, 1).await.is_err());
    }

    #[test]
    fn mutating_classification() {
        let call = |op| VcsCall { op, args: vec![] };
        assert!(call("reset_hard").is_mutating());
        assert!(call("push_tag").is_mutating());
        assert!(!call("fetch").is_mutating());
        assert!(!call("rev_parse").is_mutating());
    }
}
