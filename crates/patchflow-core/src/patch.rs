//! Patch workflow orchestration.
//!
//! A run walks a fixed sequence of steps:
//!
//! ```text
//! validate → preflight conflicts → stash if dirty → ensure base branch
//!   → apply operation → verify → issue → commit + push → PR → consolidate
//!   → restore
//! ```
//!
//! Any failure after the stash jumps straight to restore, which puts the
//! working tree back the way it was found, then the original error is
//! returned.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::backend::{Confirmer, VcsBackend};
use crate::config::WorkflowConfig;
use crate::consolidate::{ConsolidationInput, ConsolidationOutcome, Consolidator};
use crate::error::{Result, WorkflowError};
use crate::model::{
    ConsolidationStrategy, ForkTarget, IssueReference, PrReference, Priority, WorkingTreeState,
};
use crate::obs;
use crate::router::{ForkRouter, IssueRequest, PrRequest};
use crate::runner::{CommandRunner, VerificationOutcome};
use crate::sync::{BranchSynchronizer, SyncOptions};

/// Caller-supplied change, run on a blocking thread with the working tree root.
pub type PatchOperation = Box<dyn FnOnce(&Path) -> anyhow::Result<()> + Send>;

/// Maximum length of the description slug in generated branch names.
const SLUG_MAX_LEN: usize = 40;

/// Parameters of one patch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchContext {
    pub description: String,
    pub priority: Priority,

    /// Files the patch touches. Empty means "whatever the operation changed".
    pub affected_files: BTreeSet<String>,

    /// Branch to commit on. Generated as `patch/<timestamp>-<slug>` when unset.
    pub branch: Option<String>,

    /// Defaults to the configured base branch.
    pub base_branch: Option<String>,

    pub target_fork: ForkTarget,
    pub test_commands: Vec<String>,

    /// Existing issue to link instead of creating one.
    pub issue: Option<IssueReference>,

    /// Existing PR for the branch; no new PR is opened when set.
    pub pr: Option<PrReference>,

    pub dry_run: bool,

    /// Switch to the base branch without asking.
    pub force: bool,

    pub create_issue: bool,

    /// Issue creation failure is a warning instead of an error.
    pub issue_best_effort: bool,

    pub create_pr: bool,

    /// Overrides the `Patch: <description>` PR title.
    pub pr_title: Option<String>,

    pub auto_consolidate: bool,
    pub consolidation_strategy: ConsolidationStrategy,
}

impl PatchContext {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: Priority::default(),
            affected_files: BTreeSet::new(),
            branch: None,
            base_branch: None,
            target_fork: ForkTarget::Current,
            test_commands: Vec::new(),
            issue: None,
            pr: None,
            dry_run: false,
            force: false,
            create_issue: true,
            issue_best_effort: false,
            create_pr: false,
            pr_title: None,
            auto_consolidate: false,
            consolidation_strategy: ConsolidationStrategy::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affected_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = Some(base.into());
        self
    }

    pub fn with_target_fork(mut self, target: ForkTarget) -> Self {
        self.target_fork = target;
        self
    }

    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_commands.push(command.into());
        self
    }

    pub fn with_issue(mut self, issue: IssueReference) -> Self {
        self.issue = Some(issue);
        self
    }

    pub fn with_pr(mut self, pr: PrReference) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_create_issue(mut self, create: bool) -> Self {
        self.create_issue = create;
        self
    }

    pub fn with_issue_best_effort(mut self, best_effort: bool) -> Self {
        self.issue_best_effort = best_effort;
        self
    }

    pub fn with_create_pr(mut self, create: bool) -> Self {
        self.create_pr = create;
        self
    }

    pub fn with_pr_title(mut self, title: impl Into<String>) -> Self {
        self.pr_title = Some(title.into());
        self
    }

    pub fn with_auto_consolidate(mut self, strategy: ConsolidationStrategy) -> Self {
        self.auto_consolidate = true;
        self.consolidation_strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchResult {
    pub workflow_id: String,
    pub description: String,
    pub priority: Priority,
    pub branch: Option<String>,
    pub base_branch: String,
    pub affected_files: BTreeSet<String>,
    pub commit: Option<String>,
    pub issue: Option<IssueReference>,
    pub pr: Option<PrReference>,
    pub verification: Vec<VerificationOutcome>,
    pub consolidation: Option<ConsolidationOutcome>,

    /// Working tree as found on entry.
    pub tree: WorkingTreeState,

    /// False when the entry stash could not be popped and is still stashed.
    pub stash_restored: bool,

    pub dry_run: bool,

    /// Mutations a dry run skipped, as `would ...` lines.
    pub planned: Vec<String>,
}

impl PatchResult {
    fn plan(&mut self, action: impl Into<String>) {
        let action = action.into();
        obs::emit_dry_run(&action);
        self.planned.push(format!("would {action}"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded,
    Failed { kind: String, message: String },
}

/// One entry of a [`PatchWorkflow`]'s run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: WorkflowOutcome,
}

pub struct PatchWorkflow {
    vcs: Arc<dyn VcsBackend>,
    router: ForkRouter,
    confirmer: Arc<dyn Confirmer>,
    synchronizer: Option<BranchSynchronizer>,
    config: WorkflowConfig,
    history: Vec<WorkflowRecord>,
}

impl PatchWorkflow {
    pub fn new(
        vcs: Arc<dyn VcsBackend>,
        router: ForkRouter,
        confirmer: Arc<dyn Confirmer>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            vcs,
            router,
            confirmer,
            synchronizer: None,
            config,
            history: Vec::new(),
        }
    }

    /// Sync the base branch with the remote after switching to it.
    pub fn with_synchronizer(mut self, synchronizer: BranchSynchronizer) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    pub fn vcs(&self) -> &Arc<dyn VcsBackend> {
        &self.vcs
    }

    pub fn router(&self) -> &ForkRouter {
        &self.router
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs completed by this orchestrator, oldest first.
    pub fn history(&self) -> &[WorkflowRecord] {
        &self.history
    }

    /// Run one patch.
    ///
    /// Local state (working tree, checked-out branch, stash) is restored on
    /// both success and failure. Remote side effects are not: a pushed branch
    /// or a created issue or PR stays in place when a later step fails.
    pub async fn run(&mut self, ctx: PatchContext, operation: PatchOperation) -> Result<PatchResult> {
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let span = obs::workflow_span("patch", &id);
        span.in_scope(|| obs::emit_workflow_started("patch", &id, ctx.dry_run));

        let description = ctx.description.clone();
        let outcome = self
            .execute(&id, ctx, operation)
            .instrument(span.clone())
            .await;

        span.in_scope(|| {
            obs::emit_workflow_finished(
                "patch",
                &id,
                clock.elapsed().as_millis() as u64,
                outcome.is_ok(),
            )
        });
        self.history.push(WorkflowRecord {
            id,
            description,
            started_at,
            finished_at: Utc::now(),
            outcome: match &outcome {
                Ok(_) => WorkflowOutcome::Succeeded,
                Err(e) => WorkflowOutcome::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                },
            },
        });
        outcome
    }

    async fn execute(
        &self,
        id: &str,
        ctx: PatchContext,
        operation: PatchOperation,
    ) -> Result<PatchResult> {
        if ctx.description.trim().is_empty() {
            return Err(WorkflowError::MissingParameter("description".to_string()));
        }

        obs::emit_step("preflight");
        let conflicts = self.vcs.conflicted_files().await?;
        if !conflicts.is_empty() {
            return Err(WorkflowError::MergeConflictsDetected { files: conflicts });
        }
        if ctx.create_pr && ctx.pr.is_none() {
            self.router.resolve_target(ctx.target_fork).await?;
        }
        let start_branch = self
            .vcs
            .current_branch()
            .await?
            .filter(|b| !b.trim().is_empty())
            .ok_or(WorkflowError::NoCurrentBranch)?;

        let mut result = PatchResult {
            workflow_id: id.to_string(),
            description: ctx.description.clone(),
            priority: ctx.priority,
            branch: None,
            base_branch: ctx
                .base_branch
                .clone()
                .unwrap_or_else(|| self.config.base_branch.clone()),
            affected_files: ctx.affected_files.clone(),
            commit: None,
            issue: ctx.issue.clone(),
            pr: ctx.pr.clone(),
            verification: Vec::new(),
            consolidation: None,
            tree: WorkingTreeState::default(),
            stash_restored: true,
            dry_run: ctx.dry_run,
            planned: Vec::new(),
        };

        obs::emit_step("stash");
        result.tree.dirty = self.vcs.is_dirty().await?;
        if result.tree.dirty {
            if ctx.dry_run {
                result.plan("stash uncommitted changes");
            } else {
                let label = format!("{}-{}", self.config.stash_prefix, Uuid::new_v4());
                result.tree.stash = Some(self.vcs.stash_push(&label).await?);
                info!(stash = %label, "stashed uncommitted changes");
            }
        }

        match self.steps(&ctx, operation, &mut result).await {
            Ok(()) => {
                self.restore(&mut result, &start_branch, false).await;
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "patch workflow failed, restoring working tree");
                self.restore(&mut result, &start_branch, true).await;
                Err(e)
            }
        }
    }

    async fn steps(
        &self,
        ctx: &PatchContext,
        operation: PatchOperation,
        result: &mut PatchResult,
    ) -> Result<()> {
        self.ensure_base_branch(ctx, result).await?;
        self.apply_operation(ctx, operation, result).await?;
        self.verify(ctx, result).await;
        self.create_issue(ctx, result).await?;
        self.commit_and_push(ctx, result).await?;
        self.create_pr(ctx, result).await?;
        self.consolidate(ctx, result).await;
        Ok(())
    }

    async fn ensure_base_branch(&self, ctx: &PatchContext, result: &mut PatchResult) -> Result<()> {
        obs::emit_step("ensure_base_branch");
        let base = result.base_branch.clone();
        let current = self.vcs.current_branch().await?;

        if current.as_deref() != Some(base.as_str()) {
            if ctx.dry_run {
                result.plan(format!("checkout base branch {base}"));
            } else {
                let prompt = format!(
                    "Currently on {}. Switch to base branch {base}?",
                    current.as_deref().unwrap_or("a detached HEAD")
                );
                if !ctx.force && !self.confirmer.confirm(&prompt) {
                    return Err(WorkflowError::ConfirmationDeclined { base });
                }
                self.vcs.checkout(&base).await?;
            }
        }

        if let Some(synchronizer) = &self.synchronizer {
            if ctx.dry_run {
                result.plan(format!("sync {base} with {}", self.config.remote));
            } else {
                let options = SyncOptions {
                    fast_forward: true,
                    ..Default::default()
                };
                if let Err(e) = synchronizer.sync(Some(&base), options).await {
                    warn!(branch = %base, error = %e, "base branch sync failed, continuing");
                }
            }
        }
        Ok(())
    }

    async fn apply_operation(
        &self,
        ctx: &PatchContext,
        operation: PatchOperation,
        result: &mut PatchResult,
    ) -> Result<()> {
        obs::emit_step("apply_operation");
        if ctx.dry_run {
            result.plan(format!("apply patch operation in {}", self.vcs.workdir().display()));
            return Ok(());
        }

        let workdir = self.vcs.workdir().to_path_buf();
        match tokio::task::spawn_blocking(move || operation(&workdir)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(WorkflowError::PatchOperationFailed {
                    cause: format!("{e:#}"),
                })
            }
            Err(join) => {
                return Err(WorkflowError::PatchOperationFailed {
                    cause: panic_message(join),
                })
            }
        }

        if result.affected_files.is_empty() {
            result.affected_files = self.vcs.changed_files().await?.into_iter().collect();
        }
        Ok(())
    }

    async fn verify(&self, ctx: &PatchContext, result: &mut PatchResult) {
        for command in &ctx.test_commands {
            if ctx.dry_run {
                result.plan(format!("run verification `{command}`"));
                continue;
            }
            obs::emit_step("verify");
            let outcome = CommandRunner::run_shell(command, self.vcs.workdir(), None).await;
            if !outcome.passed {
                warn!(
                    command = %command,
                    exit_code = outcome.exit_code,
                    "verification command failed"
                );
            }
            result.verification.push(outcome);
        }
    }

    async fn create_issue(&self, ctx: &PatchContext, result: &mut PatchResult) -> Result<()> {
        if !ctx.create_issue || result.issue.is_some() {
            return Ok(());
        }
        if ctx.dry_run {
            result.plan(format!("create issue \"Patch: {}\"", ctx.description));
            return Ok(());
        }

        obs::emit_step("create_issue");
        let request = IssueRequest {
            title: format!("Patch: {}", ctx.description),
            body: issue_body(ctx, result),
            labels: vec!["patch".to_string(), ctx.priority.label()],
            target: ctx.target_fork,
        };
        match self.router.create_issue(&request).await {
            Ok(issue) => result.issue = Some(issue),
            Err(e) if ctx.issue_best_effort => {
                warn!(error = %e, "issue creation failed, continuing without an issue");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn commit_and_push(&self, ctx: &PatchContext, result: &mut PatchResult) -> Result<()> {
        let branch = ctx
            .branch
            .clone()
            .unwrap_or_else(|| generated_branch_name(&ctx.description));
        result.branch = Some(branch.clone());
        let message = commit_message(&ctx.description, result.issue.as_ref());

        if ctx.dry_run {
            result.plan(format!("checkout or create branch {branch}"));
            result.plan(format!("commit \"{}\"", message.lines().next().unwrap_or("")));
            result.plan(format!("push {branch} to {}", self.config.remote));
            return Ok(());
        }

        obs::emit_step("commit_and_push");
        if !self.vcs.is_dirty().await? {
            return Err(WorkflowError::NothingToCommit(ctx.description.clone()));
        }
        if self.vcs.branch_exists(&branch).await? {
            self.vcs.checkout(&branch).await?;
        } else {
            self.vcs.create_branch(&branch, None).await?;
        }
        self.vcs.stage_all().await?;
        result.commit = Some(self.vcs.commit(&message).await?);
        self.router.push_branch(&branch).await
    }

    async fn create_pr(&self, ctx: &PatchContext, result: &mut PatchResult) -> Result<()> {
        if !ctx.create_pr || result.pr.is_some() {
            return Ok(());
        }
        let branch = result.branch.clone().unwrap_or_default();
        if ctx.dry_run {
            result.plan(format!(
                "open pull request {branch} -> {} on the {} fork",
                result.base_branch, ctx.target_fork
            ));
            return Ok(());
        }

        obs::emit_step("create_pr");
        let mut request = PrRequest::new(&ctx.description, branch, &result.base_branch)
            .with_target(ctx.target_fork)
            .with_issue(result.issue.clone())
            .with_affected_files(result.affected_files.clone());
        request.title = ctx.pr_title.clone();

        let pr = self.router.open_pr(&request).await.map_err(|e| match e {
            WorkflowError::PrCreationFailed(_) => e,
            other => WorkflowError::PrCreationFailed(other.to_string()),
        })?;
        result.pr = Some(pr.pr);
        Ok(())
    }

    async fn consolidate(&self, ctx: &PatchContext, result: &mut PatchResult) {
        if !(ctx.auto_consolidate && ctx.create_pr) {
            return;
        }
        if ctx.dry_run {
            result.plan(format!(
                "consolidate open pull requests ({} strategy)",
                ctx.consolidation_strategy
            ));
            return;
        }
        let (Some(pr), Some(branch)) = (result.pr.clone(), result.branch.clone()) else {
            return;
        };

        obs::emit_step("consolidate");
        let input = ConsolidationInput {
            pr,
            branch,
            base: result.base_branch.clone(),
            target: ctx.target_fork,
            files: result.affected_files.clone(),
            strategy: ctx.consolidation_strategy,
        };
        let consolidator = Consolidator::new(
            self.vcs.as_ref(),
            &self.router,
            &self.config.remote,
            &self.config.consolidation_prefix,
        );
        let outcome = match consolidator.consolidate(&input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "consolidation failed, skipping");
                ConsolidationOutcome::skipped(e.to_string())
            }
        };
        result.consolidation = Some(outcome);
    }

    /// Put the working tree back: drop workflow changes on failure, return to
    /// the starting branch, pop the entry stash. Never fails.
    async fn restore(&self, result: &mut PatchResult, start_branch: &str, failed: bool) {
        obs::emit_step("restore");
        if result.dry_run {
            if result.tree.dirty {
                result.plan("restore stashed changes");
            }
            return;
        }

        if failed {
            if let Err(e) = self.vcs.discard_changes().await {
                warn!(error = %e, "could not discard workflow changes");
            }
        }

        match self.vcs.current_branch().await {
            Ok(Some(current)) if current == start_branch => {}
            _ => {
                if let Err(e) = self.vcs.checkout(start_branch).await {
                    warn!(branch = %start_branch, error = %e, "could not return to starting branch");
                }
            }
        }

        if let Some(stash) = &result.tree.stash {
            match self.vcs.stash_pop(stash).await {
                Ok(()) => info!(stash = %stash.label, "restored stashed changes"),
                Err(e) => {
                    obs::emit_stash_restore_failed(&stash.label, &e);
                    result.stash_restored = false;
                }
            }
        }
    }
}

fn panic_message(join: tokio::task::JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("operation panicked: {s}")
    } else {
        "operation panicked".to_string()
    }
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.chars().take(SLUG_MAX_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("patch");
    }
    slug
}

fn generated_branch_name(description: &str) -> String {
    format!(
        "patch/{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        slugify(description)
    )
}

fn commit_message(description: &str, issue: Option<&IssueReference>) -> String {
    match issue {
        Some(issue) => format!("Patch: {description}\n\nRefs #{}", issue.number),
        None => format!("Patch: {description}"),
    }
}

fn issue_body(ctx: &PatchContext, result: &PatchResult) -> String {
    let mut body = format!(
        "## Patch\n\n{}\n\n**Priority:** {}\n",
        ctx.description, ctx.priority
    );

    if !result.affected_files.is_empty() {
        body.push_str("\n## Affected files\n\n");
        for file in &result.affected_files {
            body.push_str(&format!("- `{file}`\n"));
        }
    }

    let failed: Vec<&VerificationOutcome> =
        result.verification.iter().filter(|v| !v.passed).collect();
    if !failed.is_empty() {
        body.push_str("\n## Failed verification\n");
        for outcome in failed {
            body.push_str(&format!(
                "\n### `{}` (exit {})\n\n```\n{}\n```\n",
                outcome.command, outcome.exit_code, outcome.output
            ));
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix: NPE in parser!"), "fix-npe-in-parser");
        assert_eq!(slugify("   "), "patch");
        assert_eq!(slugify(&"a".repeat(60)).len(), SLUG_MAX_LEN);
    }

    #[test]
    fn test_generated_branch_name_shape() {
        let name = generated_branch_name("Bump deps");
        assert!(name.starts_with("patch/"));
        assert!(name.ends_with("-bump-deps"));
    }

    #[test]
    fn test_commit_message_refs_issue() {
        let issue = IssueReference {
            number: 12,
            url: None,
        };
        assert_eq!(commit_message("x", None), "Patch: x");
        assert_eq!(commit_message("x", Some(&issue)), "Patch: x\n\nRefs #12");
    }

    #[test]
    fn test_issue_body_includes_failed_verification() {
        let ctx = PatchContext::new("fix parser").with_priority(Priority::High);
        let mut result = PatchResult {
            workflow_id: "wf".to_string(),
            description: ctx.description.clone(),
            priority: ctx.priority,
            branch: None,
            base_branch: "main".to_string(),
            affected_files: ["src/parser.rs".to_string()].into_iter().collect(),
            commit: None,
            issue: None,
            pr: None,
            verification: Vec::new(),
            consolidation: None,
            tree: WorkingTreeState::default(),
            stash_restored: true,
            dry_run: false,
            planned: Vec::new(),
        };
        result.verification.push(VerificationOutcome {
            command: "cargo test".to_string(),
            exit_code: 101,
            output: "test parser::eof ... FAILED".to_string(),
            duration_ms: 5,
            passed: false,
        });

        let body = issue_body(&ctx, &result);
        assert!(body.contains("**Priority:** high"));
        assert!(body.contains("- `src/parser.rs`"));
        assert!(body.contains("`cargo test` (exit 101)"));
        assert!(body.contains("parser::eof ... FAILED"));
    }

    #[test]
    fn test_panic_message_from_join_error() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let join = rt
            .block_on(tokio::task::spawn_blocking(|| panic!("boom")))
            .unwrap_err();
        assert_eq!(panic_message(join), "operation panicked: boom");
    }
}
