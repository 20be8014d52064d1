//! Release workflow: bump the version file through a patch PR, wait for the
//! merge, then tag the merged base branch.
//!
//! The current version is read from the committed base branch, never from the
//! working tree. The tag is only ever created after the PR is observed merged.
//! A merge that does not happen within `max_wait` is reported as a timeout,
//! not an error.
//!
//! Releases target the current repository only: the tag is cut from
//! `<remote>/<base>` and pushed to `<remote>`, which is where the PR merges.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::{Result, WorkflowError};
use crate::model::{ForkTarget, PipelineStatus, PrReference, PrState, RepoRef};
use crate::obs;
use crate::patch::{PatchContext, PatchOperation, PatchResult, PatchWorkflow};
use crate::version::{parse_version_file, write_version_file, Version, VersionRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub version: VersionRequest,
    pub description: String,
    pub wait_for_merge: bool,
    pub auto_merge: bool,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub target_fork: ForkTarget,
    pub force: bool,
    pub dry_run: bool,
}

impl ReleaseRequest {
    /// Request with the merge wait settings taken from `config`.
    pub fn new(version: VersionRequest, description: impl Into<String>, config: &WorkflowConfig) -> Self {
        Self {
            version,
            description: description.into(),
            wait_for_merge: true,
            auto_merge: false,
            max_wait: config.max_wait,
            poll_interval: config.poll_interval,
            target_fork: ForkTarget::Current,
            force: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleasePlan {
    pub current_version: Version,
    pub request: VersionRequest,
    pub new_version: Version,
    pub pr: Option<PrReference>,
    pub tag: Option<String>,
    pub pipeline: PipelineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseResult {
    pub plan: ReleasePlan,
    pub patch: PatchResult,
    pub pr_merged: bool,
    pub pr_merge_timeout: bool,
    pub auto_merge_failed: bool,
    pub tag_created: bool,
    pub dry_run: bool,
}

pub struct ReleaseWorkflow {
    patch: PatchWorkflow,
}

impl ReleaseWorkflow {
    pub fn new(patch: PatchWorkflow) -> Self {
        Self { patch }
    }

    pub fn patch_workflow(&self) -> &PatchWorkflow {
        &self.patch
    }

    pub async fn release(&mut self, request: ReleaseRequest) -> Result<ReleaseResult> {
        let id = Uuid::new_v4().to_string();
        let span = obs::workflow_span("release", &id);
        span.in_scope(|| obs::emit_workflow_started("release", &id, request.dry_run));
        let clock = Instant::now();

        let outcome = self.execute(request).instrument(span.clone()).await;

        span.in_scope(|| {
            obs::emit_workflow_finished(
                "release",
                &id,
                clock.elapsed().as_millis() as u64,
                outcome.is_ok(),
            )
        });
        outcome
    }

    async fn execute(&mut self, request: ReleaseRequest) -> Result<ReleaseResult> {
        if request.description.trim().is_empty() {
            return Err(WorkflowError::MissingParameter("description".to_string()));
        }

        if request.target_fork != ForkTarget::Current {
            return Err(WorkflowError::UnsupportedReleaseTarget(request.target_fork));
        }

        let version_file = self.patch.config().version_file.clone();
        let current = self.base_version(&version_file.to_string_lossy()).await?;
        let new_version = request.version.next(current)?;
        info!(current = %current, new = %new_version, "planned release");

        let ctx = PatchContext::new(&request.description)
            .with_branch(format!("release/{}", new_version.tag()))
            .with_pr_title(format!("Release {}", new_version.tag()))
            .with_affected_files([version_file.to_string_lossy().to_string()])
            .with_target_fork(request.target_fork)
            .with_create_issue(false)
            .with_create_pr(true)
            .with_force(request.force)
            .with_dry_run(request.dry_run);
        let operation: PatchOperation = Box::new(move |dir: &std::path::Path| -> anyhow::Result<()> {
            write_version_file(&dir.join(&version_file), new_version)?;
            Ok(())
        });
        let mut patch = self.patch.run(ctx, operation).await?;

        let mut result = ReleaseResult {
            plan: ReleasePlan {
                current_version: current,
                request: request.version,
                new_version,
                pr: patch.pr.clone(),
                tag: None,
                pipeline: PipelineStatus::Unknown,
            },
            patch: patch.clone(),
            pr_merged: false,
            pr_merge_timeout: false,
            auto_merge_failed: false,
            tag_created: false,
            dry_run: request.dry_run,
        };

        if request.dry_run {
            if request.auto_merge {
                plan(&mut patch, "merge the release pull request");
            }
            if request.wait_for_merge {
                plan(
                    &mut patch,
                    format!("wait up to {}s for the merge", request.max_wait.as_secs()),
                );
            }
            plan(&mut patch, format!("create and push tag {}", new_version.tag()));
            result.patch = patch;
            return Ok(result);
        }

        let pr = patch
            .pr
            .clone()
            .ok_or_else(|| WorkflowError::PrCreationFailed("no release pull request".to_string()))?;
        let repo = self
            .patch
            .router()
            .resolve_target(request.target_fork)
            .await?
            .repo;

        if request.auto_merge {
            if let Err(e) = self.patch.router().hosting().merge_pr(&repo, pr.number).await {
                warn!(pr = pr.number, error = %e, "auto-merge failed");
                result.auto_merge_failed = true;
            }
        }

        let state = if request.wait_for_merge {
            self.wait_for_merge(&repo, pr.number, request.poll_interval, request.max_wait)
                .await
        } else {
            Some(self.pr_state(&repo, pr.number).await)
        };

        match state {
            None => {
                warn!(pr = pr.number, "release PR not merged before the deadline; no tag created");
                result.pr_merge_timeout = true;
            }
            Some(PrState::Merged) => {
                result.pr_merged = true;
                let tag = self.tag_release(new_version).await?;
                result.tag_created = true;
                result.plan.pipeline = self.pipeline(&repo, &tag).await;
                result.plan.tag = Some(tag);
            }
            Some(PrState::Closed) => {
                warn!(pr = pr.number, "release PR was closed without merging; no tag created");
            }
            Some(PrState::Open) => {
                info!(pr = pr.number, "release PR is open; tag it after merging");
            }
        }
        Ok(result)
    }

    /// Version committed on the base branch, preferring the remote-tracking
    /// ref after a fetch over the local branch.
    async fn base_version(&self, version_file: &str) -> Result<Version> {
        let vcs = self.patch.vcs();
        let config = self.patch.config();
        vcs.fetch(&config.remote).await?;

        let tracking = format!("{}/{}", config.remote, config.base_branch);
        for rev in [tracking.as_str(), config.base_branch.as_str()] {
            if let Some(raw) = vcs.show_file(rev, version_file).await? {
                return parse_version_file(&raw, &format!("{rev}:{version_file}"));
            }
        }
        Err(WorkflowError::InvalidVersion(format!(
            "{version_file} not found on {tracking} or {}",
            config.base_branch
        )))
    }

    async fn pr_state(&self, repo: &RepoRef, number: u64) -> PrState {
        match self.patch.router().hosting().pr_state(repo, number).await {
            Ok(state) => state,
            Err(e) => {
                warn!(pr = number, error = %e, "could not query PR state");
                PrState::Open
            }
        }
    }

    /// Poll until the PR leaves the open state. `None` when `max_wait` elapses
    /// first.
    async fn wait_for_merge(
        &self,
        repo: &RepoRef,
        number: u64,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Option<PrState> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let state = self.pr_state(repo, number).await;
            if state != PrState::Open {
                return Some(state);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn tag_release(&self, version: Version) -> Result<String> {
        let vcs = self.patch.vcs();
        let config = self.patch.config();
        let tag = version.tag();
        let target = format!("{}/{}", config.remote, config.base_branch);

        obs::emit_step("tag");
        vcs.fetch(&config.remote).await?;
        vcs.create_annotated_tag(&tag, &format!("Release {tag}"), &target)
            .await?;
        vcs.push_tag(&config.remote, &tag).await?;
        info!(tag = %tag, target = %target, "tagged release");
        Ok(tag)
    }

    async fn pipeline(&self, repo: &RepoRef, tag: &str) -> PipelineStatus {
        match self.patch.router().hosting().pipeline_status(repo, tag).await {
            Ok(status) => status,
            Err(e) => {
                warn!(tag = %tag, error = %e, "could not query pipeline status");
                PipelineStatus::Unknown
            }
        }
    }
}

fn plan(patch: &mut PatchResult, action: impl Into<String>) {
    let action = action.into();
    obs::emit_dry_run(&action);
    patch.planned.push(format!("would {action}"));
}
