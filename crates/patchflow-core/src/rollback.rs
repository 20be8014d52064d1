//! Rollback of the checked-out branch.
//!
//! Targets are validated before anything is touched. A rollback can leave a
//! backup tag at the old HEAD, and uncommitted changes are stashed (and kept
//! stashed) rather than destroyed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::backend::VcsBackend;
use crate::error::{Result, WorkflowError};
use crate::model::StashRef;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    /// `reset --hard HEAD~1`
    LastCommit,
    /// `checkout -`
    PreviousBranch,
    /// `reset --hard <target>`
    SpecificCommit,
}

impl fmt::Display for RollbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackType::LastCommit => "last-commit",
            RollbackType::PreviousBranch => "previous-branch",
            RollbackType::SpecificCommit => "specific-commit",
        };
        f.write_str(s)
    }
}

impl FromStr for RollbackType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "last-commit" => Ok(RollbackType::LastCommit),
            "previous-branch" => Ok(RollbackType::PreviousBranch),
            "specific-commit" => Ok(RollbackType::SpecificCommit),
            other => Err(format!(
                "unknown rollback type '{other}' (expected last-commit, previous-branch or specific-commit)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub kind: RollbackType,

    /// Commit to reset to; required for `SpecificCommit`.
    pub target: Option<String>,

    /// Backup tag created at the old HEAD, once created.
    pub backup: Option<String>,
}

impl RollbackPlan {
    pub fn new(kind: RollbackType, target: Option<String>) -> Self {
        Self {
            kind,
            target,
            backup: None,
        }
    }

    pub fn last_commit() -> Self {
        Self::new(RollbackType::LastCommit, None)
    }

    pub fn previous_branch() -> Self {
        Self::new(RollbackType::PreviousBranch, None)
    }

    pub fn specific_commit(target: impl Into<String>) -> Self {
        Self::new(RollbackType::SpecificCommit, Some(target.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackResult {
    pub plan: RollbackPlan,
    pub previous_head: Option<String>,
    pub new_head: Option<String>,
    pub backup: Option<String>,

    /// Changes stashed before the rollback. Left on the stash for the caller.
    pub stash: Option<StashRef>,

    pub dry_run: bool,
    pub planned: Vec<String>,
}

pub struct RollbackEngine {
    vcs: Arc<dyn VcsBackend>,
    stash_prefix: String,
}

impl RollbackEngine {
    pub fn new(vcs: Arc<dyn VcsBackend>, stash_prefix: impl Into<String>) -> Self {
        Self {
            vcs,
            stash_prefix: stash_prefix.into(),
        }
    }

    pub async fn rollback(
        &self,
        plan: RollbackPlan,
        create_backup: bool,
        dry_run: bool,
    ) -> Result<RollbackResult> {
        let id = Uuid::new_v4().to_string();
        let span = obs::workflow_span("rollback", &id);
        span.in_scope(|| obs::emit_workflow_started("rollback", &id, dry_run));
        let clock = Instant::now();

        let outcome = self
            .execute(plan, create_backup, dry_run)
            .instrument(span.clone())
            .await;

        span.in_scope(|| {
            obs::emit_workflow_finished(
                "rollback",
                &id,
                clock.elapsed().as_millis() as u64,
                outcome.is_ok(),
            )
        });
        outcome
    }

    async fn execute(
        &self,
        mut plan: RollbackPlan,
        create_backup: bool,
        dry_run: bool,
    ) -> Result<RollbackResult> {
        obs::emit_step("validate");
        let reset_to = self.validate(&plan).await?;
        let previous_head = self.vcs.rev_parse("HEAD").await?;

        let mut result = RollbackResult {
            plan: plan.clone(),
            previous_head,
            new_head: None,
            backup: None,
            stash: None,
            dry_run,
            planned: Vec::new(),
        };

        let backup_name = format!(
            "backup/rollback-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let dirty = self.vcs.is_dirty().await?;

        if dry_run {
            let mut planned = Vec::new();
            if create_backup {
                planned.push(format!("create backup tag {backup_name}"));
            }
            if dirty {
                planned.push("stash uncommitted changes".to_string());
            }
            planned.push(match &reset_to {
                Some(rev) => format!("reset --hard {rev}"),
                None => "checkout the previous branch".to_string(),
            });
            for action in planned {
                obs::emit_dry_run(&action);
                result.planned.push(format!("would {action}"));
            }
            result.new_head = result.previous_head.clone();
            return Ok(result);
        }

        if create_backup {
            obs::emit_step("backup");
            match self.vcs.create_tag(&backup_name, "HEAD").await {
                Ok(()) => {
                    info!(tag = %backup_name, "created backup tag");
                    plan.backup = Some(backup_name.clone());
                    result.backup = Some(backup_name);
                }
                Err(e) => warn!(tag = %backup_name, error = %e, "backup tag creation failed"),
            }
        }

        if dirty {
            let label = format!("{}-rollback-{}", self.stash_prefix, Uuid::new_v4());
            let stash = self.vcs.stash_push(&label).await?;
            info!(stash = %label, "stashed uncommitted changes before rollback");
            result.stash = Some(stash);
        }

        obs::emit_step("rollback");
        match &reset_to {
            Some(rev) => self.vcs.reset_hard(rev).await?,
            None => self.vcs.checkout_previous().await?,
        }

        result.new_head = self.vcs.rev_parse("HEAD").await?;
        result.plan = plan;
        info!(
            kind = %result.plan.kind,
            new_head = result.new_head.as_deref().unwrap_or(""),
            "rollback complete"
        );
        Ok(result)
    }

    /// Check the plan and return the revision a reset should move to
    /// (`None` for a branch switch).
    async fn validate(&self, plan: &RollbackPlan) -> Result<Option<String>> {
        match plan.kind {
            RollbackType::LastCommit => {
                let parent = "HEAD~1";
                self.vcs
                    .verify_commit(parent)
                    .await?
                    .ok_or_else(|| WorkflowError::InvalidCommitHash {
                        reference: parent.to_string(),
                    })?;
                Ok(Some(parent.to_string()))
            }
            RollbackType::PreviousBranch => Ok(None),
            RollbackType::SpecificCommit => {
                let target = plan
                    .target
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        WorkflowError::MissingParameter(
                            "commit hash is required for a specific-commit rollback".to_string(),
                        )
                    })?;
                let sha = self.vcs.verify_commit(target).await?.ok_or_else(|| {
                    WorkflowError::InvalidCommitHash {
                        reference: target.to_string(),
                    }
                })?;
                Ok(Some(sha))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_type_parse() {
        assert_eq!(
            "last-commit".parse::<RollbackType>().unwrap(),
            RollbackType::LastCommit
        );
        assert_eq!(
            "specific_commit".parse::<RollbackType>().unwrap(),
            RollbackType::SpecificCommit
        );
        assert!("yesterday".parse::<RollbackType>().is_err());
    }

    #[test]
    fn test_plan_constructors() {
        let plan = RollbackPlan::specific_commit("abc123");
        assert_eq!(plan.kind, RollbackType::SpecificCommit);
        assert_eq!(plan.target.as_deref(), Some("abc123"));
        assert!(RollbackPlan::last_commit().target.is_none());
    }
}
