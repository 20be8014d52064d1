//! Branch synchronization against the remote.
//!
//! A sync fetches, classifies the local branch against its remote
//! counterpart and optionally repairs it: force reset when diverged,
//! fast-forward when behind. It can also prune local branches with no remote
//! counterpart and audit tags.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::VcsBackend;
use crate::error::{Result, WorkflowError};
use crate::model::{BranchRelationship, Classification};
use crate::obs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Reset a diverged branch to the remote head.
    ///
    /// Uncommitted changes are destroyed by the reset: a dirty tree only
    /// produces a warning.
    pub force: bool,

    /// Delete local branches that have no remote counterpart.
    pub cleanup_orphaned: bool,

    /// Report duplicate local tags and local tags missing upstream.
    pub validate_tags: bool,

    /// Reset a branch that is strictly behind to the remote head, when the
    /// working tree is clean.
    pub fast_forward: bool,

    pub dry_run: bool,
}

/// Outcome of tag validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagValidation {
    pub local_count: usize,
    pub remote_count: usize,

    /// Groups of local tags that name the same version (`v1.0` and `1.0`).
    pub duplicates: Vec<Vec<String>>,

    /// Local tags the remote does not have.
    pub missing_upstream: Vec<String>,
}

impl TagValidation {
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.missing_upstream.is_empty()
    }

    fn compute(local: &[String], remote: &[String]) -> Self {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tag in local {
            groups.entry(normalize_tag(tag)).or_default().push(tag.clone());
        }
        let duplicates = groups
            .into_values()
            .filter(|names| names.len() > 1)
            .map(|mut names| {
                names.sort();
                names
            })
            .collect();

        let upstream: BTreeSet<&str> = remote.iter().map(String::as_str).collect();
        let mut missing_upstream: Vec<String> = local
            .iter()
            .filter(|tag| !upstream.contains(tag.as_str()))
            .cloned()
            .collect();
        missing_upstream.sort();

        Self {
            local_count: local.len(),
            remote_count: remote.len(),
            duplicates,
            missing_upstream,
        }
    }
}

fn normalize_tag(tag: &str) -> String {
    let lower = tag.to_lowercase();
    lower.strip_prefix('v').unwrap_or(&lower).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub branch: String,
    pub relationship: BranchRelationship,
    pub force_reset: bool,
    pub fast_forwarded: bool,
    pub orphaned_branches_removed: Vec<String>,
    pub tags: Option<TagValidation>,
    pub message: String,
    pub dry_run: bool,
    pub planned: Vec<String>,
}

pub struct BranchSynchronizer {
    vcs: Arc<dyn VcsBackend>,
    remote: String,
}

impl BranchSynchronizer {
    pub fn new(vcs: Arc<dyn VcsBackend>, remote: impl Into<String>) -> Self {
        Self {
            vcs,
            remote: remote.into(),
        }
    }

    /// Synchronize `branch` (default: the current branch) with the remote.
    pub async fn sync(&self, branch: Option<&str>, options: SyncOptions) -> Result<SyncResult> {
        let current = self
            .vcs
            .current_branch()
            .await?
            .filter(|b| !b.trim().is_empty());
        let branch = match branch {
            Some(b) if !b.trim().is_empty() => b.to_string(),
            _ => current.clone().ok_or(WorkflowError::NoCurrentBranch)?,
        };
        let on_branch = current.as_deref() == Some(branch.as_str());

        obs::emit_step("sync.fetch");
        self.vcs.fetch(&self.remote).await?;

        let remote_ref = format!("{}/{}", self.remote, branch);
        let local_rev = if on_branch { "HEAD" } else { branch.as_str() };
        let local = self
            .vcs
            .rev_parse(local_rev)
            .await?
            .ok_or_else(|| WorkflowError::InvalidCommitHash {
                reference: branch.clone(),
            })?;
        let remote = self
            .vcs
            .rev_parse(&remote_ref)
            .await?
            .ok_or_else(|| WorkflowError::UnknownRemoteBranch {
                branch: remote_ref.clone(),
            })?;
        let merge_base = self.vcs.merge_base(&local, &remote).await?;
        let relationship = BranchRelationship::new(local, remote, merge_base);
        info!(branch = %branch, classification = %relationship.classification, "classified branch");

        let mut result = SyncResult {
            message: format!(
                "{branch} is {} relative to {remote_ref}",
                relationship.classification
            ),
            branch: branch.clone(),
            relationship,
            force_reset: false,
            fast_forwarded: false,
            orphaned_branches_removed: Vec::new(),
            tags: None,
            dry_run: options.dry_run,
            planned: Vec::new(),
        };

        match result.relationship.classification {
            Classification::Diverged if options.force => {
                if self.vcs.is_dirty().await? {
                    warn!(branch = %branch, "working tree is dirty; force reset discards uncommitted changes");
                }
                self.reset_to_remote(
                    &mut result,
                    current.as_deref(),
                    &remote_ref,
                    options.dry_run,
                )
                .await?;
                result.force_reset = !options.dry_run;
            }
            Classification::Behind if options.fast_forward => {
                if self.vcs.is_dirty().await? {
                    warn!(branch = %branch, "working tree is dirty; skipping fast-forward");
                    result.message.push_str("; fast-forward skipped (dirty working tree)");
                } else {
                    self.reset_to_remote(
                        &mut result,
                        current.as_deref(),
                        &remote_ref,
                        options.dry_run,
                    )
                    .await?;
                    result.fast_forwarded = !options.dry_run;
                }
            }
            Classification::Diverged => {
                result.message.push_str("; use force to reset to the remote");
            }
            _ => {}
        }

        if options.cleanup_orphaned {
            self.cleanup_orphaned(&mut result, current.as_deref(), options.dry_run)
                .await?;
        }

        if options.validate_tags {
            let local_tags = self.vcs.local_tags().await?;
            let remote_tags = self.vcs.remote_tags(&self.remote).await?;
            let validation = TagValidation::compute(&local_tags, &remote_tags);
            if !validation.is_clean() {
                warn!(
                    duplicates = validation.duplicates.len(),
                    missing_upstream = validation.missing_upstream.len(),
                    "tag validation found problems"
                );
            }
            result.tags = Some(validation);
        }

        Ok(result)
    }

    /// Reset `result.branch` to `remote_ref`. A branch that is not checked
    /// out is switched to for the reset, then `current` is checked out again.
    /// From a detached HEAD the reset branch stays checked out.
    async fn reset_to_remote(
        &self,
        result: &mut SyncResult,
        current: Option<&str>,
        remote_ref: &str,
        dry_run: bool,
    ) -> Result<()> {
        let branch = result.branch.clone();
        let on_branch = current == Some(branch.as_str());
        if dry_run {
            if !on_branch {
                plan(result, format!("checkout {branch}"));
            }
            plan(result, format!("reset --hard {remote_ref}"));
            if let (false, Some(previous)) = (on_branch, current) {
                plan(result, format!("checkout {previous}"));
            }
            return Ok(());
        }
        if !on_branch {
            self.vcs.checkout(&branch).await?;
        }
        obs::emit_step("sync.reset");
        self.vcs.reset_hard(remote_ref).await?;
        result.message.push_str(&format!("; reset to {remote_ref}"));

        match (on_branch, current) {
            (true, _) => {}
            (false, Some(previous)) => self.vcs.checkout(previous).await?,
            (false, None) => result.message.push_str(&format!("; {branch} is now checked out")),
        }
        Ok(())
    }

    async fn cleanup_orphaned(
        &self,
        result: &mut SyncResult,
        current: Option<&str>,
        dry_run: bool,
    ) -> Result<()> {
        let remote_branches: BTreeSet<String> =
            self.vcs.remote_branches(&self.remote).await?.into_iter().collect();
        let orphaned: Vec<String> = self
            .vcs
            .local_branches()
            .await?
            .into_iter()
            .filter(|b| !remote_branches.contains(b))
            .filter(|b| Some(b.as_str()) != current && *b != result.branch)
            .collect();

        for name in orphaned {
            if dry_run {
                plan(result, format!("delete branch {name}"));
                continue;
            }
            self.vcs.delete_branch(&name).await?;
            info!(branch = %name, "deleted orphaned branch");
            result.orphaned_branches_removed.push(name);
        }
        Ok(())
    }
}

fn plan(result: &mut SyncResult, action: String) {
    obs::emit_dry_run(&action);
    result.planned.push(format!("would {action}"));
}
