//! Consolidation of open patch pull requests.
//!
//! A new patch PR is merged into the rolling consolidation PR when one is
//! open. Otherwise a fresh `consolidation/<timestamp>` branch collects the new
//! branch plus every open PR the strategy selects, and a combined PR is
//! opened for it.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::VcsBackend;
use crate::error::Result;
use crate::model::{ConsolidationStrategy, ForkTarget, OpenPullRequest, PrReference};
use crate::router::{ForkRouter, PrRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    Consolidated {
        /// Consolidation branch the patch landed in.
        into: String,
        /// PR of the consolidation branch.
        pr: Option<PrReference>,
        /// Numbers of the PRs merged into it.
        merged: Vec<u64>,
    },
    Skipped {
        reason: String,
    },
}

impl ConsolidationOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ConsolidationOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// The freshly opened patch PR.
#[derive(Debug, Clone)]
pub struct ConsolidationInput {
    pub pr: PrReference,
    pub branch: String,
    pub base: String,
    pub target: ForkTarget,
    pub files: BTreeSet<String>,
    pub strategy: ConsolidationStrategy,
}

pub struct Consolidator<'a> {
    vcs: &'a dyn VcsBackend,
    router: &'a ForkRouter,
    remote: &'a str,
    prefix: &'a str,
}

impl<'a> Consolidator<'a> {
    pub fn new(
        vcs: &'a dyn VcsBackend,
        router: &'a ForkRouter,
        remote: &'a str,
        prefix: &'a str,
    ) -> Self {
        Self {
            vcs,
            router,
            remote,
            prefix,
        }
    }

    /// Consolidate `input` with the open PRs of its target repository.
    ///
    /// Whatever happens, the branch checked out on entry is checked out again
    /// before returning.
    pub async fn consolidate(&self, input: &ConsolidationInput) -> Result<ConsolidationOutcome> {
        let start = self.vcs.current_branch().await?;
        let outcome = self.run(input).await;

        if let Some(branch) = start {
            if self.vcs.current_branch().await?.as_deref() != Some(branch.as_str()) {
                self.vcs.checkout(&branch).await?;
            }
        }
        outcome
    }

    async fn run(&self, input: &ConsolidationInput) -> Result<ConsolidationOutcome> {
        let target = self.router.resolve_target(input.target).await?;
        let open: Vec<OpenPullRequest> = self
            .router
            .hosting()
            .list_open_prs(&target.repo)
            .await?
            .into_iter()
            .filter(|pr| pr.number != input.pr.number)
            .collect();

        if let Some(rolling) = open.iter().find(|pr| pr.head_branch.starts_with(self.prefix)) {
            return self.merge_into_rolling(input, rolling).await;
        }

        let author = match input.strategy {
            ConsolidationStrategy::SameAuthor => self.router.hosting().current_user().await?,
            _ => String::new(),
        };
        let candidates = select_candidates(&open, input, &author);
        if candidates.is_empty() {
            return Ok(ConsolidationOutcome::skipped(format!(
                "no open pull requests match the {} strategy",
                input.strategy
            )));
        }
        self.open_consolidation(input, &candidates).await
    }

    async fn merge_into_rolling(
        &self,
        input: &ConsolidationInput,
        rolling: &OpenPullRequest,
    ) -> Result<ConsolidationOutcome> {
        let branch = &rolling.head_branch;
        info!(into = %branch, pr = rolling.number, "merging patch into rolling consolidation");

        self.vcs.fetch(self.remote).await?;
        if self.vcs.branch_exists(branch).await? {
            self.vcs.checkout(branch).await?;
        } else {
            let start = format!("{}/{branch}", self.remote);
            self.vcs.create_branch(branch, Some(&start)).await?;
        }

        if !self.vcs.merge(&input.branch).await? {
            self.vcs.merge_abort().await?;
            return Ok(ConsolidationOutcome::skipped(format!(
                "{} conflicts with {branch}",
                input.branch
            )));
        }
        self.vcs.push(self.remote, branch, false).await?;

        Ok(ConsolidationOutcome::Consolidated {
            into: branch.clone(),
            pr: Some(PrReference {
                number: rolling.number,
                url: None,
            }),
            merged: vec![input.pr.number],
        })
    }

    async fn open_consolidation(
        &self,
        input: &ConsolidationInput,
        candidates: &[&OpenPullRequest],
    ) -> Result<ConsolidationOutcome> {
        let branch = format!(
            "{}{}",
            self.prefix,
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let start = format!("{}/{}", self.remote, input.base);

        self.vcs.fetch(self.remote).await?;
        self.vcs.create_branch(&branch, Some(&start)).await?;

        if !self.vcs.merge(&input.branch).await? {
            self.vcs.merge_abort().await?;
            self.discard_branch(&branch, &input.branch).await?;
            return Ok(ConsolidationOutcome::skipped(format!(
                "{} does not merge cleanly onto {start}",
                input.branch
            )));
        }

        let mut merged = vec![input.pr.number];
        let mut lines = vec![format!("- #{} ({})", input.pr.number, input.branch)];
        for candidate in candidates {
            // Heads of PRs opened from other forks are not on our remote.
            let head = format!("{}/{}", self.remote, candidate.head_branch);
            if self.vcs.rev_parse(&head).await?.is_none() {
                warn!(pr = candidate.number, head = %head, "candidate head not available, skipping");
                continue;
            }
            match self.vcs.merge(&head).await {
                Ok(true) => {
                    merged.push(candidate.number);
                    lines.push(format!("- #{} {}", candidate.number, candidate.title));
                }
                Ok(false) => {
                    warn!(pr = candidate.number, "consolidation merge conflicted, skipping");
                    self.vcs.merge_abort().await?;
                }
                Err(e) => {
                    warn!(pr = candidate.number, error = %e, "consolidation merge failed, skipping");
                }
            }
        }

        if merged.len() < 2 {
            self.discard_branch(&branch, &input.branch).await?;
            return Ok(ConsolidationOutcome::skipped(
                "no candidate merged cleanly with the new patch",
            ));
        }

        self.vcs.push(self.remote, &branch, true).await?;
        let description = format!("Consolidates:\n\n{}", lines.join("\n"));
        let request = PrRequest::new(description, branch.clone(), input.base.clone())
            .with_target(input.target)
            .with_title(format!("Consolidated: {} patches", merged.len()));
        let pr = self.router.open_pr(&request).await?;

        Ok(ConsolidationOutcome::Consolidated {
            into: branch,
            pr: Some(pr.pr),
            merged,
        })
    }

    /// Leave and delete an unused consolidation branch.
    async fn discard_branch(&self, branch: &str, fallback: &str) -> Result<()> {
        self.vcs.checkout(fallback).await?;
        self.vcs.delete_branch(branch).await
    }
}

/// Open PRs the strategy selects for consolidation with `input`.
fn select_candidates<'p>(
    open: &'p [OpenPullRequest],
    input: &ConsolidationInput,
    author: &str,
) -> Vec<&'p OpenPullRequest> {
    open.iter()
        .filter(|pr| match input.strategy {
            ConsolidationStrategy::Compatible => pr.files.is_disjoint(&input.files),
            ConsolidationStrategy::SameAuthor => pr.author == author,
            ConsolidationStrategy::All => true,
        })
        .collect()
}
