//! Value types shared by the workflows.
//!
//! Everything here is a transient, single-invocation value: created by one
//! workflow run, handed back to the caller in a result, never persisted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Working tree
// ---------------------------------------------------------------------------

/// Opaque handle to a stash entry created by a workflow.
///
/// Stash indices shift as entries are pushed and popped, so the handle keeps
/// the unique label and the backend resolves it at pop time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashRef {
    pub label: String,
}

impl StashRef {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// Dirty flag and stash token of the working tree at workflow entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingTreeState {
    pub dirty: bool,
    pub stash: Option<StashRef>,
}

// ---------------------------------------------------------------------------
// Branch relationship
// ---------------------------------------------------------------------------

/// How a local branch relates to its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    InSync,
    /// Local has commits the remote lacks.
    Ahead,
    /// Remote has commits local lacks.
    Behind,
    Diverged,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::InSync => "in sync",
            Classification::Ahead => "ahead",
            Classification::Behind => "behind",
            Classification::Diverged => "diverged",
        };
        f.write_str(s)
    }
}

/// Local/remote heads, their merge base, and the resulting classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRelationship {
    pub local_ref: String,
    pub remote_ref: String,
    pub merge_base: String,
    pub classification: Classification,
}

impl BranchRelationship {
    /// Classify a (local, remote, merge base) triple.
    ///
    /// Checks run in a fixed order, so exactly one classification is produced
    /// for any input.
    pub fn classify(local: &str, remote: &str, merge_base: &str) -> Classification {
        if local == remote {
            Classification::InSync
        } else if merge_base == remote {
            Classification::Ahead
        } else if merge_base == local {
            Classification::Behind
        } else {
            Classification::Diverged
        }
    }

    pub fn new(local_ref: String, remote_ref: String, merge_base: String) -> Self {
        let classification = Self::classify(&local_ref, &remote_ref, &merge_base);
        Self {
            local_ref,
            remote_ref,
            merge_base,
            classification,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository identity and fork chain
// ---------------------------------------------------------------------------

/// A repository on the hosting service, e.g. `octo/widgets`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Contributor fork → upstream → root. Only `current` is guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkChain {
    pub current: RepoRef,
    pub upstream: Option<RepoRef>,
    pub root: Option<RepoRef>,
}

impl ForkChain {
    pub fn standalone(current: RepoRef) -> Self {
        Self {
            current,
            upstream: None,
            root: None,
        }
    }

    /// Map a fork target onto a concrete repository, if the chain has one.
    pub fn resolve(&self, target: ForkTarget) -> Option<&RepoRef> {
        match target {
            ForkTarget::Current => Some(&self.current),
            ForkTarget::Upstream => self.upstream.as_ref(),
            ForkTarget::Root => self.root.as_ref(),
        }
    }
}

/// Identity of the working directory's repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    pub owner: String,
    pub name: String,
    pub remote: String,
    pub fork_chain: ForkChain,
}

/// Which repository in the fork chain a pull request targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkTarget {
    #[default]
    Current,
    Upstream,
    Root,
}

impl fmt::Display for ForkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForkTarget::Current => "current",
            ForkTarget::Upstream => "upstream",
            ForkTarget::Root => "root",
        };
        f.write_str(s)
    }
}

impl FromStr for ForkTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "current" => Ok(ForkTarget::Current),
            "upstream" => Ok(ForkTarget::Upstream),
            "root" => Ok(ForkTarget::Root),
            other => Err(format!(
                "unknown fork target '{other}' (expected current, upstream or root)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Patch metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Issue label attached to patches of this priority.
    pub fn label(self) -> String {
        format!("priority:{self}")
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// How open pull requests are picked for consolidation with a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStrategy {
    /// Pull requests whose changed files do not overlap.
    #[default]
    Compatible,
    /// Pull requests opened by the same author.
    SameAuthor,
    /// Every other open pull request.
    All,
}

impl fmt::Display for ConsolidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsolidationStrategy::Compatible => "compatible",
            ConsolidationStrategy::SameAuthor => "same-author",
            ConsolidationStrategy::All => "all",
        };
        f.write_str(s)
    }
}

impl FromStr for ConsolidationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "compatible" => Ok(ConsolidationStrategy::Compatible),
            "same-author" => Ok(ConsolidationStrategy::SameAuthor),
            "all" => Ok(ConsolidationStrategy::All),
            other => Err(format!("unknown consolidation strategy '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Hosting references
// ---------------------------------------------------------------------------

fn hosted_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https?://\S+?/(?:pull|issues)/(\d+)").expect("static regex is valid")
    })
}

/// Parse `gh` output that is either a full URL or a bare number.
fn parse_hosted_number(output: &str) -> Option<(u64, Option<String>)> {
    if let Some(caps) = hosted_url_pattern().captures(output) {
        let number = caps.get(1)?.as_str().parse::<u64>().ok()?;
        let url = caps.get(0).map(|m| m.as_str().to_string());
        return Some((number, url));
    }

    let last = output.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let number = last.trim_start_matches('#').parse::<u64>().ok()?;
    Some((number, None))
}

/// A pull request on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrReference {
    pub number: u64,
    pub url: Option<String>,
}

impl PrReference {
    /// Accepts `https://host/owner/repo/pull/42`, `42` or `#42`.
    pub fn parse(output: &str) -> Option<Self> {
        parse_hosted_number(output).map(|(number, url)| Self { number, url })
    }
}

impl fmt::Display for PrReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "#{} ({url})", self.number),
            None => write!(f, "#{}", self.number),
        }
    }
}

/// An issue on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReference {
    pub number: u64,
    pub url: Option<String>,
}

impl IssueReference {
    pub fn parse(output: &str) -> Option<Self> {
        parse_hosted_number(output).map(|(number, url)| Self { number, url })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Unknown,
    Pending,
    Success,
    Failure,
}

/// Open pull request as listed by the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPullRequest {
    pub number: u64,
    pub title: String,
    pub head_branch: String,
    pub author: String,
    pub files: BTreeSet<String>,
}

/// Arguments of a create-PR call against the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub repo: RepoRef,
    pub title: String,
    pub body: String,
    pub base: String,
    /// `branch` for same-repo PRs, `owner:branch` across forks.
    pub head: String,
}

/// Arguments of a create-issue call against the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewIssue {
    pub repo: RepoRef,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}
