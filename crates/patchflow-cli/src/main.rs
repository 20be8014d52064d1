//! patchflow - patch, sync, rollback and release workflows for git repositories
//!
//! ## Commands
//!
//! - `sync-branch`: classify a branch against its remote and repair it
//! - `patch`: apply a change on a fresh branch and open an issue and PR
//! - `rollback`: undo the last commit, switch back, or reset to a commit
//! - `release`: bump the version file through a PR and tag the merge
//! - `create-pr`: open a PR for an existing branch
//! - `status`: current branch, working tree and fork chain

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use patchflow_core::config::{ENV_BASE_BRANCH, ENV_REMOTE, ENV_VERSION_FILE};
use patchflow_core::{
    BranchSynchronizer, BumpType, Confirmer, ConsolidationStrategy, ForkRouter, ForkTarget,
    GhCli, GhIdentityResolver, GitCli, HostingApi, IdentityResolver, IssueReference, PatchContext,
    PatchOperation, PatchWorkflow, PrRequest, Priority, ReleaseRequest, ReleaseWorkflow,
    RepositoryInspector, RollbackEngine, RollbackPlan, RollbackType, SyncOptions, VcsBackend,
    Version, VersionRequest, WorkflowConfig, WorkflowError,
};

#[derive(Parser, Debug)]
#[command(name = "patchflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Patch, sync, rollback and release workflows for git repositories", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Repository working tree
    #[arg(long, global = true, env = "PATCHFLOW_REPO", default_value = ".")]
    repo: PathBuf,

    /// Remote of the current repository
    #[arg(long, global = true, env = ENV_REMOTE)]
    remote: Option<String>,

    /// Base branch patches start from and releases target
    #[arg(long, global = true, env = ENV_BASE_BRANCH)]
    base_branch: Option<String>,

    /// Version file, relative to the repository root
    #[arg(long, global = true, env = ENV_VERSION_FILE)]
    version_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a branch against its remote counterpart and optionally repair it
    SyncBranch {
        /// Branch to sync (default: current branch)
        #[arg(long)]
        branch: Option<String>,

        /// Reset a diverged branch to the remote, discarding local work
        #[arg(long)]
        force: bool,

        /// Delete local branches with no remote counterpart
        #[arg(long)]
        cleanup_orphaned: bool,

        /// Report duplicate tags and tags missing upstream
        #[arg(long)]
        validate_tags: bool,

        /// Fast-forward a branch that is behind
        #[arg(long)]
        fast_forward: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Apply a change on a new branch, commit, push, and open an issue and PR
    Patch {
        #[arg(short, long)]
        description: String,

        /// Shell command that makes the change, run in the repository root
        #[arg(long)]
        operation: Option<String>,

        #[arg(long)]
        create_pr: bool,

        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        create_issue: bool,

        /// Continue when issue creation fails
        #[arg(long)]
        issue_best_effort: bool,

        #[arg(long)]
        dry_run: bool,

        /// Switch to the base branch without asking
        #[arg(long)]
        force: bool,

        #[arg(long, default_value = "medium")]
        priority: Priority,

        #[arg(long = "affected-file")]
        affected_files: Vec<String>,

        /// Verification command; may be repeated
        #[arg(long = "test-command")]
        test_commands: Vec<String>,

        /// Feature branch name (default: generated from the description)
        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        base: Option<String>,

        #[arg(long, default_value = "current")]
        target_fork: ForkTarget,

        /// Fold the new PR together with other open PRs
        #[arg(long)]
        auto_consolidate: bool,

        #[arg(long, default_value = "compatible")]
        consolidation_strategy: ConsolidationStrategy,
    },

    /// Roll back the current branch
    Rollback {
        #[arg(long = "type", value_name = "TYPE")]
        kind: RollbackType,

        /// Target of a specific-commit rollback
        #[arg(long)]
        commit_hash: Option<String>,

        /// Tag the old HEAD before rolling back
        #[arg(long)]
        create_backup: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Bump the version file through a PR and tag the merged base branch
    Release {
        #[arg(long, conflicts_with = "set_version", required_unless_present = "set_version")]
        bump: Option<BumpType>,

        /// Explicit new version
        #[arg(long = "version", value_name = "X.Y.Z")]
        set_version: Option<Version>,

        #[arg(short, long)]
        description: String,

        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        wait_for_merge: bool,

        /// Ask the hosting service to merge the release PR
        #[arg(long)]
        auto_merge: bool,

        #[arg(long)]
        max_wait_minutes: Option<u64>,

        #[arg(long)]
        poll_interval_secs: Option<u64>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        force: bool,
    },

    /// Push a branch and open a PR for it
    CreatePr {
        #[arg(short, long)]
        description: String,

        #[arg(long)]
        branch: String,

        #[arg(long)]
        base: Option<String>,

        #[arg(long, default_value = "current")]
        target_fork: ForkTarget,

        /// Issue the PR fixes
        #[arg(long)]
        issue: Option<u64>,

        #[arg(long = "affected-file")]
        affected_files: Vec<String>,

        #[arg(long)]
        title: Option<String>,
    },

    /// Show the current branch, working tree state and fork chain
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    patchflow_core::telemetry::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Exit status for a failed command: the workflow error kind when the chain
/// carries one, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WorkflowError>())
        .map(|e| e.kind().exit_code() as u8)
        .unwrap_or(1)
}

/// Backends and configuration shared by every subcommand.
struct Services {
    config: WorkflowConfig,
    vcs: Arc<dyn VcsBackend>,
    hosting: Arc<dyn HostingApi>,
    resolver: Arc<dyn IdentityResolver>,
}

impl Services {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = WorkflowConfig::from_env().context("invalid PATCHFLOW_* environment")?;
        if let Some(remote) = &cli.remote {
            config.remote = remote.clone();
        }
        if let Some(base) = &cli.base_branch {
            config.base_branch = base.clone();
        }
        if let Some(path) = &cli.version_file {
            config.version_file = path.clone();
        }

        let vcs: Arc<dyn VcsBackend> = Arc::new(GitCli::new(cli.repo.clone()));
        let hosting: Arc<dyn HostingApi> = Arc::new(GhCli::new(cli.repo.clone()));
        let resolver: Arc<dyn IdentityResolver> =
            Arc::new(GhIdentityResolver::new(vcs.clone(), config.remote.clone()));
        Ok(Self {
            config,
            vcs,
            hosting,
            resolver,
        })
    }

    fn router(&self) -> ForkRouter {
        ForkRouter::new(
            self.vcs.clone(),
            self.hosting.clone(),
            self.resolver.clone(),
            self.config.remote.clone(),
        )
    }

    fn patch_workflow(&self) -> PatchWorkflow {
        PatchWorkflow::new(
            self.vcs.clone(),
            self.router(),
            Arc::new(StdinConfirmer),
            self.config.clone(),
        )
        .with_synchronizer(BranchSynchronizer::new(
            self.vcs.clone(),
            self.config.remote.clone(),
        ))
    }
}

async fn run(cli: Cli) -> Result<()> {
    let services = Services::new(&cli)?;

    match cli.command {
        Commands::SyncBranch {
            branch,
            force,
            cleanup_orphaned,
            validate_tags,
            fast_forward,
            dry_run,
        } => {
            let options = SyncOptions {
                force,
                cleanup_orphaned,
                validate_tags,
                fast_forward,
                dry_run,
            };
            cmd_sync_branch(&services, branch.as_deref(), options).await
        }
        Commands::Patch {
            description,
            operation,
            create_pr,
            create_issue,
            issue_best_effort,
            dry_run,
            force,
            priority,
            affected_files,
            test_commands,
            branch,
            base,
            target_fork,
            auto_consolidate,
            consolidation_strategy,
        } => {
            let mut ctx = PatchContext::new(description)
                .with_priority(priority)
                .with_affected_files(affected_files)
                .with_target_fork(target_fork)
                .with_create_pr(create_pr)
                .with_create_issue(create_issue)
                .with_issue_best_effort(issue_best_effort)
                .with_dry_run(dry_run)
                .with_force(force);
            for command in test_commands {
                ctx = ctx.with_test_command(command);
            }
            if let Some(branch) = branch {
                ctx = ctx.with_branch(branch);
            }
            if let Some(base) = base {
                ctx = ctx.with_base_branch(base);
            }
            if auto_consolidate {
                ctx = ctx.with_auto_consolidate(consolidation_strategy);
            }
            cmd_patch(&services, ctx, operation).await
        }
        Commands::Rollback {
            kind,
            commit_hash,
            create_backup,
            dry_run,
        } => {
            cmd_rollback(
                &services,
                RollbackPlan::new(kind, commit_hash),
                create_backup,
                dry_run,
            )
            .await
        }
        Commands::Release {
            bump,
            set_version,
            description,
            wait_for_merge,
            auto_merge,
            max_wait_minutes,
            poll_interval_secs,
            dry_run,
            force,
        } => {
            let version = match (set_version, bump) {
                (Some(version), _) => VersionRequest::Explicit(version),
                (None, Some(bump)) => VersionRequest::Bump(bump),
                (None, None) => {
                    return Err(WorkflowError::MissingParameter(
                        "--bump or --version".to_string(),
                    )
                    .into())
                }
            };
            let mut request = ReleaseRequest::new(version, description, &services.config);
            request.wait_for_merge = wait_for_merge;
            request.auto_merge = auto_merge;
            request.dry_run = dry_run;
            request.force = force;
            if let Some(minutes) = max_wait_minutes {
                request.max_wait = Duration::from_secs(minutes * 60);
            }
            if let Some(secs) = poll_interval_secs {
                request.poll_interval = Duration::from_secs(secs);
            }
            cmd_release(&services, request).await
        }
        Commands::CreatePr {
            description,
            branch,
            base,
            target_fork,
            issue,
            affected_files,
            title,
        } => {
            let base = base.unwrap_or_else(|| services.config.base_branch.clone());
            let mut request = PrRequest::new(description, branch, base)
                .with_target(target_fork)
                .with_issue(issue.map(|number| IssueReference { number, url: None }))
                .with_affected_files(affected_files.into_iter().collect());
            if let Some(title) = title {
                request = request.with_title(title);
            }
            cmd_create_pr(&services, request).await
        }
        Commands::Status => cmd_status(&services).await,
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_sync_branch(
    services: &Services,
    branch: Option<&str>,
    options: SyncOptions,
) -> Result<()> {
    let synchronizer = BranchSynchronizer::new(services.vcs.clone(), services.config.remote.clone());
    let result = synchronizer
        .sync(branch, options)
        .await
        .context("sync-branch failed")?;
    info!(message = %result.message, "sync complete");
    print_json(&result)
}

async fn cmd_patch(services: &Services, ctx: PatchContext, operation: Option<String>) -> Result<()> {
    let mut workflow = services.patch_workflow();
    let operation = match operation {
        Some(command) => shell_operation(command),
        None => Box::new(|_dir: &Path| -> anyhow::Result<()> { Ok(()) }),
    };
    let result = workflow.run(ctx, operation).await.context("patch failed")?;
    print_json(&result)
}

async fn cmd_rollback(
    services: &Services,
    plan: RollbackPlan,
    create_backup: bool,
    dry_run: bool,
) -> Result<()> {
    let engine = RollbackEngine::new(services.vcs.clone(), services.config.stash_prefix.clone());
    let result = engine
        .rollback(plan, create_backup, dry_run)
        .await
        .context("rollback failed")?;
    if let Some(stash) = &result.stash {
        warn!(stash = %stash.label, "uncommitted changes were stashed; restore them with git stash pop");
    }
    print_json(&result)
}

async fn cmd_release(services: &Services, request: ReleaseRequest) -> Result<()> {
    let mut workflow = ReleaseWorkflow::new(services.patch_workflow());
    let result = workflow.release(request).await.context("release failed")?;
    if result.pr_merge_timeout {
        warn!("release PR was not merged in time; tag it once merged");
    }
    print_json(&result)
}

async fn cmd_create_pr(services: &Services, request: PrRequest) -> Result<()> {
    let result = services
        .router()
        .create_pr(&request)
        .await
        .context("create-pr failed")?;
    print_json(&result)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    branch: Option<String>,
    dirty: bool,
    identity: Option<patchflow_core::RepoIdentity>,
}

async fn cmd_status(services: &Services) -> Result<()> {
    let inspector = RepositoryInspector::new(services.vcs.clone(), services.resolver.clone());

    let branch = match inspector.current_branch().await {
        Ok(branch) => Some(branch),
        Err(WorkflowError::NoCurrentBranch) => None,
        Err(e) => return Err(e).context("could not read the current branch"),
    };
    let dirty = inspector.is_dirty().await.context("could not read the working tree")?;
    let identity = match inspector.identity().await {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!(error = %e, "repository identity unavailable");
            None
        }
    };
    print_json(&StatusReport {
        branch,
        dirty,
        identity,
    })
}

/// Patch operation that runs `command` through `sh -c` in the working tree.
fn shell_operation(command: String) -> PatchOperation {
    Box::new(move |dir: &Path| -> anyhow::Result<()> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(dir)
            .status()
            .with_context(|| format!("failed to spawn `{command}`"))?;
        if !status.success() {
            anyhow::bail!("`{command}` exited with {status}");
        }
        Ok(())
    })
}

/// Asks on stderr and reads a y/N answer from stdin.
struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, prompt: &str) -> bool {
        let mut stderr = std::io::stderr();
        if write!(stderr, "{prompt} [y/N] ").and_then(|_| stderr.flush()).is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("patchflow").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_patch_flags() {
        let cli = parse(&[
            "patch",
            "--description",
            "Fix EOF",
            "--create-issue=false",
            "--priority",
            "high",
            "--affected-file",
            "src/a.rs",
            "--affected-file",
            "src/b.rs",
            "--target-fork",
            "upstream",
        ]);
        match cli.command {
            Commands::Patch {
                create_issue,
                priority,
                affected_files,
                target_fork,
                ..
            } => {
                assert!(!create_issue);
                assert_eq!(priority, Priority::High);
                assert_eq!(affected_files, vec!["src/a.rs", "src/b.rs"]);
                assert_eq!(target_fork, ForkTarget::Upstream);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_release_requires_bump_or_version() {
        let err = Cli::try_parse_from(["patchflow", "release", "--description", "x"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = parse(&["release", "--version", "v2.0.0", "--description", "x"]);
        match cli.command {
            Commands::Release { set_version, .. } => {
                assert_eq!(set_version, Some(Version::new(2, 0, 0)))
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "patchflow",
            "release",
            "--bump",
            "minor",
            "--version",
            "2.0.0",
            "--description",
            "x",
        ])
        .is_err());

        let err = Cli::try_parse_from([
            "patchflow",
            "release",
            "--bump",
            "patch",
            "--description",
            "x",
            "--target-fork",
            "upstream",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_rollback_type_flag() {
        let cli = parse(&["rollback", "--type", "specific-commit", "--commit-hash", "abc123"]);
        match cli.command {
            Commands::Rollback {
                kind, commit_hash, ..
            } => {
                assert_eq!(kind, RollbackType::SpecificCommit);
                assert_eq!(commit_hash.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_exit_code_follows_error_kind() {
        let err = anyhow::Error::new(WorkflowError::NoCurrentBranch).context("patch failed");
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::new(WorkflowError::MergeConflictsDetected {
            files: vec!["a.rs".to_string()],
        });
        assert_eq!(exit_code(&err), 4);

        assert_eq!(exit_code(&anyhow::anyhow!("clap exploded")), 1);
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }

    #[test]
    fn test_shell_operation_reports_failure() {
        let dir = std::env::temp_dir();
        assert!(shell_operation("true".to_string())(dir.as_path()).is_ok());
        let err = shell_operation("exit 3".to_string())(dir.as_path()).unwrap_err();
        assert!(err.to_string().contains("exit 3"));
    }
}
