//! patchflow core library
//!
//! Patch, sync, rollback and release workflows over a git working tree and a
//! GitHub-style hosting service. The workflows talk to git and the hosting
//! service only through the traits in [`backend`].

pub mod backend;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod fakes;
pub mod git;
pub mod github;
pub mod inspector;
pub mod model;
pub mod obs;
pub mod patch;
pub mod release;
pub mod rollback;
pub mod router;
pub mod runner;
pub mod sync;
pub mod telemetry;
pub mod version;

pub use backend::{Confirmer, HostingApi, IdentityResolver, VcsBackend};
pub use config::WorkflowConfig;
pub use consolidate::{ConsolidationOutcome, Consolidator};
pub use error::{ErrorKind, Result, WorkflowError};
pub use git::GitCli;
pub use github::{GhCli, GhIdentityResolver};
pub use inspector::RepositoryInspector;
pub use model::{
    BranchRelationship, Classification, ConsolidationStrategy, ForkChain, ForkTarget,
    IssueReference, PipelineStatus, PrReference, PrState, Priority, RepoIdentity, RepoRef,
    StashRef, WorkingTreeState,
};
pub use patch::{
    PatchContext, PatchOperation, PatchResult, PatchWorkflow, WorkflowOutcome, WorkflowRecord,
};
pub use release::{ReleasePlan, ReleaseRequest, ReleaseResult, ReleaseWorkflow};
pub use rollback::{RollbackEngine, RollbackPlan, RollbackResult, RollbackType};
pub use router::{ForkRouter, IssueRequest, PrRequest, PrResult};
pub use runner::{CommandRunner, VerificationOutcome};
pub use sync::{BranchSynchronizer, SyncOptions, SyncResult, TagValidation};
pub use version::{BumpType, Version, VersionRequest};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
