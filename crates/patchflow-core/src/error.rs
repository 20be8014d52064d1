//! Error taxonomy for patchflow workflows.

use std::fmt;

use crate::model::ForkTarget;

/// Coarse classification of a [`WorkflowError`], used for exit codes and for
/// deciding whether a failure happened before or after mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any mutation (missing branch, bad parameter, bad ref).
    Precondition,
    /// A git command exited non-zero.
    BackendFailure,
    /// Unresolved merge-conflict markers in the working tree.
    ConflictDetected,
    /// The hosting API refused or failed (issue/PR create, auth).
    RemoteCoordinationFailure,
    /// The caller-supplied patch operation failed.
    OperationFailed,
}

impl ErrorKind {
    /// Process exit code for this kind of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Precondition => 2,
            ErrorKind::BackendFailure => 3,
            ErrorKind::ConflictDetected => 4,
            ErrorKind::RemoteCoordinationFailure => 5,
            ErrorKind::OperationFailed => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::ConflictDetected => "conflict_detected",
            ErrorKind::RemoteCoordinationFailure => "remote_coordination_failure",
            ErrorKind::OperationFailed => "operation_failed",
        };
        f.write_str(s)
    }
}

/// Errors produced by the patch, sync, rollback, routing and release workflows.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("no current branch (detached HEAD or empty repository)")]
    NoCurrentBranch,

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid commit hash or reference: {reference}")]
    InvalidCommitHash { reference: String },

    #[error("remote branch not found: {branch}")]
    UnknownRemoteBranch { branch: String },

    #[error("switching to base branch {base} was not confirmed")]
    ConfirmationDeclined { base: String },

    #[error("nothing to commit for patch: {0}")]
    NothingToCommit(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("repository identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("target fork {target} is not part of the fork chain of {current}")]
    TargetForkUnavailable { target: String, current: String },

    #[error("releases can only target the current repository, not {0}")]
    UnsupportedReleaseTarget(ForkTarget),

    #[error("unresolved merge conflicts in {} file(s): {}", files.len(), files.join(", "))]
    MergeConflictsDetected { files: Vec<String> },

    #[error("patch operation failed: {cause}")]
    PatchOperationFailed { cause: String },

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("push of {branch} failed: {message}")]
    PushFailed { branch: String, message: String },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("hosting API call {call} failed: {message}")]
    Hosting { call: String, message: String },

    #[error("issue creation failed: {0}")]
    IssueCreationFailed(String),

    #[error("pull request creation failed: {0}")]
    PrCreationFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::NoCurrentBranch
            | WorkflowError::MissingParameter(_)
            | WorkflowError::InvalidCommitHash { .. }
            | WorkflowError::UnknownRemoteBranch { .. }
            | WorkflowError::ConfirmationDeclined { .. }
            | WorkflowError::NothingToCommit(_)
            | WorkflowError::InvalidVersion(_)
            | WorkflowError::IdentityUnavailable(_)
            | WorkflowError::TargetForkUnavailable { .. }
            | WorkflowError::UnsupportedReleaseTarget(_) => ErrorKind::Precondition,
            WorkflowError::MergeConflictsDetected { .. } => ErrorKind::ConflictDetected,
            WorkflowError::PatchOperationFailed { .. } => ErrorKind::OperationFailed,
            WorkflowError::FetchFailed(_)
            | WorkflowError::PushFailed { .. }
            | WorkflowError::Git { .. }
            | WorkflowError::Io(_) => ErrorKind::BackendFailure,
            WorkflowError::Hosting { .. }
            | WorkflowError::IssueCreationFailed(_)
            | WorkflowError::PrCreationFailed(_) => ErrorKind::RemoteCoordinationFailure,
        }
    }

    pub(crate) fn git(command: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Git {
            command: command.into(),
            message: message.into(),
        }
    }

    pub(crate) fn hosting(call: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Hosting {
            call: call.into(),
            message: message.into(),
        }
    }
}

/// Result type for patchflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_error_lists_files() {
        let err = WorkflowError::MergeConflictsDetected {
            files: vec!["src/lib.rs".to_string(), "README.md".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 file(s)"));
        assert!(msg.contains("src/lib.rs"));
        assert!(msg.contains("README.md"));
        assert_eq!(err.kind(), ErrorKind::ConflictDetected);
    }

    #[test]
    fn test_git_error_keeps_command_message() {
        let err = WorkflowError::git("push origin main", "remote: permission denied");
        assert!(err.to_string().contains("remote: permission denied"));
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
    }

    #[test]
    fn test_kinds_map_to_distinct_exit_codes() {
        let kinds = [
            ErrorKind::Precondition,
            ErrorKind::BackendFailure,
            ErrorKind::ConflictDetected,
            ErrorKind::RemoteCoordinationFailure,
            ErrorKind::OperationFailed,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_precondition_errors() {
        assert_eq!(
            WorkflowError::InvalidCommitHash {
                reference: "nope".to_string()
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            WorkflowError::TargetForkUnavailable {
                target: "upstream".to_string(),
                current: "me/repo".to_string()
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            WorkflowError::PrCreationFailed("401".to_string()).kind(),
            ErrorKind::RemoteCoordinationFailure
        );
    }
}
