//! Structured observability hooks for workflow runs.
//!
//! - `workflow_span` tagging every event of a run with its id
//! - emitters for run start/finish, step transitions, dry-run plans and
//!   stash-restore failures

use tracing::{info, warn, Span};

/// Span tagging every event of one workflow run with its id and kind.
///
/// ```ignore
/// use tracing::Instrument;
/// run_steps().instrument(workflow_span("patch", &workflow_id)).await
/// ```
pub fn workflow_span(kind: &str, workflow_id: &str) -> Span {
    tracing::info_span!("patchflow.workflow", kind = %kind, workflow_id = %workflow_id)
}

/// A workflow run begins.
pub fn emit_workflow_started(kind: &str, workflow_id: &str, dry_run: bool) {
    info!(event = "workflow.started", kind = %kind, workflow_id = %workflow_id, dry_run = dry_run);
}

/// A state-machine step is about to run.
pub fn emit_step(step: &str) {
    info!(event = "workflow.step", step = %step);
}

/// A mutation skipped because of dry-run mode.
pub fn emit_dry_run(action: &str) {
    info!(event = "workflow.dry_run", action = %action, "would {action}");
}

/// A workflow run ended; `success` is false when it returned an error.
pub fn emit_workflow_finished(kind: &str, workflow_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "workflow.finished",
        kind = %kind,
        workflow_id = %workflow_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Stash restoration failed; the stash is left in place for manual recovery.
pub fn emit_stash_restore_failed(label: &str, error: &dyn std::fmt::Display) {
    warn!(event = "workflow.stash_restore_failed", stash = %label, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_workflow_span_create() {
        let span = workflow_span("patch", "wf-1");
        let _entered = span.enter();
        emit_step("preflight");
    }

    #[traced_test]
    #[test]
    fn test_dry_run_message() {
        emit_dry_run("push fix/eof");
        assert!(logs_contain("would push fix/eof"));
    }

    #[traced_test]
    #[test]
    fn test_finished_event_fields() {
        workflow_span("rollback", "wf-2").in_scope(|| {
            emit_workflow_finished("rollback", "wf-2", 15, false);
        });
        assert!(logs_contain("workflow.finished"));
        assert!(logs_contain("success=false"));
    }
}
