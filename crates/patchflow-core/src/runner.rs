//! Shell execution of patch verification commands.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;

/// Characters of combined output kept on a verification outcome.
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Result of one verification command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    /// Command line as given.
    pub command: String,

    /// Exit code (-1 when killed by a signal, timed out or failed to start).
    pub exit_code: i32,

    /// Tail of stdout followed by stderr.
    pub output: String,

    pub duration_ms: u64,

    pub passed: bool,
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Runs verification commands through the platform shell.
pub struct CommandRunner;

impl CommandRunner {
    /// Run `command` in `dir`. Never fails: spawn errors and timeouts become a
    /// failed outcome, since verification is informational.
    pub async fn run_shell(command: &str, dir: &Path, timeout: Option<Duration>) -> VerificationOutcome {
        let start = Instant::now();
        let failed = |output: String, start: Instant| VerificationOutcome {
            command: command.to_string(),
            exit_code: -1,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            passed: false,
        };

        let child = match shell(command)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return failed(format!("failed to start: {e}"), start),
        };

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    return failed(format!("timed out after {} seconds", limit.as_secs()), start)
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match waited {
            Ok(output) => output,
            Err(e) => return failed(format!("failed to wait: {e}"), start),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        VerificationOutcome {
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            output: tail(combined.trim(), OUTPUT_TAIL_CHARS),
            duration_ms: start.elapsed().as_millis() as u64,
            passed: output.status.success(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandRunner::run_shell("echo hello", dir.path(), None).await;
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandRunner::run_shell("echo broken >&2; exit 3", dir.path(), None).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let outcome =
            CommandRunner::run_shell("sleep 5", dir.path(), Some(Duration::from_millis(100))).await;
        assert!(!outcome.passed);
        assert!(outcome.output.contains("timed out"));
    }
}
