//! Sanitized async process execution with streamed output.
//!
//! Every external invocation (pip, venv creation, hardware probes) goes
//! through [`run_sanitized`]: ambient interpreter variables are cleared, the
//! working directory is explicit, stdout/stderr are streamed line by line
//! (never buffered-then-read, so a chatty child cannot deadlock on a full
//! pipe), and the child is killed on timeout or when the future is dropped.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Interpreter variables cleared before every spawn so a child can never see
/// the host interpreter's package set.
const SANITIZED_VARS: &[&str] = &[
    "PYTHONHOME",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "VIRTUAL_ENV",
    "PIP_REQUIRE_VIRTUALENV",
];

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last few stderr lines, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join("\n")
    }
}

/// Run `program args...` with sanitized environment and explicit working
/// directory, streaming output until exit or `timeout`.
pub async fn run_sanitized<S, I, A>(
    program: S,
    args: I,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError>
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let label = program.as_ref().to_string_lossy().to_string();

    let mut cmd = Command::new(program.as_ref());
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in SANITIZED_VARS {
        cmd.env_remove(var);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: label.clone(),
        source,
    })?;

    // Drain both pipes concurrently with the wait; a child that fills one
    // pipe while we block on the other would deadlock otherwise.
    let stdout_task = child.stdout.take().map(|out| {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(out).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(program = %label, "{}", line);
                lines.push(line);
            }
            lines
        })
    });
    let stderr_task = child.stderr.take().map(|err| {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(err).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(program = %label, "[stderr] {}", line);
                lines.push(line);
            }
            lines
        })
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            return Err(ProcessError::Io {
                program: label,
                source,
            });
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(ProcessError::Timeout {
                program: label,
                secs: timeout.as_secs(),
            });
        }
    };

    let stdout = match stdout_task {
        Some(t) => t.await.unwrap_or_default().join("\n"),
        None => String::new(),
    };
    let stderr = match stderr_task {
        Some(t) => t.await.unwrap_or_default().join("\n"),
        None => String::new(),
    };

    Ok(CommandOutput {
        success: status.success(),
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let out = run_sanitized(
            "sh",
            ["-c", "echo hello; echo oops >&2"],
            Path::new("/tmp"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let err = run_sanitized(
            "sh",
            ["-c", "sleep 30"],
            Path::new("/tmp"),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = run_sanitized(
            "envlite-no-such-binary",
            Vec::<&str>::new(),
            Path::new("/tmp"),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_exit_code_preserved() {
        let out = run_sanitized(
            "sh",
            ["-c", "exit 3"],
            Path::new("/tmp"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, 3);
    }
}
