//! External tool runner
//!
//! Commands are assembled as plain `std::process::Command` values by the
//! component builders (so their arguments can be inspected in tests) and
//! executed here on the tokio runtime, racing the child against the job's
//! cancellation token.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of trailing stderr lines kept in failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The executable could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully
    #[error("{program} exited with {}: {stderr}", describe_code(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The job was cancelled before or while the process ran
    #[error("operation cancelled")]
    Cancelled,
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "termination by signal".to_string(),
    }
}

impl ToolError {
    /// Exit code of a failed process, if it exited normally
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolError::Failed { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled)
    }
}

/// Create a command for an external tool with console windows suppressed
pub fn tool_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// Run a tool to completion, capturing stdout and stderr
///
/// The token is checked before spawning; if it fires while the child is
/// running the child is killed and `ToolError::Cancelled` is returned.
/// A non-zero exit becomes `ToolError::Failed` carrying the tail of stderr.
pub async fn run_tool(cmd: Command, cancel: &CancellationToken) -> Result<Output, ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(command = ?cmd, "spawning tool");

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Dropping the wait future on cancellation drops the child, which kills it.
    tokio::select! {
        output = child.wait_with_output() => {
            let output = output.map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

            if output.status.success() {
                Ok(output)
            } else {
                Err(ToolError::Failed {
                    program,
                    code: output.status.code(),
                    stderr: stderr_tail(&output.stderr),
                })
            }
        }
        _ = cancel.cancelled() => Err(ToolError::Cancelled),
    }
}

/// Keep the last few non-empty lines of a process's stderr
pub fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
