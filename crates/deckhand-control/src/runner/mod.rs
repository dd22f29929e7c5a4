//! External command execution.
//!
//! Components that shell out (`systemctl`, `useradd`, `nginx -t`) go through a
//! [`CommandRunner`] so they can be exercised without touching the host.

mod recording;

pub use recording::{RecordedCall, RecordingRunner};

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControlError, ControlResult};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given stderr.
    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Trimmed stderr, for error messages.
    #[must_use]
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`]; an
    /// `Err` means the command could not be run at all.
    async fn run(&self, program: &str, args: &[&str]) -> ControlResult<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    cancel: CancellationToken,
}

impl SystemRunner {
    /// Create a runner that kills in-flight commands when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> ControlResult<CommandOutput> {
        let line = render(program, args);
        if self.cancel.is_cancelled() {
            debug!(command = %line, "not starting command; cancelled");
            return Err(ControlError::Cancelled {
                applied: Vec::new(),
            });
        }

        debug!(command = %line, "running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::Command(format!("{line}: {e}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| ControlError::Command(format!("{line}: {e}")))?
            }
            () = self.cancel.cancelled() => {
                debug!(command = %line, "command killed; cancelled");
                return Err(ControlError::Cancelled {
                    applied: Vec::new(),
                });
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_owned()
    } else {
        format!("{program} {}", args.join(" "))
    }
}
