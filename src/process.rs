//! Synchronous execution of external filesystem tools.

use anyhow::{Context, Result};
use duct::cmd;
use std::time::{Duration, Instant};

use crate::common::shell::render_command;
use crate::ui::prelude::*;

/// Captured result of one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, for parsers that don't care which stream a line came from
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs a program to completion. Non-zero exits are not errors at this layer;
/// only failing to run the program at all is.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput>;
}

/// `ProcessRunner` backed by duct, with a hard upper bound on how long one
/// invocation may block the caller.
#[derive(Debug, Clone)]
pub struct DuctRunner {
    timeout: Duration,
    poll_interval: Duration,
}

impl DuctRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ProcessRunner for DuctRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput> {
        let rendered = render_command(program, args);
        emit(Level::Debug, "process.run", &format!("Running {rendered}"), None);

        let handle = cmd(program, args)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .with_context(|| format!("Failed to execute {program}"))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(output) = handle
                .try_wait()
                .with_context(|| format!("Failed waiting for {program}"))?
            {
                let result = ToolOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                emit(
                    Level::Debug,
                    "process.finished",
                    &format!("{rendered} exited with {:?}", result.status),
                    None,
                );
                return Ok(result);
            }

            if Instant::now() >= deadline {
                let _ = handle.kill();
                anyhow::bail!(
                    "{rendered} did not finish within {} seconds",
                    self.timeout.as_secs()
                );
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
