//! Completion notification sinks for detached jobs
//!
//! Sinks are fire-and-forget: the background runner logs a failed
//! notification and moves on.

use crate::background::JobCompletion;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Receives `(job id, exit code, artifact path)` when a detached job settles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a completion notice
    async fn notify(&self, completion: &JobCompletion) -> Result<()>;
}

/// Human-readable completion notice
#[must_use]
pub fn completion_message(completion: &JobCompletion) -> String {
    format!(
        "[{}] Background task finished (Exit {}). Output saved to: {}",
        completion.job_id,
        completion.exit_code,
        completion.artifact.display()
    )
}

/// Sink that only records the completion in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, completion: &JobCompletion) -> Result<()> {
        info!(
            job_id = %completion.job_id,
            exit_code = completion.exit_code,
            artifact = %completion.artifact.display(),
            "Background task finished"
        );
        Ok(())
    }
}

/// Sink that flashes the notice in a tmux pane via `tmux display-message`
#[derive(Debug, Clone)]
pub struct TmuxNotifier {
    program: String,
    target: String,
}

impl TmuxNotifier {
    /// Notify the pane addressed by `target` (e.g. `main:0.0`)
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            program: "tmux".to_string(),
            target: target.into(),
        }
    }

    /// Use a different tmux binary
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Pane target
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl NotificationSink for TmuxNotifier {
    async fn notify(&self, completion: &JobCompletion) -> Result<()> {
        let message = completion_message(completion);
        let output = Command::new(&self.program)
            .args(["display-message", "-t", &self.target, &message])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} display-message exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }
}
