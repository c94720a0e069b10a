//! Session Manager
//!
//! Public entry point: one interpreter process, one foreground command at a
//! time, plus detached jobs that share the same gate.

use crate::background::{self, BackgroundJob};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::gate::{Gate, GatePermit};
use crate::notify::{LogNotifier, NotificationSink};
use crate::resolver::{
    EnvironmentProvisioner, ExecutableProbe, ExecutableResolver, ProcessOutcome,
    ResolvedExecutable, VenvProvisioner, VersionProbe,
};
use crate::supervisor::{Lifecycle, Supervisor};
use crate::workspace::{FsWorkspace, Workspace};
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Result of one submission
///
/// Interpreter exceptions surface here as traceback text in `stderr`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    /// Captured stdout (display of a trailing expression included)
    pub stdout: String,
    /// Captured, chrome-filtered stderr
    pub stderr: String,
    /// Identity of the interpreter that ran the code
    pub executable: String,
}

impl ExecutionOutput {
    /// Output with nothing captured
    #[must_use]
    pub fn empty(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    /// Whether nothing was captured on either stream
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Caller-facing text: stdout, a stderr section, and an executable footer
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        if !self.stdout.is_empty() {
            text.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("--- STDERR ---\n");
            text.push_str(&self.stderr);
        }
        if text.is_empty() {
            text.push_str("Code executed successfully with no output.");
        }
        text.push_str(&format!("\n(Executed using {})", self.executable));
        text
    }
}

struct Inner {
    config: Arc<SessionConfig>,
    gate: Gate,
    resolver: Arc<ExecutableResolver>,
    supervisor: Supervisor,
    workspace: Arc<dyn Workspace>,
    notifier: Arc<dyn NotificationSink>,
}

/// Handle to the session; clones share the same interpreter
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Builder for [`SessionManager`] with replaceable collaborators
pub struct SessionManagerBuilder {
    config: SessionConfig,
    probe: Arc<dyn ExecutableProbe>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    workspace: Arc<dyn Workspace>,
    notifier: Arc<dyn NotificationSink>,
}

impl SessionManagerBuilder {
    /// Replace the interpreter probe
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ExecutableProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the environment provisioner
    #[must_use]
    pub fn provisioner(mut self, provisioner: Arc<dyn EnvironmentProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Replace the workspace implementation
    #[must_use]
    pub fn workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = workspace;
        self
    }

    /// Replace the background completion sink
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Build a stopped session
    #[must_use]
    pub fn build(self) -> SessionManager {
        let config = Arc::new(self.config);
        let venv_dir = config.use_venv.then(|| config.venv_dir());
        let resolver = Arc::new(ExecutableResolver::with_collaborators(
            config.candidates.clone(),
            venv_dir,
            self.probe,
            self.provisioner,
        ));
        let supervisor = Supervisor::new(
            Arc::clone(&config),
            Arc::clone(&resolver),
            Arc::clone(&self.workspace),
        );
        SessionManager {
            inner: Arc::new(Inner {
                config,
                gate: Gate::new(),
                resolver,
                supervisor,
                workspace: self.workspace,
                notifier: self.notifier,
            }),
        }
    }
}

impl SessionManager {
    /// Session with the default collaborators
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building a session
    #[must_use]
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            probe: Arc::new(VersionProbe),
            provisioner: Arc::new(VenvProvisioner),
            workspace: Arc::new(FsWorkspace),
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current interpreter lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.supervisor.lifecycle()
    }

    /// Lifecycle transitions as they happen
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Lifecycle> {
        self.inner.supervisor.subscribe()
    }

    /// Identity of the running interpreter, `None` when stopped
    pub async fn executable(&self) -> Option<ResolvedExecutable> {
        self.inner.supervisor.executable().await
    }

    /// Whether a foreground command or detached job holds the session
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.gate.is_busy()
    }

    /// Start the interpreter if needed and return its identity
    pub async fn start(&self) -> Result<ResolvedExecutable> {
        self.inner.supervisor.ensure_started().await
    }

    /// Run `code` in the foreground
    ///
    /// Fails with [`Error::SessionBusy`] if another command is in flight.
    /// `timeout_ms` defaults to the configured deadline and is clamped to
    /// the configured maximum.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn execute(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionOutput> {
        let permit = self.inner.gate.try_acquire()?;
        let timeout = self.inner.config.effective_timeout(timeout_ms);
        self.run_permitted(&permit, code, timeout).await
    }

    pub(crate) async fn run_permitted(
        &self,
        _permit: &GatePermit,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutput> {
        let executable = self.inner.supervisor.ensure_started().await?;
        if code.trim().is_empty() {
            return Ok(ExecutionOutput::empty(executable.label));
        }

        let started = Instant::now();
        let raw = self.inner.supervisor.submit(code, timeout).await?;
        debug!(
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stdout_len = raw.stdout.len(),
            stderr_len = raw.stderr.len(),
            "Command completed"
        );
        Ok(ExecutionOutput {
            stdout: raw.stdout,
            stderr: raw.stderr,
            executable: executable.label,
        })
    }

    /// Run `code` detached; returns as soon as the job holds the gate
    ///
    /// The result is written under the results directory and reported to
    /// the notification sink. Fails with [`Error::SessionBusy`] if the
    /// session is occupied at submission time.
    pub fn execute_detached(&self, code: impl Into<String>) -> Result<BackgroundJob> {
        let permit = self.inner.gate.try_acquire()?;
        Ok(background::spawn(self.clone(), permit, code.into()))
    }

    pub(crate) fn notifier(&self) -> Arc<dyn NotificationSink> {
        Arc::clone(&self.inner.notifier)
    }

    pub(crate) fn workspace(&self) -> Arc<dyn Workspace> {
        Arc::clone(&self.inner.workspace)
    }

    /// Install packages into the resolved interpreter with pip
    ///
    /// Returns pip's combined output.
    pub async fn install_packages(&self, names: &[String]) -> Result<String> {
        if names.is_empty() {
            return Err(Error::InvalidInput("no packages given".to_string()));
        }
        if let Some(bad) = names.iter().find(|n| n.trim().is_empty() || n.starts_with('-')) {
            return Err(Error::InvalidInput(format!("invalid package name '{bad}'")));
        }

        let executable = self.inner.resolver.resolve().await?;
        let cwd = self.inner.config.workspace_dir();
        self.inner.workspace.ensure_dir(&cwd).await?;

        info!(packages = ?names, executable = %executable, "Installing packages");
        let output = Command::new(&executable.program)
            .args(["-m", "pip", "install", "--disable-pip-version-check"])
            .args(names)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .output()
            .await?;
        let outcome = ProcessOutcome::from_output(&output);
        if !outcome.success() {
            warn!(exit_code = outcome.exit_code, "Package installation failed");
            return Err(Error::PackageInstallFailed {
                exit_code: outcome.exit_code,
                output: outcome.output,
            });
        }
        Ok(outcome.output)
    }

    /// Remove every file from the interpreter's working directory
    pub async fn clear_workspace(&self) -> Result<()> {
        self.inner
            .workspace
            .clear(&self.inner.config.workspace_dir())
            .await
    }

    /// Terminate the interpreter and forget its state
    ///
    /// Never fails; does nothing if no process is running. A detached job
    /// holding the gate fails with [`Error::InterpreterExited`].
    pub async fn reset(&self) {
        self.inner.supervisor.reset().await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("lifecycle", &self.lifecycle())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_joins_streams_and_footer() {
        let out = ExecutionOutput {
            stdout: "15".into(),
            stderr: "Traceback...".into(),
            executable: "python3".into(),
        };
        assert_eq!(
            out.render(),
            "15\n--- STDERR ---\nTraceback...\n(Executed using python3)"
        );
    }

    #[test]
    fn render_empty_output() {
        let out = ExecutionOutput::empty("pypy3");
        assert!(out.is_empty());
        assert_eq!(
            out.render(),
            "Code executed successfully with no output.\n(Executed using pypy3)"
        );
    }

    #[tokio::test]
    async fn install_rejects_empty_and_flag_like_names() {
        let manager = SessionManager::new(SessionConfig::default());
        assert!(matches!(
            manager.install_packages(&[]).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            manager
                .install_packages(&["--index-url=http://evil".to_string()])
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reset_without_process_is_noop() {
        let manager = SessionManager::new(SessionConfig::default());
        manager.reset().await;
        manager.reset().await;
        assert_eq!(manager.lifecycle(), Lifecycle::Stopped);
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn busy_gate_rejects_foreground_and_detached() {
        let manager = SessionManager::new(SessionConfig::default());
        let _held = manager.inner.gate.try_acquire().unwrap();
        assert!(matches!(
            manager.execute("1", None).await,
            Err(Error::SessionBusy)
        ));
        assert!(matches!(
            manager.execute_detached("1"),
            Err(Error::SessionBusy)
        ));
    }
}
