//! Interpreter resolution and isolated-environment provisioning

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Checks whether a command is a runnable interpreter
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutableProbe: Send + Sync {
    /// Return true if `command --version` succeeds
    async fn probe(&self, command: &str) -> bool;
}

/// Exit status and combined output of a helper subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,
    /// stdout followed by stderr
    pub output: String,
}

impl ProcessOutcome {
    /// Whether the subprocess exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn from_output(output: &std::process::Output) -> Self {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        }
    }
}

/// Creates an isolated package environment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Build an environment at `target_dir` using `base_python`
    async fn create(&self, base_python: &str, target_dir: &Path) -> Result<ProcessOutcome>;
}

/// Probe that runs `<command> --version`
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionProbe;

#[async_trait]
impl ExecutableProbe for VersionProbe {
    async fn probe(&self, command: &str) -> bool {
        match Command::new(command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!(command, error = %e, "Interpreter probe failed to spawn");
                false
            }
        }
    }
}

/// Provisioner that runs `<base_python> -m venv <target_dir>`
#[derive(Debug, Default, Clone, Copy)]
pub struct VenvProvisioner;

#[async_trait]
impl EnvironmentProvisioner for VenvProvisioner {
    async fn create(&self, base_python: &str, target_dir: &Path) -> Result<ProcessOutcome> {
        let output = Command::new(base_python)
            .args(["-m", "venv"])
            .arg(target_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(ProcessOutcome::from_output(&output))
    }
}

/// A runnable interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
    /// Human-readable identity reported to callers
    pub label: String,
    /// Program passed to the process spawner
    pub program: PathBuf,
}

impl fmt::Display for ResolvedExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Path of the interpreter inside a venv directory
#[must_use]
pub fn venv_python(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

/// Finds an interpreter and optionally provisions a venv; caches the first success
pub struct ExecutableResolver {
    candidates: Vec<String>,
    venv_dir: Option<PathBuf>,
    probe: Arc<dyn ExecutableProbe>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    resolved: OnceCell<ResolvedExecutable>,
}

impl ExecutableResolver {
    /// Create a resolver over `candidates` using the system probe and `venv`
    #[must_use]
    pub fn new(candidates: Vec<String>, venv_dir: Option<PathBuf>) -> Self {
        Self::with_collaborators(
            candidates,
            venv_dir,
            Arc::new(VersionProbe),
            Arc::new(VenvProvisioner),
        )
    }

    /// Create a resolver with custom probe and provisioner
    #[must_use]
    pub fn with_collaborators(
        candidates: Vec<String>,
        venv_dir: Option<PathBuf>,
        probe: Arc<dyn ExecutableProbe>,
        provisioner: Arc<dyn EnvironmentProvisioner>,
    ) -> Self {
        Self {
            candidates,
            venv_dir,
            probe,
            provisioner,
            resolved: OnceCell::new(),
        }
    }

    /// Resolve the interpreter, probing (and provisioning) only once
    pub async fn resolve(&self) -> Result<ResolvedExecutable> {
        self.resolved
            .get_or_try_init(|| self.resolve_uncached())
            .await
            .cloned()
    }

    async fn resolve_uncached(&self) -> Result<ResolvedExecutable> {
        let base = self.probe_candidates().await?;

        let Some(venv_dir) = &self.venv_dir else {
            info!(executable = %base, "Resolved interpreter");
            return Ok(ResolvedExecutable {
                label: base.clone(),
                program: PathBuf::from(base),
            });
        };

        // The interpreter runs with the workspace as its cwd.
        let venv_dir = std::path::absolute(venv_dir)?;
        let python = venv_python(&venv_dir);
        if !python.exists() {
            if let Some(parent) = venv_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            info!(base = %base, dir = %venv_dir.display(), "Provisioning isolated environment");
            let outcome = self.provisioner.create(&base, &venv_dir).await?;
            if !outcome.success() {
                warn!(exit_code = outcome.exit_code, "Environment provisioning failed");
                return Err(Error::EnvironmentProvisionFailed {
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                });
            }
        }

        info!(executable = %base, venv = %venv_dir.display(), "Resolved interpreter");
        Ok(ResolvedExecutable {
            label: format!("{base} (venv)"),
            program: python,
        })
    }

    async fn probe_candidates(&self) -> Result<String> {
        for candidate in &self.candidates {
            if self.probe.probe(candidate).await {
                return Ok(candidate.clone());
            }
            debug!(candidate = %candidate, "Interpreter candidate unavailable");
        }
        Err(Error::NoInterpreterFound {
            tried: self.candidates.join(", "),
        })
    }
}

impl fmt::Debug for ExecutableResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableResolver")
            .field("candidates", &self.candidates)
            .field("venv_dir", &self.venv_dir)
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn candidates() -> Vec<String> {
        ["pypy3", "pypy", "python3", "python"]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    fn no_provision() -> Arc<MockEnvironmentProvisioner> {
        let mut provisioner = MockEnvironmentProvisioner::new();
        provisioner.expect_create().never();
        Arc::new(provisioner)
    }

    #[tokio::test]
    async fn picks_first_answering_candidate() {
        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().with(eq("pypy3")).return_const(false);
        probe.expect_probe().with(eq("pypy")).return_const(false);
        probe
            .expect_probe()
            .with(eq("python3"))
            .times(1)
            .return_const(true);
        probe.expect_probe().with(eq("python")).never();

        let resolver =
            ExecutableResolver::with_collaborators(candidates(), None, Arc::new(probe), no_provision());
        let resolved = resolver.resolve().await.unwrap();
        assert_eq!(resolved.label, "python3");
        assert_eq!(resolved.program, PathBuf::from("python3"));
    }

    #[tokio::test]
    async fn result_is_cached() {
        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().times(1).return_const(true);

        let resolver =
            ExecutableResolver::with_collaborators(candidates(), None, Arc::new(probe), no_provision());
        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.label, "pypy3");
    }

    #[tokio::test]
    async fn no_candidate_fails() {
        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(false);

        let resolver =
            ExecutableResolver::with_collaborators(candidates(), None, Arc::new(probe), no_provision());
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, Error::NoInterpreterFound { .. }));
        assert!(err.to_string().contains("python3"));
    }

    #[tokio::test]
    async fn provisions_missing_venv_with_base_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");

        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().with(eq("pypy3")).return_const(false);
        probe.expect_probe().with(eq("pypy")).return_const(true);

        let mut provisioner = MockEnvironmentProvisioner::new();
        let expected_dir = venv.clone();
        provisioner
            .expect_create()
            .withf(move |base, target| base == "pypy" && target == expected_dir.as_path())
            .times(1)
            .returning(|_, _| {
                Ok(ProcessOutcome {
                    exit_code: 0,
                    output: String::new(),
                })
            });

        let resolver = ExecutableResolver::with_collaborators(
            candidates(),
            Some(venv.clone()),
            Arc::new(probe),
            Arc::new(provisioner),
        );
        let resolved = resolver.resolve().await.unwrap();
        assert_eq!(resolved.label, "pypy (venv)");
        assert_eq!(resolved.program, venv_python(&venv));
    }

    #[tokio::test]
    async fn relative_venv_dir_resolves_to_absolute_program() {
        let dir = tempfile::tempdir_in(".").unwrap();
        let venv = dir.path().join("venv");
        assert!(venv.is_relative());

        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(true);

        let mut provisioner = MockEnvironmentProvisioner::new();
        provisioner
            .expect_create()
            .withf(|_, target| target.is_absolute())
            .times(1)
            .returning(|_, _| {
                Ok(ProcessOutcome {
                    exit_code: 0,
                    output: String::new(),
                })
            });

        let resolver = ExecutableResolver::with_collaborators(
            candidates(),
            Some(venv.clone()),
            Arc::new(probe),
            Arc::new(provisioner),
        );
        let resolved = resolver.resolve().await.unwrap();
        assert!(resolved.program.is_absolute());
        assert_eq!(
            resolved.program,
            venv_python(&std::path::absolute(&venv).unwrap())
        );
    }

    #[tokio::test]
    async fn provisioning_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();

        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(true);

        let mut provisioner = MockEnvironmentProvisioner::new();
        provisioner.expect_create().returning(|_, _| {
            Ok(ProcessOutcome {
                exit_code: 2,
                output: "ensurepip is not available".to_string(),
            })
        });

        let resolver = ExecutableResolver::with_collaborators(
            candidates(),
            Some(dir.path().join("venv")),
            Arc::new(probe),
            Arc::new(provisioner),
        );
        match resolver.resolve().await {
            Err(Error::EnvironmentProvisionFailed { exit_code, output }) => {
                assert_eq!(exit_code, 2);
                assert!(output.contains("ensurepip"));
            }
            other => panic!("expected provisioning failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn existing_venv_is_not_reprovisioned() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let python = venv_python(&venv);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, b"").unwrap();

        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(true);

        let resolver = ExecutableResolver::with_collaborators(
            candidates(),
            Some(venv),
            Arc::new(probe),
            no_provision(),
        );
        let resolved = resolver.resolve().await.unwrap();
        assert_eq!(resolved.program, python);
    }
}
