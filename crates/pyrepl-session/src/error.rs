//! Error types for pyrepl-session
//!
//! Interpreter-level exceptions are not represented here: they are folded
//! into the `stderr` of a successful [`ExecutionOutput`](crate::ExecutionOutput).

use thiserror::Error;

/// Session manager error type
#[derive(Debug, Error)]
pub enum Error {
    /// No candidate binary answered a version probe
    #[error("no Python or PyPy executable found (tried: {tried})")]
    NoInterpreterFound {
        /// Comma-separated list of probed commands
        tried: String,
    },

    /// Creating the isolated environment failed
    #[error("environment provisioning failed with exit code {exit_code}: {output}")]
    EnvironmentProvisionFailed {
        /// Exit code of the provisioning subprocess
        exit_code: i32,
        /// Captured combined output
        output: String,
    },

    /// Readiness sentinel was not observed in time
    #[error("interpreter did not become ready within {0}ms")]
    StartupTimeout(u64),

    /// Another foreground command holds the session
    #[error("session is busy: another command is still running")]
    SessionBusy,

    /// The command exceeded its deadline and was interrupted
    #[error("execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// Writing to the interpreter's stdin failed
    #[error("failed to write to interpreter stdin: {0}")]
    TransportWriteFailed(#[source] std::io::Error),

    /// The interpreter exited while a command was waiting for its result
    #[error("interpreter exited while a command was running (exit code {code:?})")]
    InterpreterExited {
        /// Exit code, if the process exited normally
        code: Option<i32>,
    },

    /// Package installation returned non-zero
    #[error("package installation failed with exit code {exit_code}")]
    PackageInstallFailed {
        /// Exit code of the installer
        exit_code: i32,
        /// Captured combined output
        output: String,
    },

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short label for logs and machine-readable output
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoInterpreterFound { .. } => "resolution",
            Self::EnvironmentProvisionFailed { .. } => "provision",
            Self::StartupTimeout(_) => "startup_timeout",
            Self::SessionBusy => "busy",
            Self::ExecutionTimeout(_) => "timeout",
            Self::TransportWriteFailed(_) => "transport",
            Self::InterpreterExited { .. } => "exited",
            Self::PackageInstallFailed { .. } => "package_install",
            Self::InvalidInput(_) => "invalid_input",
            Self::Io(_) => "io",
        }
    }

    /// Whether the session can still serve the next command unchanged
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SessionBusy
                | Self::ExecutionTimeout(_)
                | Self::StartupTimeout(_)
                | Self::InvalidInput(_)
                | Self::PackageInstallFailed { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::SessionBusy.kind(), "busy");
        assert_eq!(Error::ExecutionTimeout(10).kind(), "timeout");
        assert_eq!(Error::StartupTimeout(10).kind(), "startup_timeout");
        assert_eq!(
            Error::NoInterpreterFound {
                tried: "python3".into()
            }
            .kind(),
            "resolution"
        );
    }

    #[test]
    fn busy_and_timeout_are_recoverable() {
        assert!(Error::SessionBusy.is_recoverable());
        assert!(Error::ExecutionTimeout(5).is_recoverable());
        assert!(!Error::InterpreterExited { code: Some(1) }.is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::PackageInstallFailed {
            exit_code: 1,
            output: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "package installation failed with exit code 1"
        );
        assert_eq!(
            Error::ExecutionTimeout(250).to_string(),
            "execution timed out after 250ms"
        );
    }
}
