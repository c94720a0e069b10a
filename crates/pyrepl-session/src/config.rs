//! Session configuration
//!
//! Every field has a default so a partial TOML table (or none at all)
//! deserializes into a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Interpreter binaries probed in order, most capable first
pub const DEFAULT_CANDIDATES: &[&str] = &["pypy3", "pypy", "python3", "python"];

const DEFAULT_BASE_DIR: &str = ".pyrepl";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
const BACKGROUND_TIMEOUT_MS: u64 = 3_600_000;
const STARTUP_TIMEOUT_MS: u64 = 15_000;
const STDERR_SETTLE_MS: u64 = 25;
const OUTPUT_LIMIT_BYTES: usize = 100 * 1024; // 100 KB

/// Configuration for a [`SessionManager`](crate::SessionManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter commands probed in order
    pub candidates: Vec<String>,
    /// Provision and use an isolated environment under `base_dir/venv`
    pub use_venv: bool,
    /// Root of the venv, workspace and results directories
    pub base_dir: PathBuf,
    /// Exposed inside the interpreter as `PROJECT_ROOT`
    pub project_root: Option<PathBuf>,
    /// Foreground deadline when the caller supplies none
    pub default_timeout_ms: u64,
    /// Upper bound for caller-supplied deadlines
    pub max_timeout_ms: u64,
    /// Deadline for detached jobs
    pub background_timeout_ms: u64,
    /// Deadline for the readiness sentinel after spawn
    pub startup_timeout_ms: u64,
    /// Grace window for stderr after the completion sentinel arrives
    pub stderr_settle_ms: u64,
    /// Per-stream capture cap
    pub output_limit_bytes: usize,
    /// Interactive prompt tokens stripped from stderr
    pub prompt_markers: Vec<String>,
    /// Regexes matching interpreter banner lines dropped from stderr
    pub banner_patterns: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.iter().map(|s| (*s).to_string()).collect(),
            use_venv: true,
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            project_root: None,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            background_timeout_ms: BACKGROUND_TIMEOUT_MS,
            startup_timeout_ms: STARTUP_TIMEOUT_MS,
            stderr_settle_ms: STDERR_SETTLE_MS,
            output_limit_bytes: OUTPUT_LIMIT_BYTES,
            prompt_markers: vec![">>>".to_string(), "...".to_string()],
            banner_patterns: vec![
                r"^Python \d+\.\d+".to_string(),
                r#"^Type "help""#.to_string(),
                r"^\[PyPy ".to_string(),
                r"^\[GCC ".to_string(),
                r"^\[Clang ".to_string(),
            ],
        }
    }
}

impl SessionConfig {
    /// Create a configuration rooted at `base_dir`
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Enable or disable the isolated environment
    #[must_use]
    pub fn with_venv(mut self, enabled: bool) -> Self {
        self.use_venv = enabled;
        self
    }

    /// Replace the probe list
    #[must_use]
    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    /// Set the project root seen by the interpreter
    #[must_use]
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Set the default foreground deadline
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the background deadline
    #[must_use]
    pub fn with_background_timeout(mut self, timeout: Duration) -> Self {
        self.background_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the startup deadline
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the per-stream output cap
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Directory holding the isolated environment
    #[must_use]
    pub fn venv_dir(&self) -> PathBuf {
        self.base_dir.join("venv")
    }

    /// Working directory of the interpreter
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.base_dir.join("workspace")
    }

    /// Directory holding background job artifacts
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.base_dir.join("results")
    }

    /// Resolve the timeout for a foreground call, clamped to the maximum
    #[must_use]
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms)
            .max(1);
        Duration::from_millis(ms)
    }

    /// Deadline for detached jobs; not subject to the foreground maximum
    #[must_use]
    pub fn background_timeout(&self) -> Duration {
        Duration::from_millis(self.background_timeout_ms.max(1))
    }

    /// Startup deadline
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Stderr grace window
    #[must_use]
    pub fn stderr_settle(&self) -> Duration {
        Duration::from_millis(self.stderr_settle_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_probe_order() {
        let config = SessionConfig::default();
        assert_eq!(config.candidates, vec!["pypy3", "pypy", "python3", "python"]);
        assert!(config.use_venv);
        assert_eq!(config.output_limit_bytes, 100 * 1024);
    }

    #[test]
    fn directory_layout() {
        let config = SessionConfig::new("/tmp/base");
        assert_eq!(config.venv_dir(), PathBuf::from("/tmp/base/venv"));
        assert_eq!(config.workspace_dir(), PathBuf::from("/tmp/base/workspace"));
        assert_eq!(config.results_dir(), PathBuf::from("/tmp/base/results"));
    }

    #[test]
    fn effective_timeout_clamps() {
        let config = SessionConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(
            config.effective_timeout(Some(5_000)),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.effective_timeout(Some(u64::MAX)),
            Duration::from_millis(MAX_TIMEOUT_MS)
        );
        assert_eq!(config.effective_timeout(Some(0)), Duration::from_millis(1));
    }

    #[test]
    fn partial_table_deserializes() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"use_venv": false, "default_timeout_ms": 500}"#).unwrap();
        assert!(!config.use_venv);
        assert_eq!(config.default_timeout_ms, 500);
        assert_eq!(config.startup_timeout_ms, STARTUP_TIMEOUT_MS);
    }
}
