//! Application configuration types
//!
//! Contains the configuration structures for the pyrepl binary.

mod loader;

pub use loader::load_config;

use anyhow::{Context, Result};
use pyrepl_session::{LogNotifier, NotificationSink, SessionConfig, TmuxNotifier};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}

/// Where background completion notices go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    #[default]
    Log,
    Tmux,
}

/// Notification sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub kind: NotifyKind,
    #[serde(default = "default_tmux_target")]
    pub tmux_target: String,
}

fn default_tmux_target() -> String {
    "pyrepl:0.0".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::default(),
            tmux_target: default_tmux_target(),
        }
    }
}

impl NotifyConfig {
    pub fn build_sink(&self) -> Arc<dyn NotificationSink> {
        match self.kind {
            NotifyKind::Log => Arc::new(LogNotifier),
            NotifyKind::Tmux => Arc::new(TmuxNotifier::new(self.tmux_target.clone())),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directive used when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Write a daily rolling log file here in addition to stderr
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_filter() -> String {
    "pyrepl=info,pyrepl_session=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            dir: None,
        }
    }
}
