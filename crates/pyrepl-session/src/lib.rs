//! pyrepl Session - Persistent Python Interpreter Sessions
//!
//! This crate keeps one long-lived interactive Python process and runs code
//! snippets in it with persistent state:
//! - Resolver: Interpreter discovery and optional venv provisioning
//! - Supervisor: Process lifecycle, framing and stream demultiplexing
//! - Manager: Single-flight execution, detached jobs, package installs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod background;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod gate;
pub mod manager;
pub mod notify;
pub mod resolver;
pub mod supervisor;
pub mod workspace;

pub use background::{BackgroundJob, JobCompletion};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use manager::{ExecutionOutput, SessionManager, SessionManagerBuilder};
pub use notify::{completion_message, LogNotifier, NotificationSink, TmuxNotifier};
pub use resolver::{
    EnvironmentProvisioner, ExecutableProbe, ExecutableResolver, ProcessOutcome,
    ResolvedExecutable,
};
pub use supervisor::{Lifecycle, PROJECT_ROOT_ENV};
pub use workspace::{FsWorkspace, Workspace};
