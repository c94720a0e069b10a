//! CLI module for pyrepl
//!
//! Provides commands:
//! - `run`: Execute one snippet and print its result
//! - `shell`: Line-oriented session loop
//! - `install`, `init`, `clean`: Environment housekeeping
//! - `notify`: Forward a background completion to the configured sink

use crate::settings::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod exec;
pub mod notify;
pub mod shell;

/// pyrepl CLI
#[derive(Parser, Debug)]
#[command(name = "pyrepl")]
#[command(about = "Persistent Python REPL sessions")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute code once and print the result
    Run {
        /// Code to execute (reads stdin when neither CODE nor --file is given)
        code: Option<String>,
        /// Read code from a file
        #[arg(long, short, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Deadline in milliseconds (clamped to the configured maximum)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session; a blank line submits the cell
    Shell,
    /// Install packages into the session interpreter
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Resolve the interpreter, provision the environment and start it
    Init {
        /// Also write the effective configuration to config/local.toml
        #[arg(long)]
        write_config: bool,
    },
    /// Clear the workspace directory
    Clean,
    /// Report a finished background task
    Notify {
        id: String,
        exit_code: i32,
        path: PathBuf,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Run {
            code,
            file,
            timeout_ms,
            json,
        }) => exec::run(config, code, file, timeout_ms, json).await,
        Some(Commands::Shell) => shell::run(config).await,
        Some(Commands::Install { packages }) => exec::install(config, packages).await,
        Some(Commands::Init { write_config }) => exec::init(config, write_config).await,
        Some(Commands::Clean) => exec::clean(config).await,
        Some(Commands::Notify {
            id,
            exit_code,
            path,
        }) => notify::run(config, id, exit_code, path).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

pub(crate) fn session_manager(config: &AppConfig) -> pyrepl_session::SessionManager {
    pyrepl_session::SessionManager::builder(config.session.clone())
        .notifier(config.notify.build_sink())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_options() {
        let cli = Cli::try_parse_from(["pyrepl", "run", "1 + 1", "--timeout-ms", "500", "--json"])
            .unwrap();
        match cli.command {
            Some(Commands::Run {
                code,
                file,
                timeout_ms,
                json,
            }) => {
                assert_eq!(code.as_deref(), Some("1 + 1"));
                assert!(file.is_none());
                assert_eq!(timeout_ms, Some(500));
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn install_requires_a_package() {
        assert!(Cli::try_parse_from(["pyrepl", "install"]).is_err());
        assert!(Cli::try_parse_from(["pyrepl", "install", "six", "attrs"]).is_ok());
    }

    #[test]
    fn parses_notify_arguments() {
        let cli = Cli::try_parse_from(["pyrepl", "notify", "ab12cd34", "1", "/tmp/out.txt"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Notify { exit_code: 1, .. })
        ));
    }
}
