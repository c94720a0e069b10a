//! Interactive session loop
//!
//! Lines accumulate into a cell; an empty line submits it. Commands start
//! with `:` on an otherwise empty cell.

use super::session_manager;
use crate::settings::AppConfig;
use anyhow::Result;
use pyrepl_session::SessionManager;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Reset,
    Install(Vec<String>),
    Background,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<ShellCommand> {
    let rest = line.trim().strip_prefix(':')?;
    let mut words = rest.split_whitespace();
    let command = match words.next().unwrap_or_default() {
        "reset" => ShellCommand::Reset,
        "install" => ShellCommand::Install(words.map(str::to_string).collect()),
        "bg" => ShellCommand::Background,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => ShellCommand::Unknown(other.to_string()),
    };
    Some(command)
}

fn prompt(continuation: bool) {
    print!("{}", if continuation { "... " } else { ">>> " });
    let _ = std::io::stdout().flush();
}

pub async fn run(config: AppConfig) -> Result<()> {
    let manager = session_manager(&config);
    match manager.start().await {
        Ok(executable) => println!("pyrepl shell ({executable}); blank line runs, :quit exits"),
        Err(e) => {
            eprintln!("Failed to start interpreter: {e}");
            return Err(e.into());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cell = String::new();
    let mut detach_next = false;

    loop {
        prompt(!cell.is_empty());
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("Interrupted; terminating interpreter");
                break;
            }
        };
        let Some(line) = line else {
            submit(&manager, &cell, &mut detach_next).await;
            break;
        };

        if cell.is_empty() {
            if let Some(command) = parse_command(&line) {
                match command {
                    ShellCommand::Reset => {
                        manager.reset().await;
                        println!("Session reset.");
                    }
                    ShellCommand::Install(packages) => match manager.install_packages(&packages).await {
                        Ok(output) => print!("{output}"),
                        Err(e) => eprintln!("Error: {e}"),
                    },
                    ShellCommand::Background => {
                        detach_next = true;
                        println!("Next cell runs in the background.");
                    }
                    ShellCommand::Quit => break,
                    ShellCommand::Unknown(name) => eprintln!("Unknown command :{name}"),
                }
                continue;
            }
        }

        if line.trim().is_empty() {
            submit(&manager, &cell, &mut detach_next).await;
            cell.clear();
        } else {
            cell.push_str(&line);
            cell.push('\n');
        }
    }

    manager.reset().await;
    Ok(())
}

async fn submit(manager: &SessionManager, cell: &str, detach_next: &mut bool) {
    if cell.trim().is_empty() {
        return;
    }
    if std::mem::take(detach_next) {
        match manager.execute_detached(cell) {
            Ok(job) => println!(
                "[{}] Started in background; output will be saved to {}",
                job.id,
                job.result_path.display()
            ),
            Err(e) => eprintln!("Error: {e}"),
        }
        return;
    }

    let execution = manager.execute(cell, None);
    tokio::pin!(execution);
    let result = tokio::select! {
        result = &mut execution => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during execution; resetting session");
            manager.reset().await;
            println!("Session reset.");
            return;
        }
    };
    match result {
        Ok(output) => println!("{}", output.render()),
        Err(e) if e.is_recoverable() => eprintln!("Error: {e}"),
        Err(e) => eprintln!("Error: {e} (the interpreter restarts on the next cell)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_lines_are_commands() {
        assert_eq!(parse_command(":reset"), Some(ShellCommand::Reset));
        assert_eq!(
            parse_command(" :install six attrs "),
            Some(ShellCommand::Install(vec!["six".into(), "attrs".into()]))
        );
        assert_eq!(parse_command(":bg"), Some(ShellCommand::Background));
        assert_eq!(parse_command(":q"), Some(ShellCommand::Quit));
        assert_eq!(
            parse_command(":frob"),
            Some(ShellCommand::Unknown("frob".into()))
        );
    }

    #[test]
    fn code_lines_are_not_commands() {
        assert_eq!(parse_command("x = {'a': 1}"), None);
        assert_eq!(parse_command("print(':reset')"), None);
    }
}
