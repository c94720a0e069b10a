//! One-shot commands: run, install, init, clean

use super::session_manager;
use crate::settings::AppConfig;
use anyhow::{Context, Result};
use pyrepl_session::{Error, ExecutionOutput};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::warn;

const LOCAL_CONFIG: &str = "config/local.toml";

pub async fn run(
    config: AppConfig,
    code: Option<String>,
    file: Option<PathBuf>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let code = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read code from stdin")?;
            buf
        }
    };

    let manager = session_manager(&config);
    let result = tokio::select! {
        result = manager.execute(&code, timeout_ms) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; terminating interpreter");
            manager.reset().await;
            anyhow::bail!("interrupted");
        }
    };
    manager.reset().await;

    if json {
        println!("{}", json_report(&result));
    }
    let output = result?;
    if !json {
        println!("{}", output.render());
    }
    Ok(())
}

fn json_report(result: &std::result::Result<ExecutionOutput, Error>) -> serde_json::Value {
    match result {
        Ok(output) => {
            let mut report = json!(output);
            report["ok"] = json!(true);
            report
        }
        Err(e) => json!({
            "ok": false,
            "error": e.to_string(),
            "kind": e.kind(),
        }),
    }
}

pub async fn install(config: AppConfig, packages: Vec<String>) -> Result<()> {
    let manager = session_manager(&config);
    let output = manager
        .install_packages(&packages)
        .await
        .context("Package installation failed")?;
    print!("{output}");
    Ok(())
}

pub async fn init(config: AppConfig, write_config: bool) -> Result<()> {
    if write_config {
        config.save(LOCAL_CONFIG)?;
        println!("Wrote {LOCAL_CONFIG}");
    }
    let manager = session_manager(&config);
    let executable = manager
        .start()
        .await
        .context("Failed to start the interpreter")?;
    println!("Interpreter ready: {executable}");
    println!("Workspace: {}", config.session.workspace_dir().display());
    manager.reset().await;
    Ok(())
}

pub async fn clean(config: AppConfig) -> Result<()> {
    let manager = session_manager(&config);
    manager
        .clear_workspace()
        .await
        .context("Failed to clear workspace")?;
    println!("Cleared {}", config.session.workspace_dir().display());
    Ok(())
}
