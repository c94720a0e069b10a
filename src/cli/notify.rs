//! Background completion helper

use crate::settings::AppConfig;
use anyhow::{Context, Result};
use pyrepl_session::{completion_message, JobCompletion, NotificationSink};
use std::path::PathBuf;

pub async fn run(config: AppConfig, id: String, exit_code: i32, path: PathBuf) -> Result<()> {
    let completion = JobCompletion {
        job_id: id,
        exit_code,
        artifact: path,
        executable: None,
    };
    config
        .notify
        .build_sink()
        .notify(&completion)
        .await
        .context("Failed to deliver notification")?;
    println!("{}", completion_message(&completion));
    Ok(())
}
