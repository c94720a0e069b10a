//! Detached execution
//!
//! A detached job takes the gate at submission time and keeps it until the
//! result is on disk, so foreground callers see `SessionBusy` meanwhile.

use crate::error::{Error, Result};
use crate::gate::GatePermit;
use crate::manager::{ExecutionOutput, SessionManager};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Handle returned when a detached job is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJob {
    /// Short job identifier
    pub id: String,
    /// Where the rendered result will be written
    pub result_path: PathBuf,
}

/// Final report of a detached job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    /// Short job identifier
    pub job_id: String,
    /// 0 on success, 1 if execution failed
    pub exit_code: i32,
    /// Result file
    pub artifact: PathBuf,
    /// Interpreter identity, when the run got that far
    pub executable: Option<String>,
}

fn new_job_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

pub(crate) fn spawn(manager: SessionManager, permit: GatePermit, code: String) -> BackgroundJob {
    let id = new_job_id();
    let result_path = manager.config().results_dir().join(format!("{id}.txt"));
    let job = BackgroundJob {
        id: id.clone(),
        result_path: result_path.clone(),
    };

    info!(job_id = %id, "Background task accepted");
    tokio::spawn(async move {
        let timeout = manager.config().background_timeout();
        let outcome = manager.run_permitted(&permit, &code, timeout).await;
        drop(permit);

        let completion = match write_artifact(&manager, &id, &result_path, &outcome).await {
            Ok(()) => JobCompletion {
                job_id: id,
                exit_code: i32::from(outcome.is_err()),
                artifact: result_path,
                executable: outcome.ok().map(|out| out.executable),
            },
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to write background result");
                JobCompletion {
                    job_id: id,
                    exit_code: 1,
                    artifact: result_path,
                    executable: None,
                }
            }
        };

        info!(
            job_id = %completion.job_id,
            exit_code = completion.exit_code,
            "Background task finished"
        );
        if let Err(e) = manager.notifier().notify(&completion).await {
            warn!(job_id = %completion.job_id, error = %e, "Completion notification failed");
        }
    });

    job
}

async fn write_artifact(
    manager: &SessionManager,
    id: &str,
    path: &Path,
    outcome: &Result<ExecutionOutput>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        manager.workspace().ensure_dir(parent).await?;
    }
    tokio::fs::write(path, artifact_text(id, outcome)).await?;
    Ok(())
}

fn artifact_text(id: &str, outcome: &std::result::Result<ExecutionOutput, Error>) -> String {
    let body = match outcome {
        Ok(output) => output.render(),
        Err(e) => format!("Error: {e}"),
    };
    format!(
        "# Background task {id}\n# Finished: {}\n\n{body}\n",
        chrono::Utc::now().to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::notify::MockNotificationSink;
    use crate::resolver::MockExecutableProbe;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn failed_job_reports_exit_one_and_releases_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = MockNotificationSink::new();
        sink.expect_notify().times(1).returning(move |completion| {
            let _ = tx.send(completion.clone());
            Ok(())
        });

        let manager = SessionManager::builder(SessionConfig::new(dir.path()).with_venv(false))
            .probe(Arc::new(probe))
            .notifier(Arc::new(sink))
            .build();

        let job = manager.execute_detached("print(1)").unwrap();
        let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(completion.job_id, job.id);
        assert_eq!(completion.exit_code, 1);
        assert!(completion.executable.is_none());
        let text = std::fs::read_to_string(&job.result_path).unwrap();
        assert!(text.contains("Error: no Python or PyPy executable found"));
        assert!(!manager.is_busy());
    }

    #[test]
    fn job_ids_are_short_and_distinct() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn artifact_has_header_and_rendered_body() {
        let ok = Ok(ExecutionOutput {
            stdout: "42".into(),
            stderr: String::new(),
            executable: "python3".into(),
        });
        let text = artifact_text("ab12cd34", &ok);
        assert!(text.starts_with("# Background task ab12cd34\n# Finished: "));
        assert!(text.ends_with("42\n(Executed using python3)\n"));

        let failed = Err(Error::ExecutionTimeout(10));
        assert!(artifact_text("ab12cd34", &failed).contains("Error: "));
    }
}
