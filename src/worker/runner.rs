use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::worker::schema::SchemaStep;

/// Executes schema steps on a worker.
///
/// `run` reports success or failure, which becomes `step_success` in the
/// STEP_COMPLETE reply. `abort` is called when the coordinator gives up on
/// the cohort while a step is running.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, step_id: usize, step: &SchemaStep) -> impl Future<Output = bool> + Send;

    fn abort(&self);
}

/// Runs each step's `task` as `sh -c <task>` inside the workspace.
#[derive(Debug)]
pub struct ShellTaskRunner {
    workspace: PathBuf,
    cancel: Mutex<CancellationToken>,
}

impl ShellTaskRunner {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token for the next run. A token cancelled by an earlier abort is replaced.
    fn arm(&self) -> CancellationToken {
        let mut token = self.cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

impl TaskRunner for ShellTaskRunner {
    async fn run(&self, step_id: usize, step: &SchemaStep) -> bool {
        let token = self.arm();
        tracing::info!(
            step_id,
            task = %step.task,
            workspace = %self.workspace.display(),
            "Running step"
        );

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&step.task)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(step_id, error = %e, "Failed to start step");
                return false;
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = token.cancelled() => None,
        };

        match waited {
            Some(Ok(status)) => {
                tracing::info!(step_id, exit_code = ?status.code(), success = status.success(), "Step finished");
                status.success()
            }
            Some(Err(e)) => {
                tracing::error!(step_id, error = %e, "Failed to wait for step");
                false
            }
            None => {
                tracing::warn!(step_id, "Step aborted");
                if let Err(e) = child.kill().await {
                    tracing::debug!(step_id, error = %e, "Step already exited");
                }
                false
            }
        }
    }

    fn abort(&self) {
        self.cancel.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn exit_status_decides_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTaskRunner::new(dir.path());

        assert!(runner.run(0, &SchemaStep::new("true")).await);
        assert!(!runner.run(1, &SchemaStep::new("exit 3")).await);
    }

    #[tokio::test]
    async fn runs_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellTaskRunner::new(dir.path());

        assert!(runner.run(0, &SchemaStep::new("touch marker")).await);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn abort_stops_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ShellTaskRunner::new(dir.path()));

        let started = Instant::now();
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(0, &SchemaStep::new("sleep 30")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        runner.abort();

        let success = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!success);
        assert!(started.elapsed() < Duration::from_secs(10));

        // The next run is not affected by the earlier abort
        assert!(runner.run(1, &SchemaStep::new("true")).await);
    }
}
