//! Job runners: the port the executor uses to run one check job, and the
//! child-process implementation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use pipeline::{JobSpec, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Environment variable carrying the run identifier into every job.
pub const RUN_ID_ENV: &str = "RUNLANE_RUN_ID";

/// Environment variable used to pin a job's toolchain.
pub const TOOLCHAIN_ENV: &str = "RUSTUP_TOOLCHAIN";

/// How a single job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The tool exited successfully.
    Passed,
    /// The tool exited unsuccessfully. `exit_code` is `None` when it was
    /// terminated by a signal.
    Failed {
        /// Exit code reported by the process.
        exit_code: Option<i32>,
    },
    /// The run was superseded while the job was executing.
    Cancelled,
    /// The job could not be run at all.
    Errored {
        /// Why the job could not be run.
        message: String,
    },
}

impl JobOutcome {
    /// Returns `true` for [`JobOutcome::Passed`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Failures launching or supervising a job.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The job's program could not be started.
    #[error("Failed to start job '{job}': {source}")]
    Spawn {
        /// Name of the job.
        job: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Waiting for the job's process failed.
    #[error("Failed to wait for job '{job}': {source}")]
    Wait {
        /// Name of the job.
        job: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Runs one check job for a run.
///
/// Implementations must return promptly with [`JobOutcome::Cancelled`] once
/// `cancel` fires.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Runs `job` on behalf of `run_id`.
    async fn run_job(
        &self,
        run_id: RunId,
        job: &JobSpec,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, ExecutorError>;
}

/// Runs each job as a child process in a fixed working directory.
///
/// Job output goes to this process's stderr so stdout stays free for
/// machine-readable decisions and reports.
#[derive(Debug, Clone)]
pub struct ProcessJobRunner {
    workdir: PathBuf,
}

impl ProcessJobRunner {
    /// Creates a runner that starts every job in `workdir`.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn command(&self, run_id: RunId, job: &JobSpec) -> Command {
        let mut command = Command::new(&job.program);
        command.kill_on_drop(true);
        command.args(&job.args);
        command.current_dir(&self.workdir);
        command.stdin(Stdio::null());
        command.stdout(std::io::stderr());
        command.stderr(std::io::stderr());
        command.env(RUN_ID_ENV, run_id.to_string());
        if let Some(toolchain) = &job.toolchain {
            command.env(TOOLCHAIN_ENV, toolchain);
        }
        command
    }
}

#[async_trait]
impl JobRunner for ProcessJobRunner {
    async fn run_job(
        &self,
        run_id: RunId,
        job: &JobSpec,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, ExecutorError> {
        debug!(job = %job.name, command = %job.command_line(), "starting job");
        let mut child = self
            .command(run_id, job)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                job: job.name.clone(),
                source,
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| ExecutorError::Wait {
                    job: job.name.clone(),
                    source,
                })?;
                if status.success() {
                    Ok(JobOutcome::Passed)
                } else {
                    Ok(JobOutcome::Failed { exit_code: status.code() })
                }
            }
            () = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(job = %job.name, error = %err, "failed to kill cancelled job");
                }
                Ok(JobOutcome::Cancelled)
            }
        }
    }
}
