//! Runlane job executor.
//!
//! Realises the [`pipeline::RunDecision`]s produced by the run controller:
//! fires the cancellation token of a superseded run, moves the new run to
//! running, executes every configured check job in parallel, and completes the
//! run unless it was superseded in the meantime.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The executor sequences calls between the
//! [`pipeline::RunController`] and a [`JobRunner`]. It contains no domain
//! rules of its own: whether a run may start or complete is always decided by
//! the controller.

pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use pipeline::{GroupKey, JobSpec, PipelineError, RunController, RunDecision, RunId, RunStore};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub use runner::{ExecutorError, JobOutcome, JobRunner, ProcessJobRunner};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one job within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Job name from the workflow configuration.
    pub job: String,
    /// How the job ended.
    #[serde(flatten)]
    pub outcome: JobOutcome,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// How a dispatched run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every job finished and the run was completed.
    Completed,
    /// The run was superseded, before or while its jobs executed.
    Cancelled,
    /// The controller refused the run for a reason other than supersession.
    Aborted {
        /// The controller error.
        reason: String,
    },
}

/// Everything the executor knows about a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run this report describes.
    pub run_id: RunId,
    /// Its concurrency group.
    pub group: GroupKey,
    /// Final outcome.
    pub outcome: RunOutcome,
    /// Results of the jobs that were started, in configuration order.
    pub jobs: Vec<JobResult>,
}

impl RunReport {
    /// Returns `true` if the run completed and every job passed.
    pub fn all_passed(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.jobs.iter().all(|j| j.outcome.is_success())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs the configured jobs for each dispatched decision.
///
/// Holds one cancellation token per in-flight run; a decision that supersedes
/// a run fires that run's token before the new run starts.
pub struct Executor<S: RunStore + 'static, J: JobRunner> {
    controller: Arc<RunController<S>>,
    runner: Arc<J>,
    jobs: Arc<[JobSpec]>,
    tokens: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl<S: RunStore + 'static, J: JobRunner> std::fmt::Debug for Executor<S, J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workflow", self.controller.workflow())
            .field("jobs", &self.jobs.len())
            .field("in_flight", &self.tokens.lock().len())
            .finish()
    }
}

impl<S: RunStore + 'static, J: JobRunner> Executor<S, J> {
    /// Creates an executor running `jobs` through `runner`.
    pub fn new(controller: Arc<RunController<S>>, runner: J, jobs: Vec<JobSpec>) -> Self {
        Self {
            controller,
            runner: Arc::new(runner),
            jobs: jobs.into(),
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fires the cancellation token of an in-flight run.
    ///
    /// Returns `false` if the run is not executing here (never dispatched, or
    /// already finished).
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.tokens.lock().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Realises `decision`: cancels the superseded run, then starts the new
    /// run's jobs on the runtime. Must be called from within a Tokio runtime.
    ///
    /// The new run's token is registered before this returns, so a later
    /// decision superseding it always finds it.
    pub fn dispatch(&self, decision: &RunDecision) -> JoinHandle<RunReport> {
        if let Some(old) = decision.cancelled_run_id {
            if self.cancel(old) {
                info!(run_id = %old, superseded_by = %decision.new_run_id, "signalled cancellation");
            }
        }

        let run_id = decision.new_run_id;
        let token = CancellationToken::new();
        self.tokens.lock().insert(run_id, token.clone());

        let span = info_span!("run", %run_id, group = %decision.group);
        let task = RunTask {
            controller: Arc::clone(&self.controller),
            runner: Arc::clone(&self.runner),
            jobs: Arc::clone(&self.jobs),
            run_id,
            group: decision.group.clone(),
            token,
        };
        let tokens = Arc::clone(&self.tokens);

        tokio::spawn(
            async move {
                let report = task.execute().await;
                tokens.lock().remove(&run_id);
                report
            }
            .instrument(span),
        )
    }
}

struct RunTask<S: RunStore + 'static, J: JobRunner> {
    controller: Arc<RunController<S>>,
    runner: Arc<J>,
    jobs: Arc<[JobSpec]>,
    run_id: RunId,
    group: GroupKey,
    token: CancellationToken,
}

impl<S: RunStore + 'static, J: JobRunner> RunTask<S, J> {
    fn report(&self, outcome: RunOutcome, jobs: Vec<JobResult>) -> RunReport {
        RunReport {
            run_id: self.run_id,
            group: self.group.clone(),
            outcome,
            jobs,
        }
    }

    async fn execute(self) -> RunReport {
        if let Err(err) = self.controller.mark_running(self.run_id) {
            return match err {
                PipelineError::InvalidTransition { .. } => {
                    info!(error = %err, "run superseded before it started");
                    self.report(RunOutcome::Cancelled, Vec::new())
                }
                other => {
                    warn!(error = %other, "run could not start");
                    self.report(RunOutcome::Aborted { reason: other.to_string() }, Vec::new())
                }
            };
        }

        let jobs = self.run_jobs().await;

        if self.token.is_cancelled() {
            info!("run cancelled while executing");
            return self.report(RunOutcome::Cancelled, jobs);
        }

        match self.controller.complete(self.run_id) {
            Ok(_) => {
                let passed = jobs.iter().filter(|j| j.outcome.is_success()).count();
                info!(passed, total = jobs.len(), "run completed");
                self.report(RunOutcome::Completed, jobs)
            }
            Err(PipelineError::InvalidTransition { .. }) => {
                info!("run superseded before it could complete");
                self.report(RunOutcome::Cancelled, jobs)
            }
            Err(err) => {
                warn!(error = %err, "run could not complete");
                self.report(RunOutcome::Aborted { reason: err.to_string() }, jobs)
            }
        }
    }

    async fn run_jobs(&self) -> Vec<JobResult> {
        let mut set = JoinSet::new();
        let mut tasks = HashMap::with_capacity(self.jobs.len());
        for (index, job) in self.jobs.iter().cloned().enumerate() {
            let runner = Arc::clone(&self.runner);
            let token = self.token.clone();
            let run_id = self.run_id;
            let span = info_span!("job", name = %job.name);
            let handle = set.spawn(
                async move {
                    let started = Instant::now();
                    let outcome = match runner.run_job(run_id, &job, token).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(error = %err, "job could not run");
                            JobOutcome::Errored {
                                message: err.to_string(),
                            }
                        }
                    };
                    info!(?outcome, "job finished");
                    JobResult {
                        job: job.name,
                        outcome,
                        duration_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                    }
                }
                .instrument(span),
            );
            tasks.insert(handle.id(), index);
        }

        let mut results: Vec<Option<JobResult>> = vec![None; self.jobs.len()];
        while let Some(joined) = set.join_next_with_id().await {
            let (id, entry) = match joined {
                Ok((id, result)) => (id, result),
                Err(err) => {
                    let job = tasks
                        .get(&err.id())
                        .map_or("<unknown>", |index| self.jobs[*index].name.as_str());
                    warn!(job, error = %err, "job task failed");
                    let result = JobResult {
                        job: job.to_string(),
                        outcome: JobOutcome::Errored {
                            message: err.to_string(),
                        },
                        duration_ms: 0,
                    };
                    (err.id(), result)
                }
            };
            if let Some(slot) = tasks.get(&id).and_then(|index| results.get_mut(*index)) {
                *slot = Some(entry);
            }
        }

        // Every job appears in the report, even one whose task never yielded a result.
        results
            .into_iter()
            .zip(self.jobs.iter())
            .map(|(result, job)| {
                result.unwrap_or_else(|| JobResult {
                    job: job.name.clone(),
                    outcome: JobOutcome::Errored {
                        message: "job task ended without a result".to_string(),
                    },
                    duration_ms: 0,
                })
            })
            .collect()
    }
}
