//! The run controller: turns trigger events into run decisions and enforces
//! the cancel-on-supersede rule within each concurrency group.
//!
//! The newest trigger in a group always wins. The controller never waits for
//! an in-flight run; it marks it cancelled and reports that in the
//! [`RunDecision`]. Lookup and replacement of a group's current run are a
//! single compare-and-swap on the injected [`RunStore`], retried when another
//! trigger for the same group got there first.

use tracing::{debug, info, instrument, warn};

use crate::{
    GroupKey, PipelineError, Run, RunDecision, RunId, RunStatus, RunStore, StoreError, SwapOutcome,
    TriggerEvent, WorkflowName,
};

/// How many times [`RunController::on_trigger`] re-reads the group slot after
/// losing a race before giving up with [`PipelineError::StoreConflict`].
pub const MAX_SWAP_ATTEMPTS: u32 = 16;

/// Decides, per trigger, which run starts and which in-flight run is cancelled.
#[derive(Debug)]
pub struct RunController<S: RunStore> {
    workflow: WorkflowName,
    store: S,
}

impl<S: RunStore> RunController<S> {
    /// Creates a controller for `workflow` backed by `store`.
    pub fn new(workflow: WorkflowName, store: S) -> Self {
        Self { workflow, store }
    }

    /// The workflow whose runs this controller manages.
    pub fn workflow(&self) -> &WorkflowName {
        &self.workflow
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a pending run for `event`, cancelling the group's active run if
    /// there is one.
    ///
    /// Every call creates a new run; identical events are not deduplicated.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidEvent`] if no concurrency group can be
    ///   derived. No run is created.
    /// - [`PipelineError::StoreConflict`] if the group slot changed on every
    ///   one of [`MAX_SWAP_ATTEMPTS`] attempts.
    /// - [`PipelineError::Store`] if the store fails.
    #[instrument(
        skip(self, event),
        fields(workflow = %self.workflow, kind = %event.kind, run_identifier = %event.run_identifier)
    )]
    pub fn on_trigger(&self, event: TriggerEvent) -> Result<RunDecision, PipelineError> {
        let group = event.concurrency_group(&self.workflow).inspect_err(|err| {
            warn!(error = %err, "rejecting trigger event");
        })?;

        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let expected = self.store.current(&group)?.map(|run| run.id);
            let run = Run::pending(group.clone(), event.clone());
            let new_run_id = run.id;

            match self.store.swap_current(expected, run)? {
                SwapOutcome::Installed { cancelled } => {
                    let cancelled_run_id = cancelled.map(|run| run.id);
                    match cancelled_run_id {
                        Some(old) => info!(%group, %new_run_id, cancelled_run_id = %old, "run superseded"),
                        None => info!(%group, %new_run_id, "run created"),
                    }
                    return Ok(RunDecision {
                        new_run_id,
                        group,
                        cancelled_run_id,
                    });
                }
                SwapOutcome::Conflict { current } => {
                    debug!(%group, attempt, ?current, "lost race for group slot, retrying");
                }
            }
        }

        warn!(%group, attempts = MAX_SWAP_ATTEMPTS, "giving up on contended group");
        Err(PipelineError::StoreConflict {
            group,
            attempts: MAX_SWAP_ATTEMPTS,
        })
    }

    /// Moves a pending run to running. Called by the executor when it starts
    /// the run's jobs.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidTransition`] if the run is no longer pending
    /// (typically because it was superseded), [`PipelineError::RunNotFound`]
    /// for an unknown run.
    pub fn mark_running(&self, run_id: RunId) -> Result<Run, PipelineError> {
        self.transition(run_id, RunStatus::Running)
    }

    /// Moves a running run to completed.
    ///
    /// # Errors
    ///
    /// As for [`Self::mark_running`]; a run cancelled while its jobs were
    /// executing cannot be completed.
    pub fn complete(&self, run_id: RunId) -> Result<Run, PipelineError> {
        self.transition(run_id, RunStatus::Completed)
    }

    /// Returns a snapshot of the run.
    pub fn run(&self, run_id: RunId) -> Result<Run, PipelineError> {
        self.store
            .get(run_id)?
            .ok_or(PipelineError::RunNotFound { run_id })
    }

    /// Returns the group's current run if it is still pending or running.
    pub fn active_run(&self, group: &GroupKey) -> Result<Option<Run>, PipelineError> {
        Ok(self
            .store
            .current(group)?
            .filter(|run| run.status.is_active()))
    }

    #[instrument(skip(self), fields(workflow = %self.workflow))]
    fn transition(&self, run_id: RunId, to: RunStatus) -> Result<Run, PipelineError> {
        let run = self.run(run_id)?;
        if !run.status.can_transition_to(to) {
            debug!(from = %run.status, %to, "transition rejected");
            return Err(PipelineError::InvalidTransition {
                run_id,
                from: run.status,
                to,
            });
        }

        match self.store.transition(run_id, run.status, to) {
            Ok(run) => {
                info!(%run_id, group = %run.group, status = %run.status, "run status changed");
                Ok(run)
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                debug!(from = %actual, %to, "run changed status concurrently");
                Err(PipelineError::InvalidTransition {
                    run_id,
                    from: actual,
                    to,
                })
            }
            Err(StoreError::UnknownRun { run_id }) => Err(PipelineError::RunNotFound { run_id }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::InMemoryRunStore;

    fn controller() -> RunController<InMemoryRunStore> {
        RunController::new(
            WorkflowName::new("wf").expect("non-empty"),
            InMemoryRunStore::new(),
        )
    }

    #[test]
    fn second_trigger_in_group_cancels_first() {
        let controller = controller();

        let first = controller
            .on_trigger(TriggerEvent::push("main", "123"))
            .expect("first trigger");
        assert_eq!(first.group.as_str(), "wf-123");
        assert_eq!(first.cancelled_run_id, None);

        let second = controller
            .on_trigger(TriggerEvent::push("main", "123"))
            .expect("second trigger");
        assert_eq!(second.group, first.group);
        assert_ne!(second.new_run_id, first.new_run_id);
        assert_eq!(second.cancelled_run_id, Some(first.new_run_id));

        let first_run = controller.run(first.new_run_id).expect("first run");
        assert_eq!(first_run.status, RunStatus::Cancelled);
        assert_eq!(first_run.superseded_by, Some(second.new_run_id));
        assert_eq!(
            controller.run(second.new_run_id).expect("second run").status,
            RunStatus::Pending
        );
    }

    #[test]
    fn triggers_in_other_groups_never_cancel() {
        let controller = controller();
        let a = controller
            .on_trigger(TriggerEvent::pull_request("feature/a", "main", "1"))
            .expect("a");
        let b = controller
            .on_trigger(TriggerEvent::pull_request("feature/b", "main", "2"))
            .expect("b");
        let c = controller
            .on_trigger(TriggerEvent::push("main", "3"))
            .expect("c");

        assert_eq!(b.cancelled_run_id, None);
        assert_eq!(c.cancelled_run_id, None);
        assert_eq!(controller.run(a.new_run_id).expect("a").status, RunStatus::Pending);
    }

    #[test]
    fn pull_request_updates_supersede_by_head_ref() {
        let controller = controller();
        let first = controller
            .on_trigger(TriggerEvent::pull_request("topic", "main", "10"))
            .expect("first push to PR");
        controller.mark_running(first.new_run_id).expect("start");

        let second = controller
            .on_trigger(TriggerEvent::pull_request("topic", "main", "11"))
            .expect("second push to PR");
        assert_eq!(second.cancelled_run_id, Some(first.new_run_id));
    }

    #[test]
    fn invalid_event_creates_no_run() {
        let controller = controller();
        let err = controller
            .on_trigger(TriggerEvent::push("main", ""))
            .expect_err("invalid event");
        assert!(matches!(err, PipelineError::InvalidEvent { .. }));
        assert!(controller.store().is_empty());
    }

    #[test]
    fn only_latest_run_in_group_survives() {
        let controller = controller();
        let decisions: Vec<_> = (0..5)
            .map(|_| {
                controller
                    .on_trigger(TriggerEvent::pull_request("topic", "main", "1"))
                    .expect("trigger")
            })
            .collect();

        let latest = decisions.last().expect("five decisions").new_run_id;
        controller.mark_running(latest).expect("start");
        controller.complete(latest).expect("complete");

        let group = &decisions[0].group;
        let runs = controller.store().runs_in_group(group);
        assert_eq!(runs.len(), 5);
        let survivors: Vec<_> = runs
            .iter()
            .filter(|run| run.status != RunStatus::Cancelled)
            .map(|run| run.id)
            .collect();
        assert_eq!(survivors, vec![latest]);
    }

    #[test]
    fn completed_run_is_not_cancelled_by_newer_trigger() {
        let controller = controller();
        let first = controller
            .on_trigger(TriggerEvent::push("main", "5"))
            .expect("first");
        controller.mark_running(first.new_run_id).expect("start");
        controller.complete(first.new_run_id).expect("complete");

        let second = controller
            .on_trigger(TriggerEvent::push("main", "5"))
            .expect("second");
        assert_eq!(second.cancelled_run_id, None);
        assert_eq!(
            controller.run(first.new_run_id).expect("first").status,
            RunStatus::Completed
        );
    }

    #[test]
    fn terminal_runs_reject_every_transition() {
        let controller = controller();
        let first = controller
            .on_trigger(TriggerEvent::push("main", "9"))
            .expect("first");
        controller
            .on_trigger(TriggerEvent::push("main", "9"))
            .expect("second");

        let err = controller
            .mark_running(first.new_run_id)
            .expect_err("cancelled run cannot start");
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: RunStatus::Cancelled,
                to: RunStatus::Running,
                ..
            }
        ));
        assert!(controller.complete(first.new_run_id).is_err());
    }

    #[test]
    fn complete_requires_running() {
        let controller = controller();
        let decision = controller
            .on_trigger(TriggerEvent::push("main", "1"))
            .expect("trigger");
        assert!(matches!(
            controller.complete(decision.new_run_id),
            Err(PipelineError::InvalidTransition {
                from: RunStatus::Pending,
                ..
            })
        ));
        assert!(matches!(
            controller.mark_running(RunId::new_random()),
            Err(PipelineError::RunNotFound { .. })
        ));
    }

    #[test]
    fn active_run_ignores_terminal_runs() {
        let controller = controller();
        let decision = controller
            .on_trigger(TriggerEvent::push("main", "1"))
            .expect("trigger");
        assert_eq!(
            controller
                .active_run(&decision.group)
                .expect("lookup")
                .map(|run| run.id),
            Some(decision.new_run_id)
        );

        controller.mark_running(decision.new_run_id).expect("start");
        controller.complete(decision.new_run_id).expect("complete");
        assert_eq!(controller.active_run(&decision.group).expect("lookup"), None);
    }

    #[test]
    fn concurrent_triggers_leave_one_active_run() {
        let controller = Arc::new(controller());
        let decisions = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let controller = Arc::clone(&controller);
                let decisions = Arc::clone(&decisions);
                scope.spawn(move || {
                    for _ in 0..4 {
                        let decision = controller
                            .on_trigger(TriggerEvent::pull_request("race", "main", "1"))
                            .expect("trigger");
                        decisions.lock().expect("decisions lock").push(decision);
                    }
                });
            }
        });

        let decisions = decisions.lock().expect("decisions lock");
        assert_eq!(decisions.len(), 32);
        let group = decisions[0].group.clone();
        let runs = controller.store().runs_in_group(&group);
        assert_eq!(runs.len(), 32);

        let active: Vec<_> = runs.iter().filter(|run| run.status.is_active()).collect();
        assert_eq!(active.len(), 1);

        // Every run except the first one installed cancelled exactly one predecessor.
        let cancellations = decisions
            .iter()
            .filter(|decision| decision.supersedes())
            .count();
        assert_eq!(cancellations, 31);
    }

    /// Store that reports a conflict on every swap.
    struct ContendedStore;

    impl RunStore for ContendedStore {
        fn get(&self, _run_id: RunId) -> Result<Option<Run>, StoreError> {
            Ok(None)
        }

        fn current(&self, _group: &GroupKey) -> Result<Option<Run>, StoreError> {
            Ok(None)
        }

        fn swap_current(
            &self,
            _expected: Option<RunId>,
            _new_run: Run,
        ) -> Result<SwapOutcome, StoreError> {
            Ok(SwapOutcome::Conflict {
                current: Some(RunId::new_random()),
            })
        }

        fn transition(
            &self,
            run_id: RunId,
            _from: RunStatus,
            _to: RunStatus,
        ) -> Result<Run, StoreError> {
            Err(StoreError::UnknownRun { run_id })
        }
    }

    #[test]
    fn persistent_conflict_gives_up() {
        let controller = RunController::new(WorkflowName::new("wf").expect("non-empty"), ContendedStore);
        let err = controller
            .on_trigger(TriggerEvent::push("main", "1"))
            .expect_err("always contended");
        assert!(matches!(
            err,
            PipelineError::StoreConflict {
                attempts: MAX_SWAP_ATTEMPTS,
                ..
            }
        ));
    }
}
