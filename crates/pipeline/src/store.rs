//! Storage port for runs and concurrency-group slots.
//!
//! The controller never owns global state: every read and write goes through
//! an injected [`RunStore`]. [`InMemoryRunStore`] is the process-local
//! implementation used by the CLI and by tests.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::{GroupKey, Run, RunId, RunStatus, StoreError, Timestamp};

/// Result of [`RunStore::swap_current`].
#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    /// The new run now occupies the group slot.
    Installed {
        /// The displaced run, if it was still pending or running and has now
        /// been cancelled. `None` when the slot was empty or its occupant had
        /// already reached a terminal status.
        cancelled: Option<Run>,
    },
    /// The slot no longer held the expected run; nothing was changed.
    Conflict {
        /// The run that occupies the slot now.
        current: Option<RunId>,
    },
}

/// Run storage contract used by [`crate::RunController`].
///
/// Implementations are responsible for making ownership transitions explicit:
/// - `swap_current` must atomically check the group slot, cancel the displaced
///   active run, insert the new run and point the slot at it. Either all of
///   that happens or nothing does.
/// - `transition` must compare-and-set a single run's status, so a run that
///   was cancelled concurrently is never silently moved to another status.
pub trait RunStore: Send + Sync {
    /// Returns the run with this identifier.
    fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Returns the run occupying the group slot, whatever its status.
    fn current(&self, group: &GroupKey) -> Result<Option<Run>, StoreError>;

    /// Installs `new_run` as the current run of `new_run.group` if the slot
    /// still holds `expected`.
    fn swap_current(&self, expected: Option<RunId>, new_run: Run)
        -> Result<SwapOutcome, StoreError>;

    /// Moves a run from `from` to `to`, returning the updated run.
    fn transition(&self, run_id: RunId, from: RunStatus, to: RunStatus)
        -> Result<Run, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    slots: HashMap<GroupKey, RunId>,
    runs: HashMap<RunId, Run>,
}

/// Process-local [`RunStore`] guarded by a single mutex.
///
/// Every operation takes the lock once, so each one is atomic with respect to
/// every other. Runs are never evicted.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    state: Mutex<StoreState>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every run in `group`, oldest first.
    pub fn runs_in_group(&self, group: &GroupKey) -> Vec<Run> {
        let state = self.state.lock();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| &run.group == group)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// Number of runs recorded across all groups.
    pub fn len(&self) -> usize {
        self.state.lock().runs.len()
    }

    /// Returns `true` if no run has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunStore for InMemoryRunStore {
    fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state.lock().runs.get(&run_id).cloned())
    }

    fn current(&self, group: &GroupKey) -> Result<Option<Run>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .slots
            .get(group)
            .and_then(|run_id| state.runs.get(run_id))
            .cloned())
    }

    fn swap_current(
        &self,
        expected: Option<RunId>,
        new_run: Run,
    ) -> Result<SwapOutcome, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let occupant = state.slots.get(&new_run.group).copied();
        if occupant != expected {
            debug!(group = %new_run.group, ?expected, ?occupant, "group slot changed");
            return Ok(SwapOutcome::Conflict { current: occupant });
        }
        if state.runs.contains_key(&new_run.id) {
            return Err(StoreError::DuplicateRun { run_id: new_run.id });
        }

        let cancelled = match occupant.and_then(|id| state.runs.get_mut(&id)) {
            Some(displaced) if displaced.status.is_active() => {
                displaced.status = RunStatus::Cancelled;
                displaced.superseded_by = Some(new_run.id);
                displaced.updated_at = Timestamp::now();
                Some(displaced.clone())
            }
            _ => None,
        };

        state.slots.insert(new_run.group.clone(), new_run.id);
        state.runs.insert(new_run.id, new_run);

        Ok(SwapOutcome::Installed { cancelled })
    }

    fn transition(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<Run, StoreError> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun { run_id })?;

        if run.status != from {
            return Err(StoreError::StatusMismatch {
                run_id,
                expected: from,
                actual: run.status,
            });
        }

        run.status = to;
        run.updated_at = Timestamp::now();
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriggerEvent;

    fn group(key: &str) -> GroupKey {
        GroupKey::new(key).expect("non-empty group key")
    }

    fn pending(key: &str) -> Run {
        Run::pending(group(key), TriggerEvent::push("main", "1"))
    }

    #[test]
    fn swap_into_empty_slot_installs_without_cancelling() {
        let store = InMemoryRunStore::new();
        let run = pending("ci-1");
        let id = run.id;

        let outcome = store.swap_current(None, run).expect("swap");
        assert_eq!(outcome, SwapOutcome::Installed { cancelled: None });
        assert_eq!(store.current(&group("ci-1")).expect("current").map(|r| r.id), Some(id));
    }

    #[test]
    fn swap_cancels_active_occupant_and_links_successor() {
        let store = InMemoryRunStore::new();
        let first = pending("ci-1");
        let first_id = first.id;
        store.swap_current(None, first).expect("first swap");

        let second = pending("ci-1");
        let second_id = second.id;
        let outcome = store.swap_current(Some(first_id), second).expect("second swap");

        let SwapOutcome::Installed { cancelled: Some(cancelled) } = outcome else {
            panic!("expected the first run to be cancelled");
        };
        assert_eq!(cancelled.id, first_id);
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.superseded_by, Some(second_id));
    }

    #[test]
    fn swap_does_not_cancel_completed_occupant() {
        let store = InMemoryRunStore::new();
        let first = pending("ci-1");
        let first_id = first.id;
        store.swap_current(None, first).expect("first swap");
        store
            .transition(first_id, RunStatus::Pending, RunStatus::Running)
            .expect("start");
        store
            .transition(first_id, RunStatus::Running, RunStatus::Completed)
            .expect("complete");

        let outcome = store.swap_current(Some(first_id), pending("ci-1")).expect("swap");
        assert_eq!(outcome, SwapOutcome::Installed { cancelled: None });
        let first = store.get(first_id).expect("get").expect("first run exists");
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.superseded_by, None);
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let store = InMemoryRunStore::new();
        let first = pending("ci-1");
        let first_id = first.id;
        store.swap_current(None, first).expect("first swap");

        let outcome = store.swap_current(None, pending("ci-1")).expect("swap");
        assert_eq!(outcome, SwapOutcome::Conflict { current: Some(first_id) });
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn transition_compares_status() {
        let store = InMemoryRunStore::new();
        let run = pending("ci-1");
        let id = run.id;
        store.swap_current(None, run).expect("swap");

        let err = store
            .transition(id, RunStatus::Running, RunStatus::Completed)
            .expect_err("run is still pending");
        assert_eq!(
            err,
            StoreError::StatusMismatch {
                run_id: id,
                expected: RunStatus::Running,
                actual: RunStatus::Pending,
            }
        );

        let unknown = RunId::new_random();
        assert_eq!(
            store.transition(unknown, RunStatus::Pending, RunStatus::Running),
            Err(StoreError::UnknownRun { run_id: unknown })
        );
    }

    #[test]
    fn groups_are_independent() {
        let store = InMemoryRunStore::new();
        let a = pending("ci-a");
        let a_id = a.id;
        store.swap_current(None, a).expect("swap a");
        let outcome = store.swap_current(None, pending("ci-b")).expect("swap b");

        assert_eq!(outcome, SwapOutcome::Installed { cancelled: None });
        let a = store.get(a_id).expect("get").expect("run a exists");
        assert_eq!(a.status, RunStatus::Pending);
        assert_eq!(store.runs_in_group(&group("ci-a")).len(), 1);
    }
}
