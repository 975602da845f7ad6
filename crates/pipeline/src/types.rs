//! Shared value types for the Runlane domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (a run status only moves forward, a
//! concurrency group key always has a non-empty suffix) and participate in
//! controller decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GroupKey, PipelineError, RunId, WorkflowName};

// ---------------------------------------------------------------------------
// Trigger events
// ---------------------------------------------------------------------------

/// Kind of source-control occurrence that requested a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A push to a branch.
    Push,
    /// A pull request opened or updated against a branch.
    PullRequest,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::PullRequest => write!(f, "pull_request"),
        }
    }
}

// ---------------------------------------------------------------------------

/// An external occurrence (push or pull request) that requests a new run.
///
/// Fields are kept as plain strings because events arrive from outside the
/// system; the controller validates them when deriving the concurrency group.
/// Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Whether this is a push or a pull request.
    pub kind: EventKind,

    /// Source branch: the pushed branch, or the pull request's head branch.
    pub branch: String,

    /// Pull request head reference. `None` for pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,

    /// Branch a pull request targets. `None` for pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Identifier the CI platform assigned to this trigger.
    pub run_identifier: String,
}

impl TriggerEvent {
    /// Creates a push event.
    pub fn push(branch: impl Into<String>, run_identifier: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Push,
            branch: branch.into(),
            head_ref: None,
            base_branch: None,
            run_identifier: run_identifier.into(),
        }
    }

    /// Creates a pull request event. The head reference doubles as the source branch.
    pub fn pull_request(
        head_ref: impl Into<String>,
        base_branch: impl Into<String>,
        run_identifier: impl Into<String>,
    ) -> Self {
        let head_ref = head_ref.into();
        Self {
            kind: EventKind::PullRequest,
            branch: head_ref.clone(),
            head_ref: Some(head_ref),
            base_branch: Some(base_branch.into()),
            run_identifier: run_identifier.into(),
        }
    }

    /// The branch the trigger filter matches against: the pushed branch for
    /// pushes, the targeted base branch for pull requests.
    pub fn target_branch(&self) -> Option<&str> {
        match self.kind {
            EventKind::Push => Some(self.branch.as_str()),
            EventKind::PullRequest => self.base_branch.as_deref(),
        }
    }

    /// Derives the concurrency group key for this event within `workflow`.
    ///
    /// The key is `<workflow>-<suffix>` where the suffix is the pull request
    /// head reference when present and non-empty, else the run identifier.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidEvent`] when neither a head reference nor a
    /// run identifier is available.
    pub fn concurrency_group(&self, workflow: &WorkflowName) -> Result<GroupKey, PipelineError> {
        let suffix = self
            .head_ref
            .as_deref()
            .filter(|head| !head.is_empty())
            .unwrap_or(self.run_identifier.as_str());

        if suffix.is_empty() {
            return Err(PipelineError::InvalidEvent {
                reason: "event has neither a pull request head ref nor a run identifier"
                    .to_string(),
            });
        }

        GroupKey::new(format!("{workflow}-{suffix}")).ok_or_else(|| PipelineError::InvalidEvent {
            reason: "derived concurrency group key is empty".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Run`].
///
/// `Pending → Running → Completed`, or `Pending | Running → Cancelled`.
/// `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created by a trigger, not yet picked up by the executor.
    Pending,
    /// Jobs are executing.
    Running,
    /// Superseded by a newer run in the same group.
    Cancelled,
    /// All jobs finished without the run being superseded.
    Completed,
}

impl RunStatus {
    /// Returns `true` for `Completed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` while the run can still be superseded.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Pending | Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------

/// One execution attempt of the workflow for a given trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Identifier assigned by the controller.
    pub id: RunId,

    /// Concurrency group this run belongs to.
    pub group: GroupKey,

    /// The trigger that created this run.
    pub event: TriggerEvent,

    /// Current lifecycle status.
    pub status: RunStatus,

    /// The newer run that cancelled this one, if it was superseded.
    pub superseded_by: Option<RunId>,

    /// When the run was created.
    pub created_at: Timestamp,

    /// When the status last changed.
    pub updated_at: Timestamp,
}

impl Run {
    /// Creates a new pending run with a fresh identifier.
    pub fn pending(group: GroupKey, event: TriggerEvent) -> Self {
        let now = Timestamp::now();
        Self {
            id: RunId::new_random(),
            group,
            event,
            status: RunStatus::Pending,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome of [`crate::RunController::on_trigger`], consumed by the executor.
///
/// Cancellation is expressed as data rather than performed here: the executor
/// decides how to realise it (signal, kill, or ignore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDecision {
    /// The run created for the incoming event.
    pub new_run_id: RunId,

    /// Group both runs belong to.
    pub group: GroupKey,

    /// The previously active run in the group that was cancelled, if any.
    pub cancelled_run_id: Option<RunId>,
}

impl RunDecision {
    /// Returns `true` if this decision superseded an in-flight run.
    pub fn supersedes(&self) -> bool {
        self.cancelled_run_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
