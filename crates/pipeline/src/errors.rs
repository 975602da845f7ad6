//! Top-level error and retry-policy types for the Runlane domain.
//!
//! [`PipelineError`] covers conditions the controller surfaces to its caller.
//! Storage-level failures are [`StoreError`]; the controller translates the
//! ones with domain meaning (unknown run, status mismatch) and wraps the rest.
//!
//! [`RetryPolicy`] is a cross-cutting concern: callers use it to decide
//! whether re-submitting the same request can succeed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{GroupKey, RunId, RunStatus};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: lost compare-and-swap races, transient store failures.
/// - `NonRetryable` errors: invalid events, illegal status transitions,
///   invalid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry
        /// immediately or apply the caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors reported by a [`crate::RunStore`] implementation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum StoreError {
    /// No run with this identifier exists in the store.
    #[error("Unknown run: {run_id}")]
    UnknownRun {
        /// The identifier that was looked up.
        run_id: RunId,
    },

    /// A compare-and-set on a run's status found a different status than expected.
    #[error("Run {run_id} is {actual}, expected {expected}")]
    StatusMismatch {
        /// The run whose status was compared.
        run_id: RunId,
        /// Status the caller expected.
        expected: RunStatus,
        /// Status actually stored.
        actual: RunStatus,
    },

    /// A run with this identifier has already been inserted.
    #[error("Duplicate run: {run_id}")]
    DuplicateRun {
        /// The identifier that collided.
        run_id: RunId,
    },

    /// The backing store failed for a reason outside the domain.
    #[error("Run store unavailable: {message}")]
    Unavailable {
        /// Description of the backend failure.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Controller-level errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the run controller and configuration validation.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// The trigger event lacks the fields needed to derive a concurrency group.
    ///
    /// Rejected before any run is created; never retried.
    #[error("Invalid event: {reason}")]
    InvalidEvent {
        /// Why the event was rejected.
        reason: String,
    },

    /// No run with this identifier is known to the controller.
    #[error("Run not found: {run_id}")]
    RunNotFound {
        /// The identifier that was looked up.
        run_id: RunId,
    },

    /// The requested status change is not allowed by the run state machine.
    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The run whose status was to change.
        run_id: RunId,
        /// Status at the time of the attempt.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },

    /// The group's current-run slot kept changing underneath the controller.
    #[error("Concurrency group {group} changed on every one of {attempts} swap attempts")]
    StoreConflict {
        /// The contended group.
        group: GroupKey,
        /// How many swaps were attempted.
        attempts: u32,
    },

    /// The workflow configuration is invalid.
    ///
    /// Produced at load time; the controller never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// The run store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Classifies whether the failed operation may be retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::StoreConflict { .. } | Self::Store(StoreError::Unavailable { .. }) => {
                RetryPolicy::Retryable { after: None }
            }
            _ => RetryPolicy::NonRetryable,
        }
    }
}
