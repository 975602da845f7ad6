//! Core orchestration domain for Runlane.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type and error type used to decide which CI runs start and which are
//! superseded. Infrastructure crates implement the traits defined here; they
//! never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! The [`RunStore`] port defines *what* storage the controller needs; the CLI
//! decides *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`RunId`, `GroupKey`, etc.) |
//! | [`types`] | Trigger events, runs, run status, decisions, timestamps |
//! | [`errors`] | Domain and store error types, retry policy |
//! | [`store`] | [`RunStore`] port and the in-memory implementation |
//! | [`workflow`] | Workflow configuration, check jobs, trigger filter |
//! | [`controller`] | [`RunController`]: cancel-on-supersede decisions |

pub mod controller;
pub mod errors;
pub mod identifiers;
pub mod store;
pub mod types;
pub mod workflow;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use controller::{RunController, MAX_SWAP_ATTEMPTS};
pub use errors::{PipelineError, RetryPolicy, StoreError};
pub use identifiers::{GroupKey, RunId, WorkflowName};
pub use store::{InMemoryRunStore, RunStore, SwapOutcome};
pub use types::{EventKind, Run, RunDecision, RunStatus, Timestamp, TriggerEvent};
pub use workflow::{default_jobs, JobSpec, WorkflowConfig, DEFAULT_WORKFLOW_NAME};
