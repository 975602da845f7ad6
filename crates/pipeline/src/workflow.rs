//! Workflow configuration: which branches trigger runs and which check jobs a
//! run executes.
//!
//! The job definitions are configuration data. The tools they name are opaque
//! to Runlane; the executor only launches them and records whether they passed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{PipelineError, TriggerEvent, WorkflowName};

/// Workflow name used when no configuration file is supplied.
pub const DEFAULT_WORKFLOW_NAME: &str = "ci";

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One check job: an external program invoked with fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Job name, unique within the workflow.
    pub name: String,

    /// Program to launch (looked up on `PATH`).
    pub program: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Toolchain override exported to the job as `RUSTUP_TOOLCHAIN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<String>,
}

impl JobSpec {
    /// Creates a job running `program` with `args` on the default toolchain.
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            toolchain: None,
        }
    }

    /// Renders the command line for logs (`program arg1 arg2`).
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The default check jobs: formatting, lints, docs, feature powerset and
/// minimum supported Rust version.
pub fn default_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec::new("fmt", "cargo", &["fmt", "--all", "--", "--check"]),
        JobSpec::new(
            "clippy",
            "cargo",
            &["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"],
        ),
        JobSpec::new("docs", "cargo", &["doc", "--no-deps", "--all-features"]),
        JobSpec::new("hack", "cargo", &["hack", "--feature-powerset", "check"]),
        JobSpec::new("msrv", "cargo", &["hack", "--rust-version", "check"]),
    ]
}

fn default_branches() -> Vec<String> {
    vec!["main".to_string(), "release".to_string()]
}

fn default_name() -> String {
    DEFAULT_WORKFLOW_NAME.to_string()
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Triggers and jobs of one workflow, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Workflow name; prefix of every concurrency group key.
    #[serde(default = "default_name")]
    pub name: String,

    /// Protected branches. Pushes to these, and pull requests targeting
    /// them, start runs.
    #[serde(default = "default_branches")]
    pub branches: Vec<String>,

    /// Check jobs executed in parallel for every run.
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobSpec>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            branches: default_branches(),
            jobs: default_jobs(),
        }
    }
}

impl WorkflowConfig {
    /// Checks the configuration and returns the typed workflow name.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConfigurationError`] for an empty name, an empty
    /// branch list, or empty or duplicate job names.
    pub fn validate(&self) -> Result<WorkflowName, PipelineError> {
        let name = WorkflowName::new(self.name.trim()).ok_or_else(|| config_error(
            "workflow name must not be empty",
        ))?;

        if self.branches.iter().all(|b| b.trim().is_empty()) {
            return Err(config_error("at least one trigger branch is required"));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(config_error("job names must not be empty"));
            }
            if job.program.trim().is_empty() {
                return Err(config_error(&format!("job '{}' has no program", job.name)));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(config_error(&format!("duplicate job name '{}'", job.name)));
            }
        }

        Ok(name)
    }

    /// Returns `true` if the event should start a run: a push to a listed
    /// branch, or a pull request targeting one.
    pub fn accepts(&self, event: &TriggerEvent) -> bool {
        event
            .target_branch()
            .is_some_and(|target| self.branches.iter().any(|b| b == target))
    }
}

fn config_error(message: &str) -> PipelineError {
    PipelineError::ConfigurationError {
        message: message.to_string(),
    }
}
