//! Runlane CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load the workflow TOML file (or fall back to
//!    the default `main`/`release` workflow) and validate it.
//! 2. **Wire observability**: configure `tracing-subscriber` with an
//!    `EnvFilter` and either a human-readable or a JSON layer. All `tracing`
//!    spans and structured events emitted by every crate in the workspace flow
//!    through this layer. Logs go to stderr; stdout carries one JSON document
//!    per decision and per finished run.
//! 3. **Construct infrastructure**: create the in-memory run store, the
//!    controller, the event source and the job executor.
//! 4. **Run the event loop**: filter each trigger event, ask the controller
//!    for a decision, print it, and hand it to the executor. Reports of
//!    finished runs are printed as the loop goes, so a long-lived stdin
//!    stream keeps producing output.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use executor::{Executor, JobRunner, ProcessJobRunner, RunReport};
use listener::{EventSource, JsonLinesEventSource, ListenerError};
use pipeline::{InMemoryRunStore, RunController, RunStore, WorkflowConfig};
use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Decides which CI runs start and which are superseded, then runs the
/// workflow's check jobs.
#[derive(Debug, Parser)]
#[command(name = "runlane", version, about)]
struct Args {
    /// Workflow configuration file (TOML). Defaults to the built-in workflow.
    #[arg(long)]
    config: Option<PathBuf>,

    /// File of run-context envelopes, one JSON object per line. Defaults to stdin.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Working directory the check jobs run in.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Print decisions without running any jobs.
    #[arg(long)]
    dry_run: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<WorkflowConfig> {
    let Some(path) = path else {
        info!("no workflow configuration given, using defaults");
        return Ok(WorkflowConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow configuration {}", path.display()))?;
    let config: WorkflowConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse workflow configuration {}", path.display()))?;
    Ok(config)
}

fn emit<T: Serialize, W: Write>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn open_events(path: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open event file {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    })
}

/// What one pass over an event stream produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LoopSummary {
    decisions: usize,
    skipped: usize,
    reports: usize,
}

type RunJoin = Result<Result<RunReport, JoinError>, JoinError>;

fn emit_report<W: Write>(out: &mut W, joined: RunJoin, summary: &mut LoopSummary) -> Result<()> {
    match joined {
        Ok(Ok(report)) => {
            emit(out, &report)?;
            summary.reports += 1;
        }
        Ok(Err(err)) | Err(err) => error!(error = %err, "run task failed"),
    }
    Ok(())
}

/// Drives `source` to exhaustion: filters each event against the workflow,
/// asks the controller for a decision, writes it to `out`, and hands it to
/// `executor` when one is given. Reports of finished runs are written as soon
/// as they are seen; the rest are awaited once the source is exhausted.
async fn run_events<E, S, J, W>(
    source: &mut E,
    config: &WorkflowConfig,
    controller: &RunController<S>,
    executor: Option<&Executor<S, J>>,
    out: &mut W,
) -> Result<LoopSummary>
where
    E: EventSource,
    S: RunStore + 'static,
    J: JobRunner,
    W: Write,
{
    let mut summary = LoopSummary::default();
    let mut runs: JoinSet<Result<RunReport, JoinError>> = JoinSet::new();

    loop {
        while let Some(joined) = runs.try_join_next() {
            emit_report(out, joined, &mut summary)?;
        }

        let event = match source.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err @ ListenerError::Io(_)) => {
                return Err(err).context("failed to read trigger events");
            }
            Err(err) => {
                warn!(error = %err, "skipping event");
                summary.skipped += 1;
                continue;
            }
        };

        if !config.accepts(&event) {
            info!(kind = %event.kind, branch = ?event.target_branch(), "event does not match workflow branches");
            summary.skipped += 1;
            continue;
        }

        let decision = match controller.on_trigger(event) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, retry = ?err.retry_policy(), "trigger rejected");
                summary.skipped += 1;
                continue;
            }
        };
        emit(out, &decision)?;
        summary.decisions += 1;

        if let Some(executor) = executor {
            runs.spawn(executor.dispatch(&decision));
        }
    }

    while let Some(joined) = runs.join_next().await {
        emit_report(out, joined, &mut summary)?;
    }

    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(args.config.as_deref())?;
    let workflow = config.validate()?;
    info!(%workflow, branches = ?config.branches, jobs = config.jobs.len(), "workflow loaded");

    let controller = Arc::new(RunController::new(workflow, InMemoryRunStore::new()));
    let executor = Executor::new(
        Arc::clone(&controller),
        ProcessJobRunner::new(args.workdir.clone()),
        config.jobs.clone(),
    );

    let mut source = JsonLinesEventSource::new(open_events(args.events.as_deref()).await?);
    let summary = run_events(
        &mut source,
        &config,
        &*controller,
        (!args.dry_run).then_some(&executor),
        &mut std::io::stdout(),
    )
    .await?;
    info!(
        decisions = summary.decisions,
        skipped = summary.skipped,
        reports = summary.reports,
        "event stream exhausted"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use executor::RunOutcome;

    use super::*;

    #[test]
    fn demo_workflow_parses_and_validates() {
        let config: WorkflowConfig =
            toml::from_str(include_str!("../../../demos/workflow.toml")).expect("valid TOML");
        assert_eq!(config.validate().expect("valid workflow").as_str(), "ci");
        assert_eq!(config.jobs.len(), 5);
        assert_eq!(config.jobs[2].toolchain.as_deref(), Some("nightly"));
        assert_eq!(config.jobs[4].toolchain, None);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: WorkflowConfig = toml::from_str(r#"name = "lint""#).expect("valid TOML");
        assert_eq!(config.branches, ["main", "release"]);
        assert_eq!(config.jobs, pipeline::default_jobs());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<WorkflowConfig>("nmae = \"typo\"").is_err());
    }

    #[test]
    fn args_parse_flags() {
        let args = Args::try_parse_from(["runlane", "--dry-run", "--log-format", "json"])
            .expect("valid arguments");
        assert!(args.dry_run);
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.workdir, PathBuf::from("."));
    }

    fn demo_events() -> JsonLinesEventSource<&'static [u8]> {
        JsonLinesEventSource::new(include_str!("../../../demos/events.jsonl").as_bytes())
    }

    fn demo_controller() -> RunController<InMemoryRunStore> {
        RunController::new(
            pipeline::WorkflowName::new("ci").expect("non-empty"),
            InMemoryRunStore::new(),
        )
    }

    fn output_lines(out: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(out)
            .expect("utf-8 output")
            .lines()
            .map(|line| serde_json::from_str(line).expect("one JSON document per line"))
            .collect()
    }

    #[tokio::test]
    async fn dry_run_emits_decisions_for_demo_events() {
        let config = WorkflowConfig::default();
        let controller = demo_controller();
        let mut out = Vec::new();

        let summary = run_events(
            &mut demo_events(),
            &config,
            &controller,
            None::<&Executor<InMemoryRunStore, ProcessJobRunner>>,
            &mut out,
        )
        .await
        .expect("event loop");

        assert_eq!(
            summary,
            LoopSummary {
                decisions: 3,
                skipped: 2,
                reports: 0
            }
        );
        let decisions: Vec<pipeline::RunDecision> = output_lines(&out)
            .into_iter()
            .map(|line| serde_json::from_value(line).expect("decision"))
            .collect();
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[0].group.as_str(), "ci-101");
        assert_eq!(decisions[0].cancelled_run_id, None);
        assert_eq!(decisions[1].group.as_str(), "ci-topic");
        assert_eq!(decisions[1].cancelled_run_id, None);
        assert_eq!(decisions[2].group.as_str(), "ci-topic");
        assert_eq!(decisions[2].cancelled_run_id, Some(decisions[1].new_run_id));

        // The unprotected-branch push and the push without a run id never reach the store.
        assert_eq!(controller.store().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executed_runs_are_reported_after_their_decisions() {
        let config = WorkflowConfig {
            jobs: vec![pipeline::JobSpec::new("ok", "true", &[])],
            ..WorkflowConfig::default()
        };
        let controller = Arc::new(demo_controller());
        let executor = Executor::new(
            Arc::clone(&controller),
            ProcessJobRunner::new("."),
            config.jobs.clone(),
        );
        let mut out = Vec::new();

        let summary = run_events(
            &mut demo_events(),
            &config,
            &*controller,
            Some(&executor),
            &mut out,
        )
        .await
        .expect("event loop");

        assert_eq!(summary.decisions, 3);
        assert_eq!(summary.reports, 3);
        let reports: Vec<RunReport> = output_lines(&out)
            .into_iter()
            .filter(|line| line.get("outcome").is_some())
            .map(|line| serde_json::from_value(line).expect("report"))
            .collect();
        let count = |outcome: RunOutcome| {
            reports.iter().filter(|r| r.outcome == outcome).count()
        };
        assert_eq!(count(RunOutcome::Completed), 2);
        assert_eq!(count(RunOutcome::Cancelled), 1);
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn load_config_without_path_uses_defaults() {
        let config = load_config(None).expect("defaults");
        assert_eq!(config, WorkflowConfig::default());
    }
}
