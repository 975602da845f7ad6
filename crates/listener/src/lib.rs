//! Runlane trigger event source infrastructure.
//!
//! Implements the [`EventSource`] port over run-context envelopes: JSON
//! objects carrying the event name, the run identifier the CI platform
//! assigned, and the raw source-control webhook payload.
//!
//! ```json
//! { "event_name": "pull_request", "run_id": 42,
//!   "event": { "pull_request": { "head": { "ref": "topic" }, "base": { "ref": "main" } } } }
//! ```
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport details and payload deserialisation live
//! here. The [`pipeline`] crate sees only [`pipeline::TriggerEvent`].

use async_trait::async_trait;
use pipeline::TriggerEvent;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::debug;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while reading or decoding trigger events.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The envelope names an event Runlane does not handle.
    #[error("Unsupported event '{event_name}'")]
    UnsupportedEvent {
        /// The event name from the envelope.
        event_name: String,
    },

    /// The envelope or its payload is missing required fields.
    #[error("Malformed payload: {message}")]
    MalformedPayload {
        /// What was missing or invalid.
        message: String,
    },

    /// Reading from the underlying transport failed.
    #[error("Event source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ListenerError {
    fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    event_name: String,
    #[serde(default)]
    run_id: Value,
    #[serde(default)]
    event: Value,
}

/// Decodes one run-context envelope into a [`TriggerEvent`].
///
/// Correlation fields are not validated here; an empty or missing run
/// identifier is passed through as `""` so the controller can decide whether
/// the event still yields a concurrency group.
///
/// # Errors
///
/// [`ListenerError::MalformedPayload`] for invalid JSON or missing fields,
/// [`ListenerError::UnsupportedEvent`] for anything other than `push` and
/// `pull_request`.
pub fn parse_envelope(raw: &str) -> Result<TriggerEvent, ListenerError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|err| ListenerError::malformed(err.to_string()))?;

    let run_identifier = match &envelope.run_id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => {
            return Err(ListenerError::malformed(format!(
                "run_id must be a string or number, got {other}"
            )))
        }
    };

    match envelope.event_name.as_str() {
        "push" => {
            let git_ref = string_at(&envelope.event, "/ref")?;
            let branch = git_ref.strip_prefix(BRANCH_REF_PREFIX).ok_or_else(|| {
                ListenerError::malformed(format!("push ref '{git_ref}' is not a branch"))
            })?;
            Ok(TriggerEvent::push(branch, run_identifier))
        }
        "pull_request" => {
            let head = string_at(&envelope.event, "/pull_request/head/ref")?;
            let base = string_at(&envelope.event, "/pull_request/base/ref")?;
            Ok(TriggerEvent::pull_request(head, base, run_identifier))
        }
        _ => Err(ListenerError::UnsupportedEvent {
            event_name: envelope.event_name,
        }),
    }
}

fn string_at<'a>(payload: &'a Value, pointer: &str) -> Result<&'a str, ListenerError> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| ListenerError::malformed(format!("missing string at {pointer}")))
}

// ---------------------------------------------------------------------------
// Event sources
// ---------------------------------------------------------------------------

/// Source of trigger events.
#[async_trait]
pub trait EventSource: Send {
    /// Returns the next event, or `None` once the source is exhausted.
    ///
    /// A decoding error affects only the current event; callers may keep
    /// reading after one.
    async fn next_event(&mut self) -> Result<Option<TriggerEvent>, ListenerError>;
}

/// Reads one envelope per line from an async buffered reader (a file, a pipe,
/// or stdin). Blank lines are skipped.
#[derive(Debug)]
pub struct JsonLinesEventSource<R> {
    lines: Lines<R>,
    line_number: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesEventSource<R> {
    /// Wraps `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesEventSource<R> {
    async fn next_event(&mut self) -> Result<Option<TriggerEvent>, ListenerError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = parse_envelope(trimmed).inspect_err(|err| {
                debug!(line = self.line_number, error = %err, "undecodable envelope");
            })?;
            debug!(line = self.line_number, kind = %event.kind, branch = %event.branch, "decoded trigger event");
            return Ok(Some(event));
        }
        Ok(None)
    }
}
