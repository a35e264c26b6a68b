//! Append-only event stream at `.tkt/events.jsonl`.
//!
//! Product history consumed by `tkt history` and external dashboards. It is
//! written regardless of `RUST_LOG`; see `logging` for dev diagnostics.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

/// Event types written by builds and loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    WorkflowStart,
    NodeStart,
    NodeComplete,
    NodeFail,
    NodeRetry,
    WorkflowComplete,
    BuildComplete,
    LoopTicketStart,
    LoopTicketComplete,
    LoopSummary,
    BuildError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStart => "workflow_start",
            EventKind::NodeStart => "node_start",
            EventKind::NodeComplete => "node_complete",
            EventKind::NodeFail => "node_fail",
            EventKind::NodeRetry => "node_retry",
            EventKind::WorkflowComplete => "workflow_complete",
            EventKind::BuildComplete => "build_complete",
            EventKind::LoopTicketStart => "loop_ticket_start",
            EventKind::LoopTicketComplete => "loop_ticket_complete",
            EventKind::LoopSummary => "loop_summary",
            EventKind::BuildError => "build_error",
        }
    }
}

/// One decoded line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Failures are logged and swallowed.
    pub fn emit(&self, kind: EventKind, ticket: Option<&str>, fields: Value) {
        if let Err(err) = self.try_emit(kind, ticket, fields) {
            warn!(event = kind.as_str(), err = %format!("{err:#}"), "failed to append event");
        }
    }

    pub fn try_emit(&self, kind: EventKind, ticket: Option<&str>, fields: Value) -> Result<()> {
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert("event".to_string(), json!(kind.as_str()));
        if let Some(ticket) = ticket {
            record.insert("ticket".to_string(), json!(ticket));
        }
        if let Value::Object(extra) = fields {
            for (key, value) in extra {
                record.entry(key).or_insert(value);
            }
        }
        let mut line = serde_json::to_string(&Value::Object(record)).context("serialize event")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", self.path.display()))
    }

    /// Read every record, optionally filtered to one ticket. Malformed lines are skipped.
    pub fn read(&self, ticket: Option<&str>) -> Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read event log {}", self.path.display()))?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<EventRecord>(line).ok())
            .filter(|record| ticket.is_none_or(|id| record.ticket.as_deref() == Some(id)))
            .collect())
    }
}
