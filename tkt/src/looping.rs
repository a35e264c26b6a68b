//! Continuous build loop for `tkt loop`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::context::BuildContext;
use crate::core::limits::{LoopLimits, StopReason};
use crate::core::selector::ready_queue;
use crate::core::types::BuildOutcome;
use crate::exit_codes;
use crate::io::events::EventKind;
use crate::io::lock::LoopLock;
use crate::io::ticket_store::write_atomic;
use crate::orchestrator::{build_ticket, revert_interrupted};
use crate::ticket::Status;

/// Non-blocking check for an external stop request.
pub trait StopSignal {
    fn requested(&self) -> bool;
}

/// Stop request expressed as the presence of a file (`tkt stop --graceful`).
#[derive(Debug, Clone)]
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn request(&self) -> Result<()> {
        fs::write(&self.path, format!("{}\n", Utc::now().to_rfc3339()))
            .with_context(|| format!("write {}", self.path.display()))
    }

    pub fn clear(&self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "failed to clear stop request");
        }
    }
}

impl StopSignal for StopFile {
    fn requested(&self) -> bool {
        self.path.exists()
    }
}

/// Counters and stop reason for one loop run; also the `loop-report.json` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopResult {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub blocked: u32,
    pub decomposed: u32,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoopResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            blocked: 0,
            decomposed: 0,
            stop_reason: StopReason::Empty,
            started_at,
            finished_at: started_at,
            error: None,
        }
    }

    fn record(&mut self, outcome: &BuildOutcome) {
        self.processed += 1;
        match outcome {
            BuildOutcome::Succeeded { .. } => self.succeeded += 1,
            BuildOutcome::Failed { .. } => self.failed += 1,
            BuildOutcome::Blocked { .. } => self.blocked += 1,
            BuildOutcome::Decomposed { .. } => self.decomposed += 1,
        }
    }

    /// `tkt loop` fails only when a build error stopped the run.
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            exit_codes::FAILED
        } else {
            exit_codes::OK
        }
    }

    /// One-line human summary printed by `tkt loop`.
    pub fn summary(&self) -> String {
        let secs = (self.finished_at - self.started_at).num_seconds().max(0);
        let mut line = format!(
            "processed {} ticket(s): {} succeeded, {} failed, {} blocked, {} decomposed; stopped: {} after {}s",
            self.processed,
            self.succeeded,
            self.failed,
            self.blocked,
            self.decomposed,
            self.stop_reason,
            secs,
        );
        if let Some(err) = &self.error {
            line.push_str(&format!(" ({err})"));
        }
        line
    }
}

/// Build ready tickets one at a time until a stop condition is met.
///
/// Holds the project's loop lock for the whole run and sets the loop guard on
/// every process it spawns. `on_ticket` is called after each finished build.
#[instrument(skip_all)]
pub fn run_loop<F: FnMut(&str, &BuildOutcome)>(
    ctx: &BuildContext<'_>,
    limits: &LoopLimits,
    stop: &dyn StopSignal,
    mut on_ticket: F,
) -> Result<LoopResult> {
    let _lock = LoopLock::acquire(&ctx.paths.lock_path)?;
    let stop_file = StopFile::new(&ctx.paths.stop_path);
    stop_file.clear();
    let ctx = ctx.with_loop_guard();

    let clock = Instant::now();
    let mut result = LoopResult::new(Utc::now());
    info!(?limits, "loop started");

    result.stop_reason = loop {
        if stop.requested() {
            break StopReason::Signal;
        }
        if let Err(reason) = limits.should_continue(result.processed, clock.elapsed()) {
            break reason;
        }
        let next = match next_ready(&ctx) {
            Ok(Some(next)) => next,
            Ok(None) => break StopReason::Empty,
            Err(err) => {
                result.error = Some(report_error(&ctx, None, format!("{err:#}")));
                break StopReason::BuildError;
            }
        };
        let id = next.0;

        ctx.events
            .emit(EventKind::LoopTicketStart, Some(id.as_str()), json!({ "status": next.1 }));
        match build_ticket(&ctx, &id) {
            Ok(outcome) => {
                result.record(&outcome);
                ctx.events.emit(
                    EventKind::LoopTicketComplete,
                    Some(id.as_str()),
                    json!({ "outcome": outcome }),
                );
                on_ticket(&id, &outcome);
            }
            Err(err) => {
                result.error = Some(report_error(&ctx, Some(id.as_str()), err.to_string()));
                break StopReason::BuildError;
            }
        }
    };

    result.finished_at = Utc::now();
    stop_file.clear();
    ctx.events.emit(
        EventKind::LoopSummary,
        None,
        serde_json::to_value(&result).unwrap_or_default(),
    );
    if let Err(err) = write_report(&ctx.paths.report_path, &result) {
        warn!(error = %format!("{err:#}"), "failed to write loop report");
    }
    info!(
        processed = result.processed,
        reason = result.stop_reason.as_str(),
        "loop finished"
    );
    Ok(result)
}

/// Head of the ready queue, reopening it first if an interrupted build left it in progress.
fn next_ready(ctx: &BuildContext<'_>) -> Result<Option<(String, Status)>> {
    let tickets = ctx.store.list()?;
    let Some(head) = ready_queue(&tickets).first().copied() else {
        return Ok(None);
    };
    let status = head.status.clone();
    if status == Status::InProgress {
        // The lock is ours, so no other build can own this ticket.
        revert_interrupted(ctx, &head.id)?;
    }
    Ok(Some((head.id.clone(), status)))
}

fn report_error(ctx: &BuildContext<'_>, ticket: Option<&str>, message: String) -> String {
    error!(ticket = ?ticket, error = %message, "loop stopped on build error");
    ctx.events
        .emit(EventKind::BuildError, ticket, json!({ "error": message }));
    message
}

fn write_report(path: &Path, result: &LoopResult) -> Result<()> {
    let raw = serde_json::to_string_pretty(result).context("serialize loop report")?;
    write_atomic(path, &format!("{raw}\n"))
}
