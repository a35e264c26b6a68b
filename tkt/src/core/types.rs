//! Shared deterministic types for build and loop outcomes.
//!
//! These types define stable contracts between the node runner, the build
//! orchestrator, and the loop scheduler. They carry no I/O handles.

use serde::{Deserialize, Serialize};

use crate::core::disposition::Disposition;
use crate::ticket::Status;

/// Successful execution of one node.
///
/// Retryable failures never show up here; they stay on the error arm of the
/// runner's `Result` so retry logic only ever inspects errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeResult {
    /// Action node finished; its output feeds later nodes.
    Success { output: String },
    /// Decision node produced an authoritative disposition.
    Signal {
        disposition: Disposition,
        output: String,
    },
}

impl NodeResult {
    pub fn output(&self) -> &str {
        match self {
            NodeResult::Success { output } | NodeResult::Signal { output, .. } => output,
        }
    }
}

/// Terminal result of one ticket build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// The active workflow ran to completion.
    Succeeded { workflow: String, status: Status },
    /// A node failed (signal, exhausted retries, visit cap, or hook failure).
    Failed { stage: String, reason: String },
    /// A decision node reported the ticket as blocked.
    Blocked {
        stage: String,
        reason: String,
        blocked_on: Option<String>,
    },
    /// The ticket was split into children it now depends on.
    Decomposed { children: Vec<String> },
}

impl BuildOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildOutcome::Succeeded { .. } => "succeeded",
            BuildOutcome::Failed { .. } => "failed",
            BuildOutcome::Blocked { .. } => "blocked",
            BuildOutcome::Decomposed { .. } => "decomposed",
        }
    }

    /// Whether `tkt build` should exit 0 for this outcome.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BuildOutcome::Succeeded { .. } | BuildOutcome::Decomposed { .. }
        )
    }
}
