//! Typed error taxonomy for node execution and builds.

use std::time::Duration;

use thiserror::Error;

use crate::core::disposition::DispositionError;
use crate::core::selector::EligibilityError;

/// A node attempt failed in a way that may succeed on retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("timed out after {}", timeout_label(.after))]
    Timeout { after: Duration },
    #[error("exited with status {}{}", exit_label(.code), output_tail(.output))]
    NonZeroExit { code: Option<i32>, output: String },
    #[error("malformed disposition: {0}")]
    MalformedDisposition(#[from] DispositionError),
    #[error("{kind} reference '{name}' not found")]
    MissingReference { kind: &'static str, name: String },
    #[error("harness error: {0}")]
    Harness(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl ExecutionError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        ExecutionError::Io(format!("{err:#}"))
    }
}

fn timeout_label(after: &Duration) -> String {
    crate::core::duration::format_duration(*after)
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

const TAIL_CHARS: usize = 400;

fn output_tail(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let count = trimmed.chars().count();
    let tail: String = if count > TAIL_CHARS {
        trimmed.chars().skip(count - TAIL_CHARS).collect()
    } else {
        trimmed.to_string()
    };
    format!(": {tail}")
}

/// A build could not run or could not persist its result.
///
/// Outcomes (fail/blocked/decompose) are not errors; see `BuildOutcome`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Ineligible(#[from] EligibilityError),
    #[error("pipeline config: {0:#}")]
    Config(anyhow::Error),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}
