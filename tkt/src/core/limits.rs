//! Loop stop limits.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

/// Optional bounds on a loop run. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_tickets: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl LoopLimits {
    /// Decide whether the loop may start another build.
    ///
    /// `max_tickets` is checked before `max_duration`.
    pub fn should_continue(&self, processed: u32, elapsed: Duration) -> Result<(), StopReason> {
        if let Some(max) = self.max_tickets
            && processed >= max
        {
            return Err(StopReason::MaxTickets);
        }
        if let Some(max) = self.max_duration
            && elapsed >= max
        {
            return Err(StopReason::MaxDuration);
        }
        Ok(())
    }
}

/// Why a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal,
    MaxTickets,
    MaxDuration,
    Empty,
    BuildError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Signal => "signal",
            StopReason::MaxTickets => "max_tickets",
            StopReason::MaxDuration => "max_duration",
            StopReason::Empty => "empty",
            StopReason::BuildError => "build_error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
