//! Ready-queue selection and build eligibility.

use std::cmp::Reverse;
use std::collections::HashMap;

use thiserror::Error;

use crate::ticket::{Status, Ticket};

/// Why a ticket cannot be built right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityError {
    #[error("ticket {id} is already running (status in_progress)")]
    AlreadyRunning { id: String },
    #[error("ticket {id} is already closed{}", closed_suffix(.audit))]
    AlreadyClosed { id: String, audit: Option<String> },
    #[error("ticket {id} is {status} and not eligible for a build (must be open)")]
    NotEligible { id: String, status: String },
    #[error("ticket {id} has unresolved dependencies: {}", .open.join(", "))]
    DependenciesOpen { id: String, open: Vec<String> },
    #[error("ticket {id} has unknown status '{status}'")]
    UnknownStatus { id: String, status: String },
}

fn closed_suffix(audit: &Option<String>) -> String {
    audit
        .as_deref()
        .map(|note| format!(" ({note})"))
        .unwrap_or_default()
}

/// Check whether `ticket` may start a build given its unresolved dependencies.
pub fn check_eligibility(ticket: &Ticket, open_deps: &[String]) -> Result<(), EligibilityError> {
    let id = ticket.id.clone();
    match &ticket.status {
        Status::Open => {
            if open_deps.is_empty() {
                Ok(())
            } else {
                Err(EligibilityError::DependenciesOpen {
                    id,
                    open: open_deps.to_vec(),
                })
            }
        }
        Status::InProgress => Err(EligibilityError::AlreadyRunning { id }),
        Status::Closed => Err(EligibilityError::AlreadyClosed {
            id,
            audit: ticket.closed_audit().map(str::to_string),
        }),
        Status::Blocked | Status::Captured | Status::Routed => Err(EligibilityError::NotEligible {
            id,
            status: ticket.status.to_string(),
        }),
        Status::Unknown(raw) => Err(EligibilityError::UnknownStatus {
            id,
            status: raw.clone(),
        }),
    }
}

/// Dependencies of `ticket` that are not closed. Unknown ids count as open.
pub fn open_dependencies(ticket: &Ticket, index: &HashMap<&str, &Ticket>) -> Vec<String> {
    ticket
        .deps
        .iter()
        .filter(|dep| {
            index
                .get(dep.as_str())
                .is_none_or(|found| found.status != Status::Closed)
        })
        .cloned()
        .collect()
}

/// Tickets that can be built now, in scheduling order.
///
/// Only open/in_progress tickets whose dependencies are all closed qualify.
/// Order: ascending priority, then status class, then most recently modified.
pub fn ready_queue(tickets: &[Ticket]) -> Vec<&Ticket> {
    let index: HashMap<&str, &Ticket> = tickets.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut ready: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| matches!(t.status, Status::Open | Status::InProgress))
        .filter(|t| open_dependencies(t, &index).is_empty())
        .collect();
    ready.sort_by_key(|t| (t.priority, status_rank(&t.status), Reverse(t.modified)));
    ready
}

fn status_rank(status: &Status) -> u8 {
    match status {
        Status::InProgress => 0,
        Status::Open => 1,
        Status::Closed => 3,
        _ => 2,
    }
}
