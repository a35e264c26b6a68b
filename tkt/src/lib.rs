//! Ticket build pipeline and loop scheduler.
//!
//! `tkt` drives an external coding agent through a configurable, branching
//! workflow on behalf of queued tickets. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (workflow graph, dispositions,
//!   eligibility, ready queue, loop limits). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (ticket files, subprocesses, harnesses,
//!   hooks, locking, events). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`node_runner`], [`orchestrator`], [`looping`],
//! [`lifecycle`]) coordinate core logic with I/O to implement CLI commands.

pub mod context;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod looping;
pub mod node_runner;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod ticket;
