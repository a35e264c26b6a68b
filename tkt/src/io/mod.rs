//! I/O helpers for tkt commands.

pub mod artifacts;
pub mod config;
pub mod events;
pub mod executor;
pub mod harness;
pub mod hooks;
pub mod init;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod ticket_store;
