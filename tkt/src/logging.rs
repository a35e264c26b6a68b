//! Development-time tracing for debugging tkt.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   In background mode stderr is `.tkt/loop.log`.
//!
//! - **Event stream (`io/events`)**: Product history in `.tkt/events.jsonl`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_level` when unset or invalid.
/// `tkt loop` passes `info`, everything else `warn`.
///
/// # Example
/// ```bash
/// RUST_LOG=tkt=debug tkt build ab12
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
