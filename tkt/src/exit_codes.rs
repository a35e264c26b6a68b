//! Stable exit codes for tkt CLI commands.

/// Command succeeded; `build` ended succeeded or decomposed.
pub const OK: i32 = 0;
/// Command failed, or `build` ended failed or blocked.
pub const FAILED: i32 = 1;
