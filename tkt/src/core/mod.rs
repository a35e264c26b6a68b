//! Deterministic, pure logic shared by the build engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod disposition;
pub mod duration;
pub mod invariants;
pub mod limits;
pub mod pipeline;
pub mod selector;
pub mod types;
