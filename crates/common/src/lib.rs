//! Shared helpers used across all crucible crates: error context, text
//! truncation and wall-clock time.

pub mod context;
pub mod text;
pub mod time;

pub use context::FromMessage;
