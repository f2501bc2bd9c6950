//! Shared primitives: error taxonomy, clock, output truncation.

pub mod error;
pub mod truncate;

pub use error::{ToolError, ToolOutcome};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
