//! Tracing and logging setup shared by every binary and test harness.

/// Initialize process-wide logging with the format from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init_with(LogFormat::from_env());
}

pub use crate::tracing::{init_with, LogFormat, ParseLogFormatError};

/// Subscriber configuration (filters, formats).
pub mod tracing;
