//! Tracing and logging setup shared by the worker binaries.

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub use tracing::{LogFormat, ParseLogFormatError, init_with_format};

/// Tracing configuration (filters, output format).
pub mod tracing;
