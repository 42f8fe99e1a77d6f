//! Tracing and logging setup shared by stockguard binaries.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use tracing::{LogFormat, ParseLogFormatError};

/// Initialize process-wide tracing with JSON logs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize process-wide tracing with the given output format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}
