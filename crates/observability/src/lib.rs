//! Process-wide logging setup shared by the tally binaries.

/// Initialize process-wide tracing using `TALLY_LOG_FORMAT` to pick the
/// output format.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (format selection, filters).
pub mod tracing;

pub use self::tracing::{LOG_FORMAT_ENV, LogFormat, init_with};
