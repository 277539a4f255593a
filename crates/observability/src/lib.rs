//! Process-wide tracing setup shared by the binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LOG_JSON_ENV;

/// Initialize tracing from the environment (`RUST_LOG`, `STOCKSYNC_LOG_JSON`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing with an explicit default filter and output format.
/// `RUST_LOG` still takes precedence over `default_filter`.
pub fn init_with(default_filter: &str, json: bool) {
    tracing::init_with(default_filter, json);
}
