//! Tracing/logging initialization.
//!
//! JSON lines with timestamps by default; compact text when
//! `STOCKSYNC_LOG_JSON` is off. Filtering always honours `RUST_LOG`.

use tracing_subscriber::EnvFilter;

pub const LOG_JSON_ENV: &str = "STOCKSYNC_LOG_JSON";

const DEFAULT_FILTER: &str = "info";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(DEFAULT_FILTER, json_from_env());
}

pub fn init_with(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

fn json_from_env() -> bool {
    std::env::var(LOG_JSON_ENV).map_or(true, |raw| parse_flag(&raw).unwrap_or(true))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
