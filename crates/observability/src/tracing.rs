//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// The level comes from `LOG_LEVEL` (default `trace`), overridable with a
/// full `RUST_LOG` filter. `EVENTLY_ENV=production` switches from pretty
/// console output to JSON lines.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "trace".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let production = std::env::var("EVENTLY_ENV").is_ok_and(|v| v == "production");
    if production {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init();
    }
}
