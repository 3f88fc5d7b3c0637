//! Logging initialization.
//!
//! Installs a `tracing-subscriber` formatter on stderr. `RUST_LOG` takes
//! precedence over the level passed in; setting `AUTH_SYNC_LOG_FORMAT=json`
//! switches to one JSON object per line.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls are ignored.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("Extension started");
/// ```
pub fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(level).as_str().to_lowercase()));

    let json = std::env::var("AUTH_SYNC_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    if result.is_ok() {
        tracing::debug!(level, json, "logging initialized");
    }
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
