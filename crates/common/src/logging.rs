//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Levels accepted for `server.log_level` and `--log-level`
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Whether a configured level names one of [`LOG_LEVELS`].
pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.contains(&level)
}

/// Filter directives for a configured level: the viiper crates log at the
/// chosen level while dependencies stay at `warn`, so `--log-level trace`
/// surfaces URB and session traffic without drowning it in runtime
/// internals.
fn directives(level: &str) -> String {
    format!("warn,server={level},common={level},protocol={level}")
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` wins over the configured default level when set.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    if !is_valid_level(default_level) {
        return Err(crate::Error::Config(format!(
            "invalid log level '{}', must be one of: {}",
            default_level,
            LOG_LEVELS.join(", ")
        )));
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(default_level)))
        .map_err(|e| crate::Error::Config(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}
