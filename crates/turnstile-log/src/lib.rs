//! Structured logging and tracing for Turnstile processes.
//!
//! Console output with uptime timestamps and module paths, plus an optional
//! JSON log file. The configured level is the default filter; `RUST_LOG`
//! overrides it.

use std::path::Path;

use turnstile_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config specify one.
const DEFAULT_FILTER: &str = "info";

/// File name of the JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "turnstile.log";

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - Console output with uptime, targets, and severity levels
/// - A JSON file layer when `config.debug.json_log` is set and
///   `config.debug.log_dir` can be created
/// - Environment-based filtering (`RUST_LOG` wins over `config.debug.log_level`)
///
/// # Examples
///
/// ```no_run
/// use turnstile_config::Config;
/// use turnstile_log::init_logging;
///
/// init_logging(None);
///
/// let config = Config::default();
/// init_logging(Some(&config));
/// ```
pub fn init_logging(config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let log_dir = config
        .filter(|c| c.debug.json_log)
        .and_then(|c| c.debug.log_dir.as_deref());

    if let Some(log_file) = log_dir.and_then(open_log_file) {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// The `debug.log_level` directive, or [`DEFAULT_FILTER`] when unset.
fn configured_directive(config: Option<&Config>) -> &str {
    config
        .map(|c| c.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
}

/// Create the log directory and open a fresh log file inside it.
fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
