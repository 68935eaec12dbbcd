//! Structured logging for the satlink client.
//!
//! Console output goes to stderr so it never interleaves with event output on
//! stdout. Debug builds additionally write JSON lines to `satlink.log` for
//! post-mortem analysis of receiver sessions.

use std::path::Path;

use satlink_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "satlink.log";

/// Resolve the filter directive: the config's level if set, else [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. When `debug_build`
/// is set and `log_dir` is writable, a JSON file layer is added.
///
/// # Examples
///
/// ```no_run
/// use satlink_log::init_logging;
/// use satlink_config::Config;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
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

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
