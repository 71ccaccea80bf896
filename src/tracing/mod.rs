//! Logging setup.
//!
//! Logs go to stdout, filtered to this crate at the requested level
//! (`ERROR` by default). Setting `SESSIONFLOW_LOG` to an
//! [`EnvFilter`] directive string overrides the level entirely.
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::errors::ConfigError;

pub const LOG_ENV_VAR: &str = "SESSIONFLOW_LOG";

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            _ => Err(ConfigError::LogLevel(level.to_string())),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install the global log subscriber.
///
/// Calling this more than once only logs a warning.
pub fn setup(log_level: Option<&str>) -> Result<(), ConfigError> {
    // Prepare the log layer
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .map_err(|_| ConfigError::LogLevel(directives.clone()))?;
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
        Err(_) => {
            let log_level = get_log_level(log_level)?;
            set_global_subscriber(
                Registry::default().with(
                    logs.with_filter(Targets::new().with_target("sessionflow", log_level)),
                ),
            );
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, e.g. when a
    // program runs more than one pipeline in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("INFO")).unwrap(), LevelFilter::INFO);
    assert_eq!(get_log_level(Some("trace")).unwrap(), LevelFilter::TRACE);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(ConfigError::LogLevel(level)) if level == "loud"
    ));
}
