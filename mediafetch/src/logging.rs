//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once at startup. The filter defaults to [`DEFAULT_LOG_FILTER`] and can be
//! overridden through the `MEDIAFETCH_LOG` environment variable using the
//! usual `EnvFilter` directive syntax.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter directives.
pub const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn";

/// Environment variable overriding the filter.
pub const LOG_ENV_VAR: &str = "MEDIAFETCH_LOG";

/// Default prefix of rolling log files.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "mediafetch.log";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Filter directives used when `MEDIAFETCH_LOG` is unset.
    pub filter: String,
    /// Directory for daily-rolling log files; stderr only when `None`.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Colorize stderr output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }
}

/// Keeps the background log writer alive. Drop it last.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// Calling it again after a subscriber is installed leaves the first one in
/// place and returns an inert guard.
pub fn init_logging(config: &LoggingConfig) -> LoggingGuard {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_timer(LocalTime::rfc_3339())
        .with_target(true);

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            file_logging = config.directory.is_some(),
            "Logging initialized"
        );
        LoggingGuard { _file: guard }
    } else {
        LoggingGuard { _file: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter, "info,hyper=warn,reqwest=warn");
        assert!(config.directory.is_none());
    }

    #[test]
    fn test_second_init_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig::default()
            .with_filter("not a == valid directive")
            .with_directory(dir.path());

        let _first = init_logging(&config);
        let _second = init_logging(&config);
        tracing::info!("still logging");
    }
}
