//! Shared command setup: configuration loading and logging.

use std::path::{Path, PathBuf};

use mediafetch::{init_logging, EngineConfig, LoggingGuard};

use crate::error::CliError;

/// Filter used with `--verbose`.
const VERBOSE_FILTER: &str = "debug,hyper=info,reqwest=info";

/// Loaded configuration plus the logging guard for one CLI invocation.
pub struct CliRunner {
    config: EngineConfig,
    source: Option<PathBuf>,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Loads configuration and installs logging.
    ///
    /// An explicit `--config` path must exist. Without one, the default
    /// location is used when present and built-in defaults otherwise.
    pub fn new(config_path: Option<&Path>, verbose: bool) -> Result<Self, CliError> {
        let (config, source) = load_config(config_path)?;
        let config = config.with_env_overrides()?;

        let mut logging = config.logging.clone();
        if verbose {
            logging.filter = VERBOSE_FILTER.to_string();
        }
        let guard = init_logging(&logging);

        Ok(Self {
            config,
            source,
            _logging: guard,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Logs what this invocation is about to do.
    pub fn log_startup(&self, command: &str) {
        match &self.source {
            Some(path) => tracing::info!(
                command,
                version = env!("CARGO_PKG_VERSION"),
                config = %path.display(),
                "mediafetch starting"
            ),
            None => tracing::info!(
                command,
                version = env!("CARGO_PKG_VERSION"),
                "mediafetch starting with built-in defaults"
            ),
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<(EngineConfig, Option<PathBuf>), CliError> {
    if let Some(path) = explicit {
        return Ok((EngineConfig::load(path)?, Some(path.to_path_buf())));
    }
    match EngineConfig::default_path() {
        Some(path) if path.exists() => Ok((EngineConfig::load(&path)?, Some(path))),
        _ => Ok((EngineConfig::default(), None)),
    }
}
