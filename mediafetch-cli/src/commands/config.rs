//! Configuration CLI commands.

use clap::Subcommand;
use mediafetch::EngineConfig;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the default configuration file path
    Path,

    /// Show the effective configuration
    Show,
}

/// Run a config subcommand.
pub fn run(runner: &CliRunner, command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => {
            let path = EngineConfig::default_path().ok_or_else(|| {
                CliError::Config("Could not determine the user config directory".to_string())
            })?;
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommands::Show => {
            show(runner.config());
            Ok(())
        }
    }
}

fn show(config: &EngineConfig) {
    let retry = &config.orchestrator.retry;

    println!("[engine]");
    println!("staging_dir = {}", config.files.staging_dir.display());
    println!("max_concurrent = {}", config.admission.max_concurrent);
    println!("requester_ttl_secs = {}", config.admission.requester_ttl.as_secs());
    println!("attempt_timeout_secs = {}", config.orchestrator.attempt_timeout.as_secs());
    println!();
    println!("[retry]");
    println!("base_delay_ms = {}", retry.base_delay().as_millis());
    println!("max_retries = {}", retry.max_retries());
    println!();
    println!("[proxy]");
    println!("endpoints = {}", config.proxy.endpoints.len());
    println!("failure_threshold = {}", config.proxy.rotator.failure_threshold);
    println!("cooldown_secs = {}", config.proxy.rotator.cooldown.as_secs());
    println!();
    println!("[files]");
    println!("ttl_secs = {}", config.files.ttl.as_secs());
    println!("sweep_interval_secs = {}", config.files.sweep_interval.as_secs());
    println!();
    println!("[extractor]");
    println!("binary = {}", config.extractor.binary.display());
    println!("use_proxy = {}", config.extractor.use_proxy);
    println!();
    println!("[scraper]");
    println!("cobalt_api_url = {}", config.scraper.cobalt_api_url);
    println!(
        "cobalt_token = {}",
        if config.scraper.cobalt_token.is_some() { "(set)" } else { "(not set)" }
    );
}
