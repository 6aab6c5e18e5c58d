//! Read-only inspection commands: URL classification and strategy chains.

use mediafetch::{MediaEngine, Platform};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Print the platform a URL maps to and the chain that would serve it.
pub fn classify(runner: &CliRunner, url: &str) -> Result<(), CliError> {
    let engine = MediaEngine::from_config(runner.config().clone())?;
    let platform = Platform::classify(url);
    let chain = engine.orchestrator().registry().chain_names(platform);

    println!("URL:      {}", url);
    println!("Platform: {}", platform);
    println!("Chain:    {}", chain.join(" -> "));
    Ok(())
}

/// Print every platform's strategy chain.
pub fn chains(runner: &CliRunner) -> Result<(), CliError> {
    let engine = MediaEngine::from_config(runner.config().clone())?;
    let registry = engine.orchestrator().registry();
    let config = runner.config();

    println!("Strategy chains");
    println!("===============");
    for platform in Platform::ALL {
        let marker = if registry.has_chain(platform) {
            ""
        } else {
            " (generic fallback)"
        };
        println!(
            "{:<10} {}{}  [timeout {}s]",
            platform.as_str(),
            registry.chain_names(platform).join(" -> "),
            marker,
            config.orchestrator.timeout_for(platform).as_secs()
        );
    }

    match engine.proxies() {
        Some(pool) => {
            println!();
            println!("Proxies ({}):", pool.len());
            for status in pool.status() {
                println!(
                    "  {:<28} failures={}",
                    status.endpoint.key(),
                    status.consecutive_failures
                );
            }
        }
        None => println!("\nProxies: none configured"),
    }
    Ok(())
}
