//! Mediafetch CLI - Command-line interface
//!
//! Downloads media through the mediafetch engine and exposes its
//! classification, chain and cleanup operations for inspection.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;

use commands::common::PlatformArg;
use commands::config::ConfigCommands;
use commands::fetch::FetchArgs;
use error::CliError;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "mediafetch", version, about = "Fallback-chain media downloader")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a video
    Fetch {
        /// Page or media URL
        url: String,

        /// Identity used for per-requester admission
        #[arg(long, default_value = "cli")]
        requester: String,

        /// Override URL-based platform detection
        #[arg(long, value_enum)]
        platform: Option<PlatformArg>,

        /// Directory to save the file to (defaults to the downloads directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print per-strategy and per-platform statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Show which platform and strategy chain a URL maps to
    Classify {
        url: String,
    },

    /// List the strategy chain of every platform
    Chains,

    /// Remove stale temp files from the staging directory
    Sweep,

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let runner = CliRunner::new(cli.config.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Fetch {
            url,
            requester,
            platform,
            output,
            stats,
        } => {
            commands::fetch::run(
                &runner,
                FetchArgs {
                    url,
                    requester,
                    platform,
                    output_dir: output,
                    stats,
                },
            )
            .await
        }
        Commands::Classify { url } => commands::inspect::classify(&runner, &url),
        Commands::Chains => commands::inspect::chains(&runner),
        Commands::Sweep => commands::sweep::run(&runner).await,
        Commands::Config(command) => commands::config::run(&runner, command),
    }
}
