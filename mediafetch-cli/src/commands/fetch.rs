//! Fetch command - download one URL through the platform's strategy chain.

use std::path::{Path, PathBuf};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use mediafetch::{
    AttemptOutcome, DownloadRequest, DownloadResult, EventSink, FetchEvent, MediaEngine,
    SourceAttempt,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::common::{format_size, PlatformArg};
use super::stats;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the fetch command.
pub struct FetchArgs {
    pub url: String,
    pub requester: String,
    pub platform: Option<PlatformArg>,
    pub output_dir: Option<PathBuf>,
    /// Print engine statistics when done.
    pub stats: bool,
}

/// Run the fetch command.
pub async fn run(runner: &CliRunner, args: FetchArgs) -> Result<(), CliError> {
    runner.log_startup("fetch");

    let mut engine = MediaEngine::from_config(runner.config().clone())?;
    engine.start().await?;

    let mut request = DownloadRequest::new(&args.url, &args.requester);
    if let Some(platform) = args.platform {
        request = request.with_platform_hint(platform.into());
    }
    println!(
        "{} {} ({})",
        style("Fetching").cyan().bold(),
        args.url,
        request.platform()
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_events(rx, progress_bar()));

    let outcome = tokio::select! {
        result = engine.fetch_with_events(request, EventSink::new(tx)) => result.map_err(CliError::from),
        _ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
    };
    // the sender went away with the fetch future
    let _ = renderer.await;

    let delivered = match outcome {
        Ok(result) => {
            let output_dir = args.output_dir.unwrap_or_else(default_output_dir);
            let copied = deliver(&result, &output_dir).await;
            engine.release(result.file_id).await;
            copied.map(|path| (result, path))
        }
        Err(e) => Err(e),
    };

    let telemetry = engine.telemetry();
    engine.shutdown().await;
    if args.stats {
        stats::print_report(&telemetry);
    }

    match delivered {
        Ok((result, path)) => {
            println!(
                "{} {} via {} ({})",
                style("Saved").green().bold(),
                path.display(),
                result.winning_strategy().unwrap_or("?"),
                format_size(result.size_bytes)
            );
            if result.attempts.len() > 1 {
                print_attempts(&result.attempts);
            }
            Ok(())
        }
        Err(CliError::Fetch(e)) => {
            if let Some(attempts) = e.attempts() {
                print_attempts(attempts);
            }
            Err(CliError::Fetch(e))
        }
        Err(e) => Err(e),
    }
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Copies the staged file out of the engine's staging directory.
async fn deliver(result: &DownloadResult, output_dir: &Path) -> Result<PathBuf, CliError> {
    let name = result
        .final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| format!("{}.mp4", result.request_id.short()).into());
    let dest = output_dir.join(name);

    let io_error = |source| CliError::Output {
        path: dest.clone(),
        source,
    };
    tokio::fs::create_dir_all(output_dir).await.map_err(io_error)?;
    tokio::fs::copy(&result.final_path, &dest)
        .await
        .map_err(io_error)?;
    Ok(dest)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan} {msg} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Drives the progress bar from fetch events until the sender is dropped.
async fn render_events(mut rx: UnboundedReceiver<FetchEvent>, bar: ProgressBar) {
    while let Some(event) = rx.recv().await {
        match event {
            FetchEvent::Started { chain, .. } => {
                bar.println(format!("  chain: {}", chain.join(" -> ")));
            }
            FetchEvent::AttemptStarted {
                strategy, attempt, ..
            } => {
                bar.set_position(0);
                bar.set_message(format!("{} #{}", strategy, attempt + 1));
            }
            FetchEvent::Progress {
                downloaded, total, ..
            } => {
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bar.set_position(downloaded);
            }
            FetchEvent::AttemptFailed {
                strategy,
                retryable,
                error,
                ..
            } => {
                let tag = if retryable { "retryable" } else { "terminal" };
                bar.println(format!(
                    "  {} {} [{}]: {}",
                    style("✗").yellow(),
                    strategy,
                    tag,
                    error
                ));
            }
            FetchEvent::Backoff {
                strategy, delay_ms, ..
            } => {
                bar.set_message(format!("{} (retrying in {} ms)", strategy, delay_ms));
            }
            FetchEvent::Succeeded { .. } | FetchEvent::Failed { .. } => {
                bar.finish_and_clear();
            }
        }
    }
    bar.finish_and_clear();
}

fn print_attempts(attempts: &[SourceAttempt]) {
    println!("Attempts:");
    for attempt in attempts {
        let elapsed = attempt
            .finished_at
            .duration_since(attempt.started_at)
            .unwrap_or_default();
        let outcome = match attempt.outcome {
            AttemptOutcome::Success => style("ok").green(),
            AttemptOutcome::RetryableFailure => style("retryable").yellow(),
            AttemptOutcome::TerminalFailure => style("terminal").red(),
        };
        match &attempt.error_detail {
            Some(detail) => println!(
                "  {:<10} {:<10} {:>6.1}s  {}",
                attempt.strategy,
                outcome,
                elapsed.as_secs_f64(),
                detail
            ),
            None => println!(
                "  {:<10} {:<10} {:>6.1}s",
                attempt.strategy,
                outcome,
                elapsed.as_secs_f64()
            ),
        }
    }
}

