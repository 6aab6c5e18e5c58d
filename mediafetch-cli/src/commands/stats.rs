//! Telemetry report printed after a fetch with `--stats`.

use std::time::Duration;

use console::{style, StyledObject};
use mediafetch::{Health, TelemetrySnapshot};

use super::common::format_size;

/// Print the per-strategy and per-platform tables of `snapshot`.
pub fn print_report(snapshot: &TelemetrySnapshot) {
    println!();
    println!("Engine statistics");
    println!("=================");
    println!(
        "Requests: {} started, {} succeeded, {} failed, {} rejected ({} delivered)",
        snapshot.requests_started,
        snapshot.requests_succeeded,
        snapshot.requests_failed,
        snapshot.requests_rejected,
        format_size(snapshot.bytes_delivered)
    );

    if !snapshot.strategies.is_empty() {
        println!();
        println!(
            "  {:<10} {:<10} {:>8} {:>8} {:>8} {:>9} {:>9}",
            "strategy", "health", "attempts", "ok", "failed", "avg", "max"
        );
        for s in &snapshot.strategies {
            println!(
                "  {:<10} {:<10} {:>8} {:>8} {:>8} {:>9} {:>9}",
                s.name,
                health_label(s.health()),
                s.attempts,
                s.successes,
                s.failures(),
                format_duration(s.average_attempt_time()),
                format_duration(Some(s.max_attempt_time))
            );
            if let Some(last) = s.recent_errors.last() {
                println!("  {:<10} last error: {}", "", last.message);
            }
        }
    }

    if !snapshot.platforms.is_empty() {
        println!();
        println!(
            "  {:<10} {:<10} {:>8} {:>8} {:>9} {:>9}",
            "platform", "health", "ok", "failed", "avg", "max"
        );
        for p in &snapshot.platforms {
            println!(
                "  {:<10} {:<10} {:>8} {:>8} {:>9} {:>9}",
                p.platform.as_str(),
                health_label(p.health()),
                p.succeeded,
                p.failed,
                format_duration(p.average_download_time()),
                format_duration(Some(p.max_download_time))
            );
        }
    }
}

fn health_label(health: Health) -> StyledObject<&'static str> {
    let label = style(health.as_str());
    match health {
        Health::Healthy => label.green(),
        Health::Degraded => label.yellow(),
        Health::Critical => label.red(),
        Health::Unknown => label.dim(),
    }
}

fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:.1}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}
