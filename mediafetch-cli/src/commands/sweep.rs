//! Sweep command - remove stale temp artifacts from the staging directory.

use mediafetch::FileLifecycleManager;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Run one sweep of the configured staging directory.
pub async fn run(runner: &CliRunner) -> Result<(), CliError> {
    runner.log_startup("sweep");
    let files = FileLifecycleManager::new(runner.config().files.clone());

    println!("Sweeping staging directory: {}", files.staging_dir().display());
    let report = files.sweep_expired().await;

    if report.total() == 0 {
        println!("Nothing older than {}s to remove", files.config().ttl.as_secs());
    } else {
        println!("Removed {} stale temp files", report.orphans);
    }
    Ok(())
}
