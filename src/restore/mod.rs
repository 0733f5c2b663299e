mod logic;
pub(crate) mod db_restore;
pub(crate) mod verification;

use anyhow::{Context, Result};
use crate::cluster::RunOutcome;
use crate::config::RestoreConfig;

/// Public entry point for the restore process.
///
/// With `execute` off the run goes through every stage but the audited
/// command collaborator only prints what it would do.
pub async fn run_restore_flow(restore_config: &RestoreConfig, execute: bool) -> Result<RunOutcome> {
    logic::perform_restore_orchestration(restore_config, execute)
        .await
        .with_context(|| format!("Restore of database {} failed", restore_config.database_name))
}

/// Public entry point for a read-only capture of the principal graph.
pub async fn run_capture_flow(restore_config: &RestoreConfig) -> Result<()> {
    logic::perform_capture(restore_config)
        .await
        .with_context(|| format!("Capture of database {} failed", restore_config.database_name))?;
    Ok(())
}
