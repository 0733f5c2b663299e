// restoretool/src/restore/logic.rs
use std::fs;

use chrono::Local;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::cluster::{AvailabilityGroupCoordinator, RunOutcome};
use crate::config::RestoreConfig;
use crate::environment::ServerEnvironment;
use crate::errors::{AppError, Result};
use crate::principals::PrincipalSnapshot;
use crate::principals::capture::capture_snapshot;
use crate::principals::rank::ReplayOrder;
use crate::principals::replay::{PermissionReplayEngine, PrincipalBatch};
use crate::session::{AuditSettings, ConnectionSettings, SqlSession, SqlcmdSession};

/// File written by the capture operation.
#[derive(Debug, Serialize)]
pub struct SnapshotDocument {
    pub captured_at: String,
    pub server_name: String,
    pub snapshot: PrincipalSnapshot,
    pub order: ReplayOrder,
    /// Batches a replay of this snapshot would run, in order.
    pub plan: Vec<PrincipalBatch>,
}

fn open_session(config: &RestoreConfig) -> Result<SqlcmdSession> {
    let connection = ConnectionSettings::from_url(&config.server_url)?;
    SqlcmdSession::new(connection, config.command_timeout)
}

fn close_session(session: SqlcmdSession) {
    if let Err(e) = session.cleanup() {
        tracing::warn!(error = %e, "failed to remove temporary script directory");
    }
}

/// Runs one restore against the configured instance. With `execute` off every
/// mutating command is only printed.
pub async fn perform_restore_orchestration(config: &RestoreConfig, execute: bool) -> Result<RunOutcome> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("restore", %run_id, database = %config.database_name, execute);
    let audit = AuditSettings {
        log_to_table: config.options.log_to_table,
        execute,
    };

    let session = open_session(config)?;
    let result = orchestrate(&session, config, audit).instrument(span).await;
    // always runs, whatever the outcome
    close_session(session);
    result
}

pub(crate) async fn orchestrate(
    session: &dyn SqlSession,
    config: &RestoreConfig,
    audit: AuditSettings,
) -> Result<RunOutcome> {
    println!("🔍 Discovering server environment...");
    let environment = match ServerEnvironment::discover(
        session,
        config.data_directory.as_deref(),
        config.log_directory.as_deref(),
    )
    .await
    {
        Ok(environment) => environment,
        Err(e) => return Err(announce_failure(config, "Discovery", e)),
    };
    println!(
        "✓ Connected to {} (version {})",
        environment.server_name, environment.product_version
    );
    if !audit.execute {
        println!("Plan mode: commands are printed, not executed.");
    }

    let mut coordinator = AvailabilityGroupCoordinator::new(session, &environment, config, audit);
    match coordinator.run().await {
        Ok(outcome) => {
            if let RunOutcome::Completed(summary) = &outcome {
                println!("✅ Restore of {} finished.", config.database_name);
                if !summary.anomalies.is_empty() {
                    println!(
                        "⚠️ {} permission anomalies were reported; review them above.",
                        summary.anomalies.len()
                    );
                }
                if !summary.joined_replicas.is_empty() {
                    println!("Joined on: {}", summary.joined_replicas.join(", "));
                }
            }
            Ok(outcome)
        }
        Err(e) => {
            let reached = coordinator
                .history()
                .iter()
                .rev()
                .nth(1)
                .map(|s| format!("{:?}", s))
                .unwrap_or_default();
            Err(announce_failure(config, &reached, e))
        }
    }
}

fn announce_failure(config: &RestoreConfig, stage: &str, e: AppError) -> AppError {
    println!("❌ Restore of {} failed during {}: {}", config.database_name, stage, e);
    tracing::error!(error = %e, stage, "restore failed");
    e
}

/// Captures the principal graph and its replay order without changing anything.
pub async fn perform_capture(config: &RestoreConfig) -> Result<SnapshotDocument> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("capture", %run_id, database = %config.database_name);
    let session = open_session(config)?;
    let result = capture_document(&session, config).instrument(span).await;
    close_session(session);
    result
}

pub(crate) async fn capture_document(
    session: &dyn SqlSession,
    config: &RestoreConfig,
) -> Result<SnapshotDocument> {
    let environment = ServerEnvironment::discover(
        session,
        config.data_directory.as_deref(),
        config.log_directory.as_deref(),
    )
    .await?;
    println!("📸 Capturing principals of {}...", config.database_name);
    let snapshot = capture_snapshot(session, &config.database_name).await?;
    let order = ReplayOrder::resolve(&snapshot);
    let plan = PermissionReplayEngine::new(&snapshot, &order).plan();
    let document = SnapshotDocument {
        captured_at: Local::now().to_rfc3339(),
        server_name: environment.server_name,
        snapshot,
        order,
        plan,
    };

    let json = serde_json::to_string_pretty(&document)?;
    fs::write(&config.snapshot_output, json)?;
    println!(
        "✓ Wrote {} principals to {}",
        document.snapshot.principals.len(),
        config.snapshot_output.display()
    );
    Ok(document)
}
