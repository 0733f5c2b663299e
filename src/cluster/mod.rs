//! Availability group handling around a restore.
//!
//! A database joined to an availability group cannot be restored in place.
//! [`AvailabilityGroupCoordinator`] takes it out of the group, lets the
//! restore and permission replay run, then seeds every secondary from fresh
//! backups and adds the database back.

pub(crate) mod replica_link;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::RestoreConfig;
use crate::environment::ServerEnvironment;
use crate::errors::{AppError, Result};
use crate::principals::capture::capture_snapshot;
use crate::principals::rank::ReplayOrder;
use crate::principals::replay::{PermissionReplayEngine, ReplayReport};
use crate::restore::db_restore::RestoreExecutor;
use crate::restore::verification::{ReplayAnomaly, verify_replay};
use crate::session::{
    AuditSettings, AuditedCommand, CommandType, SqlSession, database_exists, query_rows,
};
use crate::sql::{CatalogQuery, GuardedStatement, Statement, join_server_path};

pub use replica_link::{JoinRequest, ReplicaLinkManager, ReplicaTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Checking,
    Removed,
    Restoring,
    Rejoining,
    Done,
    Failed(String),
}

impl CoordinatorState {
    fn allows(&self, next: &CoordinatorState) -> bool {
        use CoordinatorState::*;
        match (self, next) {
            (Done | Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, Checking)
            | (Checking, Removed | Restoring | Done)
            | (Removed, Restoring)
            | (Restoring, Rejoining | Done)
            | (Rejoining, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub replay: Option<ReplayReport>,
    pub anomalies: Vec<ReplayAnomaly>,
    pub relocated_files: usize,
    pub autogrowth_changes: usize,
    pub joined_replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// The local replica is not the primary of the configured group; nothing was changed.
    NotPrimary,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    #[allow(dead_code)]
    group_name: String,
    is_primary: Option<bool>,
    database_is_member: bool,
}

#[derive(Debug, Deserialize)]
struct ReplicaRow {
    server_name: String,
}

/// `<server>_<database>_<kind>_<yyyymmdd_HHMMSS>.<extension>`; a named
/// instance's `\` becomes `$` so the name is a valid file name.
pub fn seed_backup_name(server: &str, database: &str, kind: &str, stamp: &str, extension: &str) -> String {
    format!(
        "{}_{}_{}_{}.{}",
        server.replace('\\', "$"),
        database,
        kind,
        stamp,
        extension
    )
}

/// Drives one restore run through
/// `Idle -> Checking -> [Removed] -> Restoring -> [Rejoining] -> Done`,
/// ending in `Failed` on the first error.
pub struct AvailabilityGroupCoordinator<'a> {
    session: &'a dyn SqlSession,
    environment: &'a ServerEnvironment,
    config: &'a RestoreConfig,
    audit: AuditSettings,
    state: CoordinatorState,
    history: Vec<CoordinatorState>,
}

impl<'a> AvailabilityGroupCoordinator<'a> {
    pub fn new(
        session: &'a dyn SqlSession,
        environment: &'a ServerEnvironment,
        config: &'a RestoreConfig,
        audit: AuditSettings,
    ) -> Self {
        Self {
            session,
            environment,
            config,
            audit,
            state: CoordinatorState::Idle,
            history: vec![CoordinatorState::Idle],
        }
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn history(&self) -> &[CoordinatorState] {
        &self.history
    }

    fn transition(&mut self, next: CoordinatorState) -> Result<()> {
        if !self.state.allows(&next) {
            return Err(AppError::InvalidInput(format!(
                "illegal coordinator transition {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::debug!(from = ?self.state, to = ?next, "coordinator transition");
        self.state = next.clone();
        self.history.push(next);
        Ok(())
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(illegal) = self.transition(CoordinatorState::Failed(e.to_string())) {
                    tracing::warn!(error = %illegal, "could not record failure");
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        let config = self.config;
        let database = config.database_name.as_str();

        self.transition(CoordinatorState::Checking)?;
        self.environment.check_preconditions(self.audit.log_to_table)?;
        if config.options.preserve_permissions && !database_exists(self.session, database).await? {
            return Err(AppError::Precondition(format!(
                "Database {} does not exist; preserve_permissions needs an existing database to read permissions from",
                database
            )));
        }

        let membership = match config.options.availability_group.as_deref() {
            Some(group) => match self.check_group(group).await? {
                Some(is_member) => Some((group, is_member)),
                None => {
                    println!(
                        "ℹ️ {} is not the primary replica of availability group {}; nothing to do.",
                        self.environment.server_name, group
                    );
                    self.transition(CoordinatorState::Done)?;
                    return Ok(RunOutcome::NotPrimary);
                }
            },
            None => None,
        };

        let mut links = ReplicaLinkManager::new(
            self.session,
            self.audit,
            &config.remote_join_procedure,
            config.replica_call_timeout,
        );
        let targets = match membership {
            Some((group, _)) => self.prepare_replicas(group, &mut links).await?,
            None => Vec::new(),
        };

        let snapshot = if config.options.preserve_permissions {
            println!("📸 Capturing principals of {}...", database);
            let snapshot = capture_snapshot(self.session, database).await?;
            println!("✓ Captured {} principals", snapshot.principals.len());
            Some(snapshot)
        } else {
            None
        };

        if let Some((group, true)) = membership {
            self.transition(CoordinatorState::Removed)?;
            self.remove_from_group(group).await?;
        }

        self.transition(CoordinatorState::Restoring)?;
        let mut summary = RunSummary::default();
        let executor = RestoreExecutor::new(self.session, self.environment, self.audit);
        summary.relocated_files = executor.restore(&config.backup_file, database).await?.len();
        if config.options.check_model_autogrowth {
            summary.autogrowth_changes = executor.align_autogrowth_with_model(database).await?;
        }

        if let Some(snapshot) = &snapshot {
            let order = ReplayOrder::resolve(snapshot);
            let engine = PermissionReplayEngine::new(snapshot, &order);
            summary.replay = Some(engine.replay(self.session, &self.audit).await?);
            if self.audit.execute {
                summary.anomalies = verify_replay(self.session, snapshot).await?;
            }
        }

        if let Some((group, _)) = membership {
            self.transition(CoordinatorState::Rejoining)?;
            summary.joined_replicas = self.rejoin(group, &mut links, targets).await?;
        }

        self.transition(CoordinatorState::Done)?;
        Ok(RunOutcome::Completed(summary))
    }

    /// `Some(database_is_member)` on the primary, `None` on a secondary.
    async fn check_group(&self, group: &str) -> Result<Option<bool>> {
        if !self.environment.is_hadr_enabled {
            return Err(AppError::ClusterTopology(format!(
                "Always On availability groups are not enabled on {}",
                self.environment.server_name
            )));
        }
        if self.config.options.shared_folder.is_none() {
            return Err(AppError::ClusterTopology(
                "A shared folder is required to seed the secondary replicas".to_string(),
            ));
        }
        let rows: Vec<GroupRow> = query_rows(
            self.session,
            &CatalogQuery::AvailabilityGroup {
                group: group.to_string(),
                database: self.config.database_name.clone(),
            },
        )
        .await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            AppError::ClusterTopology(format!(
                "Availability group {} does not exist on {}",
                group, self.environment.server_name
            ))
        })?;
        if !row.is_primary.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(row.database_is_member))
    }

    fn group_command(&self, statement: Statement) -> AuditedCommand {
        AuditedCommand::single(CommandType::AlterAvailabilityGroup, GuardedStatement::new(statement))
            .with_audit(&self.audit)
    }

    async fn remove_from_group(&self, group: &str) -> Result<()> {
        println!("Removing {} from availability group {}...", self.config.database_name, group);
        let command = self.group_command(Statement::RemoveDatabaseFromGroup {
            group: group.to_string(),
            database: self.config.database_name.clone(),
        });
        self.session
            .execute(&command)
            .await
            .map_err(|e| AppError::ClusterTopology(e.to_string()))?;
        println!("✓ Removed {} from {}", self.config.database_name, group);
        Ok(())
    }

    /// Readies every secondary for the join before anything on the primary changes.
    async fn prepare_replicas(
        &self,
        group: &str,
        links: &mut ReplicaLinkManager<'a>,
    ) -> Result<Vec<ReplicaTarget>> {
        let replicas: Vec<ReplicaRow> = query_rows(
            self.session,
            &CatalogQuery::SecondaryReplicas {
                group: group.to_string(),
            },
        )
        .await?;
        for replica in &replicas {
            println!("Checking secondary replica {}...", replica.server_name);
            links.prepare(&replica.server_name).await?;
        }
        println!("✓ {} secondary replicas can join {}", replicas.len(), group);
        Ok(replicas
            .iter()
            .map(|r| ReplicaTarget::new(&r.server_name))
            .collect())
    }

    /// Backs up, adds the database back on the primary and joins it on every secondary.
    async fn rejoin(
        &self,
        group: &str,
        links: &mut ReplicaLinkManager<'a>,
        mut targets: Vec<ReplicaTarget>,
    ) -> Result<Vec<String>> {
        let database = self.config.database_name.as_str();
        let shared_folder = self.config.options.shared_folder.as_deref().ok_or_else(|| {
            AppError::ClusterTopology("A shared folder is required to seed the secondary replicas".to_string())
        })?;
        let server = self.environment.server_name.as_str();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let request = JoinRequest {
            database: database.to_string(),
            group: group.to_string(),
            full_backup: join_server_path(
                shared_folder,
                &seed_backup_name(server, database, "FULL", &stamp, "bak"),
            ),
            log_backup: join_server_path(
                shared_folder,
                &seed_backup_name(server, database, "LOG", &stamp, "trn"),
            ),
        };

        println!("💾 Backing up {} to {}...", database, request.full_backup);
        let full = AuditedCommand::single(
            CommandType::BackupDatabase,
            GuardedStatement::new(Statement::BackupDatabase {
                database: database.to_string(),
                path: request.full_backup.clone(),
            }),
        )
        .with_audit(&self.audit);
        self.session.execute(&full).await?;

        println!("💾 Backing up log of {} to {}...", database, request.log_backup);
        let log = AuditedCommand::single(
            CommandType::BackupLog,
            GuardedStatement::new(Statement::BackupLog {
                database: database.to_string(),
                path: request.log_backup.clone(),
            }),
        )
        .with_audit(&self.audit);
        self.session.execute(&log).await?;

        let add = self.group_command(Statement::AddDatabaseToGroup {
            group: group.to_string(),
            database: database.to_string(),
        });
        self.session
            .execute(&add)
            .await
            .map_err(|e| AppError::ClusterTopology(e.to_string()))?;
        println!("✓ Added {} to {} on the primary", database, group);

        for target in targets.iter_mut() {
            println!("Joining {} on secondary {}...", database, target.server_name);
            links.join(target, &request).await?;
        }

        Ok(targets
            .into_iter()
            .filter(|t| t.processed)
            .map(|t| t.server_name)
            .collect())
    }
}
