// restoretool/src/restore/db_restore.rs
use serde::Deserialize;

use crate::environment::ServerEnvironment;
use crate::errors::{AppError, Result};
use crate::session::{AuditSettings, AuditedCommand, CommandType, SqlSession, database_exists, query_rows};
use crate::sql::{
    CatalogQuery, FileGrowth, FileRelocation, Guard, GuardedStatement, Statement, join_server_path,
};

/// One entry of `RESTORE FILELISTONLY`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupFile {
    pub logical_name: String,
    /// `D` data, `L` log, `S` filestream container, `F` full-text catalog.
    pub file_type: String,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseFileRow {
    logical_name: String,
    file_type: String,
    growth: i64,
    is_percent_growth: bool,
}

/// Physical destination of every file in the backup.
///
/// The first data file becomes `<db>.mdf`, further data files
/// `<db>_<logical>.ndf`, log files `<db>_<logical>.ldf` under the log path,
/// and filestream or full-text containers the directory `<db>_<logical>`.
pub fn plan_relocations(
    database: &str,
    files: &[BackupFile],
    data_path: &str,
    log_path: &str,
) -> Vec<FileRelocation> {
    let mut primary_placed = false;
    files
        .iter()
        .map(|file| {
            let (directory, file_name) = match file.file_type.trim() {
                "L" => (log_path, format!("{}_{}.ldf", database, file.logical_name)),
                "S" | "F" => (data_path, format!("{}_{}", database, file.logical_name)),
                _ if !primary_placed => {
                    primary_placed = true;
                    (data_path, format!("{}.mdf", database))
                }
                _ => (data_path, format!("{}_{}.ndf", database, file.logical_name)),
            };
            FileRelocation {
                logical_name: file.logical_name.clone(),
                physical_path: join_server_path(directory, &file_name),
            }
        })
        .collect()
}

fn autogrowth_statements(
    database: &str,
    model: &[DatabaseFileRow],
    files: &[DatabaseFileRow],
) -> Vec<GuardedStatement> {
    files
        .iter()
        .filter_map(|file| {
            let template = model.iter().find(|m| m.file_type == file.file_type)?;
            let wanted = FileGrowth::from_catalog(template.growth, template.is_percent_growth);
            let current = FileGrowth::from_catalog(file.growth, file.is_percent_growth);
            (wanted != current).then(|| {
                GuardedStatement::new(Statement::ModifyFileGrowth {
                    database: database.to_string(),
                    logical_name: file.logical_name.clone(),
                    growth: wanted,
                })
            })
        })
        .collect()
}

/// Replaces a database from a full backup file.
pub struct RestoreExecutor<'a> {
    session: &'a dyn SqlSession,
    environment: &'a ServerEnvironment,
    audit: AuditSettings,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(session: &'a dyn SqlSession, environment: &'a ServerEnvironment, audit: AuditSettings) -> Self {
        Self {
            session,
            environment,
            audit,
        }
    }

    pub async fn file_inventory(&self, backup_file: &str) -> Result<Vec<BackupFile>> {
        let files: Vec<BackupFile> = query_rows(
            self.session,
            &CatalogQuery::BackupFileList {
                backup_file: backup_file.to_string(),
            },
        )
        .await
        .map_err(AppError::into_restore)?;
        if files.is_empty() {
            return Err(AppError::Restore(format!(
                "Backup file '{}' lists no database files",
                backup_file
            )));
        }
        Ok(files)
    }

    /// Fences the existing database, then restores over it with `REPLACE`.
    pub async fn restore(&self, backup_file: &str, database: &str) -> Result<Vec<FileRelocation>> {
        println!("Reading file list of {}...", backup_file);
        let files = self.file_inventory(backup_file).await?;
        let relocations = plan_relocations(
            database,
            &files,
            &self.environment.data_path,
            &self.environment.log_path,
        );
        for relocation in &relocations {
            tracing::debug!(logical = %relocation.logical_name, path = %relocation.physical_path, "relocating file");
        }

        let fence = AuditedCommand::single(
            CommandType::AlterDatabase,
            GuardedStatement::new(Statement::SetSingleUser {
                database: database.to_string(),
            })
            .guarded_by(Guard::DatabaseExists(database.to_string())),
        )
        .informational()
        .with_audit(&self.audit);
        self.session
            .execute(&fence)
            .await
            .map_err(AppError::into_restore)?;

        println!("🔄 Restoring database {} from {}...", database, backup_file);
        let restore = AuditedCommand::single(
            CommandType::RestoreDatabase,
            GuardedStatement::new(Statement::RestoreDatabase {
                database: database.to_string(),
                backup_file: backup_file.to_string(),
                relocations: relocations.clone(),
            }),
        )
        .with_audit(&self.audit);
        self.session
            .execute(&restore)
            .await
            .map_err(AppError::into_restore)?;

        println!(
            "✓ Database {} restored ({} files relocated)",
            database,
            relocations.len()
        );
        Ok(relocations)
    }

    /// Copies the growth settings of `model` onto files of the same type.
    /// Returns the number of files changed.
    pub async fn align_autogrowth_with_model(&self, database: &str) -> Result<usize> {
        if !self.audit.execute && !database_exists(self.session, database).await? {
            println!("Skipping autogrowth check: {} is only restored when executing.", database);
            return Ok(0);
        }
        let model: Vec<DatabaseFileRow> = query_rows(
            self.session,
            &CatalogQuery::DatabaseFiles {
                database: "model".to_string(),
            },
        )
        .await
        .map_err(AppError::into_restore)?;
        let files: Vec<DatabaseFileRow> = query_rows(
            self.session,
            &CatalogQuery::DatabaseFiles {
                database: database.to_string(),
            },
        )
        .await
        .map_err(AppError::into_restore)?;

        let statements = autogrowth_statements(database, &model, &files);
        if statements.is_empty() {
            println!("✓ Autogrowth of {} already matches model", database);
            return Ok(0);
        }
        let changed = statements.len();
        let command = AuditedCommand::new(CommandType::AlterDatabase, statements).with_audit(&self.audit);
        self.session
            .execute(&command)
            .await
            .map_err(AppError::into_restore)?;
        println!("✓ Aligned autogrowth of {} files with model", changed);
        Ok(changed)
    }
}
