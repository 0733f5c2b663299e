//! Connection to one SQL Server instance.
//!
//! Every catalog read goes through [`SqlSession::query`] and every mutating
//! step goes through [`SqlSession::execute`] as an [`AuditedCommand`], so the
//! whole run is uniformly audited by the server-side `CommandExecute`
//! collaborator.

pub(crate) mod sqlcmd;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::sql::{CatalogQuery, GuardedStatement};

pub use sqlcmd::{ConnectionSettings, SqlcmdSession};

/// Tag written to the command log for each audited command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    RestoreDatabase,
    RestorePermissions,
    AlterDatabase,
    BackupDatabase,
    BackupLog,
    AlterAvailabilityGroup,
    AddLinkedServer,
    ServerOption,
    AddDatabaseOnSecondary,
}

impl CommandType {
    pub fn tag(self) -> &'static str {
        match self {
            CommandType::RestoreDatabase => "RESTORE_DATABASE",
            CommandType::RestorePermissions => "RESTORE_PERMISSIONS",
            CommandType::AlterDatabase => "ALTER_DATABASE",
            CommandType::BackupDatabase => "BACKUP_DATABASE",
            CommandType::BackupLog => "BACKUP_LOG",
            CommandType::AlterAvailabilityGroup => "ALTER_AVAILABILITY_GROUP",
            CommandType::AddLinkedServer => "ADD_LINKED_SERVER",
            CommandType::ServerOption => "SERVER_OPTION",
            CommandType::AddDatabaseOnSecondary => "ADD_DATABASE_ON_SECONDARY",
        }
    }
}

/// Informational commands prepare the target without changing its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandMode {
    Informational,
    Mutating,
}

impl CommandMode {
    /// `@Mode` value understood by `CommandExecute`.
    pub fn code(self) -> u8 {
        match self {
            CommandMode::Informational => 1,
            CommandMode::Mutating => 2,
        }
    }
}

/// One unit of work handed to the audited command collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditedCommand {
    pub command_type: CommandType,
    /// Database context; `None` runs in `master`.
    pub database: Option<String>,
    pub mode: CommandMode,
    pub log_to_table: bool,
    /// When false the collaborator only prints the command.
    pub execute: bool,
    /// Run all statements in one transaction that is rolled back on the first error.
    pub transactional: bool,
    pub statements: Vec<GuardedStatement>,
}

impl AuditedCommand {
    pub fn new(command_type: CommandType, statements: Vec<GuardedStatement>) -> Self {
        Self {
            command_type,
            database: None,
            mode: CommandMode::Mutating,
            log_to_table: false,
            execute: true,
            transactional: false,
            statements,
        }
    }

    pub fn single(command_type: CommandType, statement: GuardedStatement) -> Self {
        Self::new(command_type, vec![statement])
    }

    pub fn in_database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn informational(mut self) -> Self {
        self.mode = CommandMode::Informational;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Applies the run-wide audit and dry-run switches.
    pub fn with_audit(mut self, audit: &AuditSettings) -> Self {
        self.log_to_table = audit.log_to_table;
        self.execute = audit.execute;
        self
    }

    /// T-SQL body passed to the collaborator as `@Command`.
    pub fn render_body(&self) -> String {
        let body = self
            .statements
            .iter()
            .map(GuardedStatement::render)
            .collect::<Vec<_>>()
            .join("\n");
        if !self.transactional {
            return body;
        }
        let indented = body
            .lines()
            .map(|line| format!("    {}", line))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "SET XACT_ABORT ON;\n\
             BEGIN TRY\n\
             BEGIN TRANSACTION;\n\
             {}\n\
             COMMIT TRANSACTION;\n\
             END TRY\n\
             BEGIN CATCH\n\
             IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;\n\
             THROW;\n\
             END CATCH",
            indented
        )
    }
}

/// Run-wide switches applied to every audited command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditSettings {
    pub log_to_table: bool,
    pub execute: bool,
}

#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Runs a read-only catalog query and returns its rows as a JSON array.
    async fn query(&self, query: &CatalogQuery) -> Result<serde_json::Value>;

    /// Executes an audited command, waiting for completion.
    async fn execute(&self, command: &AuditedCommand) -> Result<()>;
}

/// Runs a catalog query and decodes each row.
pub async fn query_rows<T: DeserializeOwned>(
    session: &dyn SqlSession,
    query: &CatalogQuery,
) -> Result<Vec<T>> {
    let value = session.query(query).await?;
    let rows = serde_json::from_value(value)?;
    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct DatabaseRow {
    #[allow(dead_code)]
    name: String,
}

pub async fn database_exists(session: &dyn SqlSession, database: &str) -> Result<bool> {
    let rows = query_rows::<DatabaseRow>(
        session,
        &CatalogQuery::DatabaseExists {
            database: database.to_string(),
        },
    )
    .await?;
    Ok(!rows.is_empty())
}
