// restoretool/src/environment.rs
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::session::{SqlSession, query_rows};
use crate::sql::CatalogQuery;

/// Instance-wide facts discovered once per run and passed by reference to
/// every component that needs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEnvironment {
    pub server_name: String,
    pub data_path: String,
    pub log_path: String,
    pub product_version: String,
    pub is_hadr_enabled: bool,
    pub is_sysadmin: bool,
    pub command_execute_installed: bool,
    pub command_log_installed: bool,
}

#[derive(Debug, Deserialize)]
struct EnvironmentRow {
    server_name: Option<String>,
    data_path: Option<String>,
    log_path: Option<String>,
    product_version: Option<String>,
    is_hadr_enabled: Option<bool>,
    is_sysadmin: Option<bool>,
    command_execute_installed: bool,
    command_log_installed: bool,
}

impl ServerEnvironment {
    /// Reads the environment, applying the configured relocation overrides.
    pub async fn discover(
        session: &dyn SqlSession,
        data_directory: Option<&str>,
        log_directory: Option<&str>,
    ) -> Result<Self> {
        let row = query_rows::<EnvironmentRow>(session, &CatalogQuery::ServerEnvironment)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                AppError::Precondition("Server returned no environment information".to_string())
            })?;

        let data_path = data_directory
            .map(str::to_string)
            .or(row.data_path)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                AppError::Precondition(
                    "Instance default data path is unknown; set data_directory in config.json"
                        .to_string(),
                )
            })?;
        let log_path = log_directory
            .map(str::to_string)
            .or(row.log_path)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| data_path.clone());

        let environment = ServerEnvironment {
            server_name: row.server_name.unwrap_or_default(),
            data_path,
            log_path,
            product_version: row.product_version.unwrap_or_default(),
            is_hadr_enabled: row.is_hadr_enabled.unwrap_or(false),
            is_sysadmin: row.is_sysadmin.unwrap_or(false),
            command_execute_installed: row.command_execute_installed,
            command_log_installed: row.command_log_installed,
        };
        tracing::info!(
            server = %environment.server_name,
            version = %environment.product_version,
            hadr = environment.is_hadr_enabled,
            "discovered server environment"
        );
        Ok(environment)
    }

    /// Rejects the run before any mutation when privileges or collaborator objects are missing.
    pub fn check_preconditions(&self, log_to_table: bool) -> Result<()> {
        if !self.is_sysadmin {
            return Err(AppError::Precondition(
                "The login must be a member of the sysadmin server role".to_string(),
            ));
        }
        if !self.command_execute_installed {
            return Err(AppError::Precondition(
                "The stored procedure CommandExecute is missing in the master database".to_string(),
            ));
        }
        if log_to_table && !self.command_log_installed {
            return Err(AppError::Precondition(
                "The table CommandLog is missing in the master database".to_string(),
            ));
        }
        Ok(())
    }
}
