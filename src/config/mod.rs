// restoretool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REMOTE_JOIN_PROCEDURE: &str = "AddDatabaseOnSecondary";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    #[serde(default)]
    pub check_model_autogrowth: bool,
    pub availability_group: Option<String>,
    pub shared_folder: Option<String>,
    #[serde(default)]
    pub preserve_permissions: bool,
    #[serde(default)]
    pub log_to_table: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub server_url: Option<String>,
    pub backup_file: Option<String>,
    pub database_name: Option<String>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub data_directory: Option<String>,
    pub log_directory: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub replica_call_timeout_secs: Option<u64>,
    pub remote_join_procedure: Option<String>,
    pub snapshot_output: Option<PathBuf>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub check_model_autogrowth: bool,
    pub availability_group: Option<String>,
    /// Always present when `availability_group` is.
    pub shared_folder: Option<String>,
    pub preserve_permissions: bool,
    pub log_to_table: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    pub server_url: String,
    pub backup_file: String,
    pub database_name: String,
    pub options: RestoreOptions,
    pub data_directory: Option<String>,
    pub log_directory: Option<String>,
    pub command_timeout: Option<Duration>,
    pub replica_call_timeout: Option<Duration>,
    pub remote_join_procedure: String,
    pub snapshot_output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Ok(AppConfig { raw_json_config })
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String> {
    let value = value
        .as_ref()
        .with_context(|| format!("{} must be set in config.json", key))?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(anyhow::anyhow!("{} cannot be empty in config.json.", key));
    }
    Ok(value)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let server_url = required(&raw_config.server_url, "server_url")?;
    let backup_file = required(&raw_config.backup_file, "backup_file")?;
    let database_name = required(&raw_config.database_name, "database_name")?;

    let raw_options = raw_config.restore_options.clone().unwrap_or_default();
    let options = RestoreOptions {
        check_model_autogrowth: raw_options.check_model_autogrowth,
        availability_group: non_empty(&raw_options.availability_group),
        shared_folder: non_empty(&raw_options.shared_folder),
        preserve_permissions: raw_options.preserve_permissions,
        log_to_table: raw_options.log_to_table,
    };
    if options.availability_group.is_some() && options.shared_folder.is_none() {
        return Err(anyhow::anyhow!(
            "restore_options.shared_folder must be set in config.json when restore_options.availability_group is set."
        ));
    }
    if options.availability_group.is_none() && options.shared_folder.is_some() {
        println!("Warning: restore_options.shared_folder is set but no availability_group is configured; it will be ignored.");
    }

    let timeout = |secs: Option<u64>, key: &str| -> Result<Option<Duration>> {
        match secs {
            Some(0) => Err(anyhow::anyhow!("{} must be greater than zero in config.json.", key)),
            other => Ok(other.map(Duration::from_secs)),
        }
    };

    let snapshot_output = raw_config
        .snapshot_output
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(format!("{}_principals.json", database_name)));

    Ok(RestoreConfig {
        server_url,
        backup_file,
        options,
        data_directory: non_empty(&raw_config.data_directory),
        log_directory: non_empty(&raw_config.log_directory),
        command_timeout: timeout(raw_config.command_timeout_secs, "command_timeout_secs")?,
        replica_call_timeout: timeout(
            raw_config.replica_call_timeout_secs,
            "replica_call_timeout_secs",
        )?,
        remote_join_procedure: non_empty(&raw_config.remote_join_procedure)
            .unwrap_or_else(|| DEFAULT_REMOTE_JOIN_PROCEDURE.to_string()),
        snapshot_output,
        database_name,
    })
}
