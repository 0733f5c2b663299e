//! SQL Server Restore Tool
//!
//! Restores a database from a full backup while keeping its permissions and
//! its availability group membership.

// restoretool/src/main.rs
mod cluster;
mod config;
mod environment;
mod errors;
mod principals;
mod restore;
mod session;
mod sql;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use cluster::RunOutcome;
use config::{AppConfig, load_restore_config_from_json};
use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };
    // Optional second argument overrides the location of config.json.
    let config_path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;
    let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
        .context("Failed to load restore configuration from JSON")?;

    match choice.as_str() {
        "1" | "restore" => {
            println!("🔄 Starting Restore Process...");
            println!("Restore target: {}, Backup: {}", restore_config.database_name, restore_config.backup_file);
            let outcome = restore::run_restore_flow(&restore_config, true).await?;
            if outcome == RunOutcome::NotPrimary {
                println!("Nothing was restored on this replica.");
            }
        }
        "2" | "capture" => {
            println!("📸 Starting Capture Process...");
            restore::run_capture_flow(&restore_config).await?;
        }
        "3" | "plan" => {
            println!("📝 Planning Restore (nothing will be executed)...");
            restore::run_restore_flow(&restore_config, false).await?;
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (restore), '2' (capture), or '3' (plan).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("1. Restore Database (or type 'restore')");
    println!("2. Capture Permissions Only (or type 'capture')");
    println!("3. Plan Restore Without Executing (or type 'plan')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
