use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use dialoguer::Password;

use super::{ConfigCommand, prompt};
use crate::config::{
    self, Cli, Config, TOKEN_ENV_VAR, default_clippings_path, default_config_path, mask_token,
};
use crate::db::Database;

pub async fn handle_reset(force: bool, cfg: &Config) -> Result<i32> {
    let path = cfg.database_path(None);

    if !force {
        println!("This deletes the export ledger at {}.", path.display());
        println!("Every highlight will be treated as new on the next export.");
        if prompt("Type RESET to confirm")? != "RESET" {
            println!("Reset cancelled.");
            return Ok(0);
        }
    }

    for file in ledger_files(&path) {
        if file.exists() {
            fs::remove_file(&file)
                .map_err(|e| anyhow::anyhow!("failed to delete {}: {e}", file.display()))?;
            tracing::info!(path = ?file, "deleted ledger file");
        }
    }

    let db = Database::new(&path).await?;
    db.close().await;

    println!("Database reset. A fresh ledger was created at {}.", path.display());
    Ok(0)
}

/// The database file and the journal files SQLite may keep beside it.
fn ledger_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

pub fn handle_config(command: &ConfigCommand, cli: &Cli, cfg: &Config) -> Result<i32> {
    let config_path = cli
        .config_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match command {
        ConfigCommand::Show => {
            let token = match cfg.resolve_token(None) {
                Some(t) => mask_token(&t),
                None => format!(
                    "not set (run `kindlewise config token` or set {})",
                    TOKEN_ENV_VAR
                ),
            };
            let clippings = cfg
                .resolve_clippings_path(None)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not found".to_string());

            println!("\n--- Configuration ---");
            println!("Config File: {}", config_path.display());
            println!("Database: {}", cfg.database_path(None).display());
            println!("Log Level: {}", cfg.app.log_level);
            println!("Clippings File: {}", clippings);
            println!("Readwise API URL: {}", cfg.readwise.api_url);
            println!("Readwise Token: {}", token);
            println!("Batch Size: {}", cfg.readwise.batch_size);
            println!("Request Delay: {}ms", cfg.readwise.request_delay_ms);
        }
        ConfigCommand::Paths => {
            let detected = default_clippings_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none detected".to_string());

            println!("\n--- Paths ---");
            println!("Config Directory: {}", cfg.base_dir().display());
            println!("Config File: {}", config_path.display());
            println!("Database: {}", cfg.database_path(None).display());
            println!("Kindle Clippings: {}", detected);
            println!("Platform: {}", std::env::consts::OS);
        }
        ConfigCommand::Token { token } => {
            let token = match token {
                Some(t) => t.trim().to_string(),
                None => Password::new()
                    .with_prompt("Readwise API token")
                    .allow_empty_password(true)
                    .interact()?
                    .trim()
                    .to_string(),
            };
            if token.is_empty() {
                println!("No token provided. Nothing changed.");
                return Ok(0);
            }
            config::set_value(&config_path, "readwise.token", &token)?;
            println!(
                "Readwise API token {} saved to {}.",
                mask_token(&token),
                config_path.display()
            );
        }
        ConfigCommand::Set { key, value } => {
            config::set_value(&config_path, key, value)?;
            let shown = if key == "readwise.token" {
                mask_token(value)
            } else {
                value.trim().to_string()
            };
            println!("Configuration updated: {} = {}", key, shown);
        }
    }
    Ok(0)
}
