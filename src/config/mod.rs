mod types;

pub use types::*;

use crate::error::{BackupError, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tlm_remote_backup"))
        .unwrap_or_else(|| PathBuf::from(".tlm_remote_backup"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load() -> Result<AppConfig> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

pub fn save(config: &AppConfig) -> Result<()> {
    save_to(config, &config_path())
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            info!("Creating config directory: {:?}", parent);
            fs::create_dir_all(parent)?;
        }
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    info!("Configuration saved to {:?}", path);
    Ok(())
}

/// Expands a leading `~/` against the local home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Turns the on-disk configuration into one immutable config per server,
/// with every application-level fallback already applied.
pub fn resolve_jobs(config: &AppConfig) -> Result<Vec<BackupJobConfig>> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(config.servers.len());

    for server in &config.servers {
        if server.name.trim().is_empty() {
            return Err(BackupError::Config("server name must not be empty".to_string()));
        }
        if server.host.trim().is_empty() {
            return Err(BackupError::Config(format!(
                "server '{}' has no host",
                server.name
            )));
        }
        if !is_plain_segment(&server.name) {
            return Err(BackupError::Config(format!(
                "server name '{}' must not contain path separators",
                server.name
            )));
        }
        if !server.target_subfolder.is_empty() && !is_relative_subpath(&server.target_subfolder) {
            return Err(BackupError::Config(format!(
                "target_subfolder '{}' of server '{}' must stay inside the backup directory",
                server.target_subfolder, server.name
            )));
        }
        if !seen.insert(server.name.clone()) {
            return Err(BackupError::Config(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }

        jobs.push(resolve_job(config, server));
    }

    Ok(jobs)
}

/// A single file-name component: no separators, not `.` or `..`.
fn is_plain_segment(name: &str) -> bool {
    !name.contains(['/', '\\']) && name != "." && name != ".."
}

/// Relative, and only made of ordinary components.
fn is_relative_subpath(path: &str) -> bool {
    !path.contains('\\')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn resolve_job(config: &AppConfig, server: &ServerConfig) -> BackupJobConfig {
    let mut cloud = server.cloud.clone();
    if let Some(drive) = &config.drive {
        if cloud.destination_folder_id.is_none() {
            cloud.destination_folder_id = drive.default_folder_id.clone();
        }
        if cloud.credentials_ref.is_none() {
            cloud.credentials_ref = Some(drive.credentials_file.clone());
        }
    }
    cloud.credentials_ref = cloud.credentials_ref.map(|p| expand_home(&p));

    let credential = match &server.credential {
        Credential::PrivateKey { path, passphrase } => Credential::PrivateKey {
            path: expand_home(path),
            passphrase: passphrase.clone(),
        },
        other => other.clone(),
    };

    let settings = &config.transfer;
    BackupJobConfig {
        server_name: server.name.clone(),
        target: ConnectionTarget {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            credential,
        },
        remote_directory: server.remote_directory.clone(),
        target_subfolder: server.target_subfolder.clone(),
        compression: server.compression,
        local_root: config.local_backup_dir.clone(),
        cloud,
        connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
        transfer: TransferOverrides {
            concurrency: settings.concurrency,
            chunk_size: settings.chunk_size_kb.map(|kb| kb * 1024),
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay_secs.map(Duration::from_secs),
        },
    }
}
