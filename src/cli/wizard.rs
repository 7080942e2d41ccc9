use crate::config::{
    expand_home, AppConfig, CloudUploadConfig, CompressionKind, ConnectionTarget, Credential, DiscordConfig,
    DriveConfig, ServerConfig, UploadMethod,
};
use crate::error::{BackupError, Result};
use crate::notify::DiscordNotifier;
use crate::remote::ssh::SshTransport;
use crate::remote::RemoteExecutor;
use console::style;
use dialoguer::{Confirm, Input, Password, Select};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn prompt_err(e: dialoguer::Error) -> BackupError {
    BackupError::Config(e.to_string())
}

fn optional(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub async fn configure_server(config: &mut AppConfig) -> Result<()> {
    println!("\n{}", style("=== Server Configuration ===").cyan().bold());

    let name: String = Input::new()
        .with_prompt("Server name (used in folder and file names, e.g. 'db1')")
        .interact_text()
        .map_err(prompt_err)?;
    if config.servers.iter().any(|s| s.name == name) {
        let overwrite = Confirm::new()
            .with_prompt(format!("Server '{}' already exists. Overwrite?", name))
            .default(false)
            .interact()
            .map_err(prompt_err)?;
        if !overwrite {
            return Ok(());
        }
        config.servers.retain(|s| s.name != name);
    }

    let host: String = Input::new()
        .with_prompt("Host")
        .interact_text()
        .map_err(prompt_err)?;

    let port: u16 = Input::new()
        .with_prompt("SSH port")
        .default(22u16)
        .interact_text()
        .map_err(prompt_err)?;

    let username: String = Input::new()
        .with_prompt("Username")
        .default("root".to_string())
        .interact_text()
        .map_err(prompt_err)?;

    let auth_idx = Select::new()
        .with_prompt("Authentication")
        .items(&["Password", "Private key"])
        .default(0)
        .interact()
        .map_err(prompt_err)?;

    let credential = if auth_idx == 0 {
        Credential::Password {
            password: Password::new()
                .with_prompt("Password")
                .interact()
                .map_err(prompt_err)?,
        }
    } else {
        let path: String = Input::new()
            .with_prompt("Private key path")
            .default("~/.ssh/id_ed25519".to_string())
            .interact_text()
            .map_err(prompt_err)?;
        let passphrase: String = Password::new()
            .with_prompt("Key passphrase (empty for none)")
            .allow_empty_password(true)
            .interact()
            .map_err(prompt_err)?;
        Credential::PrivateKey {
            path: PathBuf::from(path),
            passphrase: optional(passphrase),
        }
    };

    let remote_directory: String = Input::new()
        .with_prompt("Remote directory to back up")
        .interact_text()
        .map_err(prompt_err)?;

    let target_subfolder: String = Input::new()
        .with_prompt("Local subfolder (empty = server name)")
        .allow_empty(true)
        .interact_text()
        .map_err(prompt_err)?;

    let compression_idx = Select::new()
        .with_prompt("Archive format")
        .items(&["zip", "tar.gz"])
        .default(0)
        .interact()
        .map_err(prompt_err)?;
    let compression = if compression_idx == 0 {
        CompressionKind::Zip
    } else {
        CompressionKind::TarGz
    };

    let cloud = configure_server_cloud(config.drive.is_some())?;

    let target = ConnectionTarget {
        host: host.clone(),
        port,
        username: username.clone(),
        credential: match &credential {
            Credential::PrivateKey { path, passphrase } => Credential::PrivateKey {
                path: expand_home(path),
                passphrase: passphrase.clone(),
            },
            other => other.clone(),
        },
    };
    println!("\n{}", style("Testing SSH connection...").yellow());
    let executor = RemoteExecutor::new(
        Arc::new(SshTransport),
        Duration::from_secs(config.transfer.connect_timeout_secs.max(1)),
    );
    match executor.verify_connection(&target).await {
        Ok(()) => println!("{}", style("✓ Connection successful!").green()),
        Err(e) => println!(
            "{} {} (saved anyway)",
            style("✗ Connection failed:").red(),
            e
        ),
    }

    config.servers.push(ServerConfig {
        name: name.clone(),
        host,
        port,
        username,
        credential,
        remote_directory,
        target_subfolder: target_subfolder.trim().to_string(),
        compression,
        cloud,
    });
    println!("{}", style(format!("Server '{}' added.", name)).green());
    Ok(())
}

fn configure_server_cloud(drive_configured: bool) -> Result<CloudUploadConfig> {
    let enabled = Confirm::new()
        .with_prompt("Upload this server's backups to Google Drive?")
        .default(drive_configured)
        .interact()
        .map_err(prompt_err)?;
    if !enabled {
        return Ok(CloudUploadConfig::default());
    }
    if !drive_configured {
        println!(
            "{}",
            style("Google Drive is not configured yet; set it up under cloud settings.").yellow()
        );
    }

    let method_idx = Select::new()
        .with_prompt("Upload method")
        .items(&[
            "Direct (remote CLI or stream, local copy as last resort)",
            "Local (download first, then upload)",
        ])
        .default(0)
        .interact()
        .map_err(prompt_err)?;

    let folder: String = Input::new()
        .with_prompt("Destination folder ID (empty = default)")
        .allow_empty(true)
        .interact_text()
        .map_err(prompt_err)?;

    Ok(CloudUploadConfig {
        enabled: true,
        upload_method: if method_idx == 0 {
            UploadMethod::Direct
        } else {
            UploadMethod::Local
        },
        destination_folder_id: optional(folder),
        credentials_ref: None,
    })
}

pub fn remove_server(config: &mut AppConfig) -> Result<()> {
    if config.servers.is_empty() {
        println!("{}", style("No servers configured.").red());
        return Ok(());
    }
    let names: Vec<&str> = config.servers.iter().map(|s| s.name.as_str()).collect();
    let idx = Select::new()
        .with_prompt("Remove which server?")
        .items(&names)
        .default(0)
        .interact()
        .map_err(prompt_err)?;

    let removed = config.servers.remove(idx);
    println!("{}", style(format!("Server '{}' removed.", removed.name)).green());
    Ok(())
}

pub fn configure_cloud(config: &mut AppConfig) -> Result<()> {
    println!("\n{}", style("=== Google Drive Configuration ===").cyan().bold());
    let current = config.drive.clone();

    let credentials: String = Input::new()
        .with_prompt("Access token file (plain token or JSON with access_token)")
        .default(
            current
                .as_ref()
                .map(|d| d.credentials_file.to_string_lossy().to_string())
                .unwrap_or_else(|| "~/.tlm_remote_backup/drive_token.json".to_string()),
        )
        .interact_text()
        .map_err(prompt_err)?;

    let folder: String = Input::new()
        .with_prompt("Default destination folder ID (empty = My Drive root)")
        .default(
            current
                .as_ref()
                .and_then(|d| d.default_folder_id.clone())
                .unwrap_or_default(),
        )
        .allow_empty(true)
        .interact_text()
        .map_err(prompt_err)?;

    let rclone: String = Input::new()
        .with_prompt("rclone remote name on the servers (empty = don't use rclone)")
        .default(
            current
                .as_ref()
                .and_then(|d| d.rclone_remote.clone())
                .unwrap_or_default(),
        )
        .allow_empty(true)
        .interact_text()
        .map_err(prompt_err)?;

    let threshold: u64 = Input::new()
        .with_prompt("Large-file threshold (MB)")
        .default(current.as_ref().map_or(1024, |d| d.large_file_threshold_mb))
        .interact_text()
        .map_err(prompt_err)?;

    config.drive = Some(DriveConfig {
        credentials_file: PathBuf::from(credentials),
        default_folder_id: optional(folder),
        rclone_remote: optional(rclone),
        large_file_threshold_mb: threshold.max(1),
    });
    println!("{}", style("Google Drive configuration saved.").green());
    Ok(())
}

pub async fn configure_discord(config: &mut AppConfig) -> Result<()> {
    println!("\n{}", style("=== Discord Notifications ===").cyan().bold());

    let webhook_url: String = Input::new()
        .with_prompt("Discord webhook URL")
        .interact_text()
        .map_err(prompt_err)?;

    let discord_config = DiscordConfig { webhook_url };
    println!("\n{}", style("Sending test message...").yellow());
    DiscordNotifier::new(&discord_config)?
        .send_test_message()
        .await?;
    println!("{}", style("✓ Discord webhook works!").green());

    config.notifications.discord = Some(discord_config);
    println!("{}", style("Discord configuration saved.").green());
    Ok(())
}

pub fn configure_backup_directory(config: &mut AppConfig) -> Result<()> {
    println!("\n{}", style("=== Backup Directory ===").cyan().bold());

    let current = config.local_backup_dir.to_string_lossy().to_string();
    let path: String = Input::new()
        .with_prompt("Local backup directory")
        .default(current)
        .interact_text()
        .map_err(prompt_err)?;

    config.local_backup_dir = PathBuf::from(path);
    println!(
        "{}",
        style(format!(
            "Backup directory set to: {}",
            config.local_backup_dir.display()
        ))
        .green()
    );
    Ok(())
}

pub fn configure_concurrency(config: &mut AppConfig) -> Result<()> {
    let value: usize = Input::new()
        .with_prompt("Maximum servers backed up at once")
        .default(config.max_concurrent_backups)
        .interact_text()
        .map_err(prompt_err)?;

    config.max_concurrent_backups = value.max(1);
    println!(
        "{}",
        style(format!("Concurrency set to {}", config.max_concurrent_backups)).green()
    );
    Ok(())
}

pub async fn run_initial_setup(config: &mut AppConfig) -> Result<()> {
    println!("\n{}", style("╔════════════════════════════════════════╗").cyan());
    println!("{}", style("║     TLM Remote Backup - Setup          ║").cyan());
    println!("{}", style("╚════════════════════════════════════════╝").cyan());

    println!("\nWelcome! Let's configure your first server.\n");
    if Confirm::new()
        .with_prompt("Would you like to configure Google Drive upload?")
        .default(true)
        .interact()
        .map_err(prompt_err)?
    {
        configure_cloud(config)?;
    }
    configure_server(config).await?;
    configure_backup_directory(config)?;

    if Confirm::new()
        .with_prompt("Would you like to configure Discord notifications?")
        .default(true)
        .interact()
        .map_err(prompt_err)?
    {
        configure_discord(config).await?;
    }

    println!("\n{}", style("Setup complete!").green().bold());
    Ok(())
}
