use crate::backup::{run_batch, BulkResult, JobRunner};
use crate::config::{self, AppConfig, BackupJobConfig};
use crate::error::{BackupError, Result};
use crate::notify::DiscordNotifier;
use crate::remote::ssh::SshTransport;
use crate::remote::{RemoteExecutor, RemoteProbe};
use crate::upload::{CloudStore, DriveClient};
use console::style;
use dialoguer::Select;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MenuOption {
    RunAllServers,
    RunOneServer,
    CheckRemoteTools,
    EditConfiguration,
    TestCloudConnection,
    TestNotification,
    Quit,
}

impl std::fmt::Display for MenuOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MenuOption::RunAllServers => write!(f, "Run backup now (all servers)"),
            MenuOption::RunOneServer => write!(f, "Run backup for one server"),
            MenuOption::CheckRemoteTools => write!(f, "Check remote tools"),
            MenuOption::EditConfiguration => write!(f, "Edit configuration"),
            MenuOption::TestCloudConnection => write!(f, "Test Google Drive connection"),
            MenuOption::TestNotification => write!(f, "Test Discord notification"),
            MenuOption::Quit => write!(f, "Quit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EditOption {
    AddServer,
    RemoveServer,
    CloudSettings,
    DiscordWebhook,
    BackupDirectory,
    Concurrency,
    Back,
}

impl std::fmt::Display for EditOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditOption::AddServer => write!(f, "Add/Edit server"),
            EditOption::RemoveServer => write!(f, "Remove server"),
            EditOption::CloudSettings => write!(f, "Configure Google Drive"),
            EditOption::DiscordWebhook => write!(f, "Configure Discord webhook"),
            EditOption::BackupDirectory => write!(f, "Change backup directory"),
            EditOption::Concurrency => write!(f, "Change parallel backup limit"),
            EditOption::Back => write!(f, "Back to main menu"),
        }
    }
}

fn display_header() {
    println!();
    println!("{}", style("╔════════════════════════════════════════╗").cyan());
    println!("{}", style("║     TLM Remote Backup Manager          ║").cyan());
    println!("{}", style("╚════════════════════════════════════════╝").cyan());
    println!();
}

fn display_summary(config: &AppConfig) {
    let server_count = config.servers.len();
    let cloud_count = config.servers.iter().filter(|s| s.cloud.enabled).count();

    println!("{}", style("Current Configuration:").bold());
    println!(
        "  Servers: {}",
        if server_count > 0 {
            style(server_count.to_string()).green()
        } else {
            style("None".to_string()).red()
        }
    );
    println!("  Cloud uploads enabled: {}", cloud_count);
    println!(
        "  Google Drive: {}",
        match &config.drive {
            Some(d) if d.rclone_remote.is_some() => style("Configured (rclone)").green(),
            Some(_) => style("Configured").green(),
            None => style("Not configured").yellow(),
        }
    );
    println!(
        "  Discord: {}",
        if config.notifications.discord.is_some() {
            style("Configured").green()
        } else {
            style("Not configured").yellow()
        }
    );
    println!("  Parallel backups: {}", config.max_concurrent_backups.max(1));
    println!(
        "  Backup directory: {}",
        style(config.local_backup_dir.display()).cyan()
    );
    println!();
}

/// Shows `label` before a slow check so the user sees what is running.
fn print_label(label: &str) {
    print!("  {}... ", label);
    let _ = std::io::stdout().flush();
}

fn wait_for_enter() {
    println!("\nPress Enter to continue...");
    let _ = std::io::stdin().read_line(&mut String::new());
}

pub async fn run_menu(shutdown: Arc<AtomicUsize>) -> Result<()> {
    let mut config = config::load()?;
    if config.servers.is_empty() {
        println!(
            "\n{}",
            style("No configuration found. Starting setup wizard...").yellow()
        );
        super::wizard::run_initial_setup(&mut config).await?;
        config::save(&config)?;
    }

    loop {
        if shutdown.load(Ordering::Relaxed) > 0 {
            break;
        }

        display_header();
        display_summary(&config);

        let menu_items = vec![
            MenuOption::RunAllServers,
            MenuOption::RunOneServer,
            MenuOption::CheckRemoteTools,
            MenuOption::EditConfiguration,
            MenuOption::TestCloudConnection,
            MenuOption::TestNotification,
            MenuOption::Quit,
        ];

        let selection = match Select::new()
            .with_prompt("Select an option")
            .items(&menu_items)
            .default(0)
            .interact_opt()
        {
            Ok(Some(s)) => s,
            Ok(None) | Err(_) => break,
        };

        match menu_items[selection] {
            MenuOption::RunAllServers => {
                run_backup_now(&config, None).await;
            }
            MenuOption::RunOneServer => {
                if let Some(name) = pick_server(&config, "Back up which server?") {
                    run_backup_now(&config, Some(&name)).await;
                }
            }
            MenuOption::CheckRemoteTools => {
                check_remote_tools(&config).await;
            }
            MenuOption::EditConfiguration => {
                if let Err(e) = edit_configuration(&mut config).await {
                    println!("{}: {}", style("Error").red(), e);
                } else if let Err(e) = config::save(&config) {
                    println!("{}: {}", style("Could not save configuration").red(), e);
                }
            }
            MenuOption::TestCloudConnection => {
                test_cloud_connection(&config).await;
            }
            MenuOption::TestNotification => {
                test_notification(&config).await;
            }
            MenuOption::Quit => {
                println!("{}", style("Goodbye!").green());
                break;
            }
        }
    }

    Ok(())
}

fn pick_server(config: &AppConfig, prompt: &str) -> Option<String> {
    if config.servers.is_empty() {
        println!("{}", style("No servers configured.").red());
        return None;
    }
    let names: Vec<&str> = config.servers.iter().map(|s| s.name.as_str()).collect();
    match Select::new()
        .with_prompt(prompt)
        .items(&names)
        .default(0)
        .interact_opt()
    {
        Ok(Some(idx)) => Some(names[idx].to_string()),
        Ok(None) | Err(_) => None,
    }
}

fn find_job(config: &AppConfig, name: &str) -> Result<BackupJobConfig> {
    config::resolve_jobs(config)?
        .into_iter()
        .find(|job| job.server_name == name)
        .ok_or_else(|| BackupError::Config(format!("unknown server '{}'", name)))
}

/// Resolves the configured servers (optionally just one) and backs them up
/// in parallel.
pub async fn run_all(config: &AppConfig, only: Option<&str>) -> Result<BulkResult> {
    let jobs = match only {
        Some(name) => vec![find_job(config, name)?],
        None => config::resolve_jobs(config)?,
    };
    let runner = JobRunner::from_config(config)?;
    Ok(run_batch(Arc::new(runner), jobs, config.max_concurrent_backups).await)
}

pub fn print_results(bulk: &BulkResult) {
    println!("\n{}", style("=== Backup Results ===").cyan().bold());
    for report in &bulk.results {
        let result = &report.result;
        if result.success {
            println!(
                "{} {} - {} ({:.2} MB, {:.1} sec)",
                style("✓").green(),
                result.server_name,
                style("Success").green(),
                result.byte_size_mb.unwrap_or(0.0),
                report.duration_secs
            );
            if let Some(path) = &result.local_file_path {
                println!("    Saved to: {}", path);
            }
            if let Some(id) = &result.cloud_object_id {
                println!(
                    "    Uploaded to {} via {} (id {})",
                    result.folder_name.as_deref().unwrap_or("Drive"),
                    result
                        .strategy_used
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    id
                );
            }
        } else {
            println!(
                "{} {} - {} ({})",
                style("✗").red(),
                result.server_name,
                style("Failed").red(),
                result.error_message.as_deref().unwrap_or("Unknown error")
            );
        }
    }

    println!(
        "\nCompleted: {}/{} servers backed up in {:.1} sec",
        style(bulk.success_count).green(),
        bulk.total_servers,
        bulk.total_wall_secs
    );
}

async fn run_backup_now(config: &AppConfig, only: Option<&str>) {
    if config.servers.is_empty() {
        println!(
            "{}",
            style("No servers configured. Please add a server first.").red()
        );
        return;
    }

    println!("\n{}", style("Running backups...").yellow());
    match run_all(config, only).await {
        Ok(bulk) => print_results(&bulk),
        Err(e) => println!("{}: {}", style("Backup could not start").red(), e),
    }

    wait_for_enter();
}

async fn check_remote_tools(config: &AppConfig) {
    let Some(name) = pick_server(config, "Check which server?") else {
        return;
    };
    let job = match find_job(config, &name) {
        Ok(job) => job,
        Err(e) => {
            println!("{}: {}", style("ERROR").red(), e);
            return;
        }
    };

    println!("\n{}", style(format!("Checking {}...", job.target.address())).yellow());
    let executor = RemoteExecutor::new(Arc::new(SshTransport), job.connect_timeout);
    let probe = RemoteProbe::new(executor.clone());

    print_label("SSH connection");
    if let Err(e) = executor.verify_connection(&job.target).await {
        println!("{}: {}", style("FAILED").red(), e);
        wait_for_enter();
        return;
    }
    println!("{}", style("OK").green());

    print_label(&format!("{} tools", job.compression));
    match probe.check_required_tools(&job.target, job.compression).await {
        Ok(report) if report.available => println!("{}", style("OK").green()),
        Ok(report) => println!(
            "{}: missing {}",
            style("FAILED").red(),
            report.missing.join(", ")
        ),
        Err(e) => println!("{}: {}", style("ERROR").red(), e),
    }

    print_label(&job.remote_directory);
    match probe.directory_exists(&job.target, &job.remote_directory).await {
        Ok(true) => println!("{}", style("OK").green()),
        Ok(false) => println!("{}", style("NOT FOUND").red()),
        Err(e) => println!("{}: {}", style("ERROR").red(), e),
    }

    print_label("rclone");
    match probe.has_tool(&job.target, "rclone").await {
        Ok(true) => println!("{}", style("available").green()),
        Ok(false) => println!("{}", style("not installed (streaming upload will be used)").dim()),
        Err(e) => println!("{}: {}", style("ERROR").red(), e),
    }

    wait_for_enter();
}

async fn edit_configuration(config: &mut AppConfig) -> Result<()> {
    loop {
        println!("\n{}", style("=== Edit Configuration ===").cyan().bold());

        let edit_items = vec![
            EditOption::AddServer,
            EditOption::RemoveServer,
            EditOption::CloudSettings,
            EditOption::DiscordWebhook,
            EditOption::BackupDirectory,
            EditOption::Concurrency,
            EditOption::Back,
        ];

        let selection = match Select::new()
            .with_prompt("What would you like to edit?")
            .items(&edit_items)
            .default(0)
            .interact_opt()
        {
            Ok(Some(s)) => s,
            Ok(None) | Err(_) => break,
        };

        match edit_items[selection] {
            EditOption::AddServer => super::wizard::configure_server(config).await?,
            EditOption::RemoveServer => super::wizard::remove_server(config)?,
            EditOption::CloudSettings => super::wizard::configure_cloud(config)?,
            EditOption::DiscordWebhook => super::wizard::configure_discord(config).await?,
            EditOption::BackupDirectory => super::wizard::configure_backup_directory(config)?,
            EditOption::Concurrency => super::wizard::configure_concurrency(config)?,
            EditOption::Back => break,
        }
    }

    Ok(())
}

async fn test_cloud_connection(config: &AppConfig) {
    match &config.drive {
        Some(drive) => {
            println!("\n{}", style("Testing Google Drive connection...").yellow());
            let outcome = match DriveClient::from_credentials_file(&config::expand_home(
                &drive.credentials_file,
            )) {
                Ok(client) => client.test_connection().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => println!("{}", style("Google Drive connection successful!").green()),
                Err(e) => println!("{}: {}", style("Google Drive test failed").red(), e),
            }
        }
        None => {
            println!(
                "{}",
                style("Google Drive is not configured. Please configure it first.").red()
            );
        }
    }

    wait_for_enter();
}

async fn test_notification(config: &AppConfig) {
    match &config.notifications.discord {
        Some(discord_config) => {
            println!("\n{}", style("Sending Discord test message...").yellow());
            let outcome = match DiscordNotifier::new(discord_config) {
                Ok(notifier) => notifier.send_test_message().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => println!("{}", style("Discord notification sent!").green()),
                Err(e) => println!("{}: {}", style("Discord test failed").red(), e),
            }
        }
        None => {
            println!(
                "{}",
                style("Discord is not configured. Please configure it first.").red()
            );
        }
    }

    wait_for_enter();
}
