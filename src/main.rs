mod backup;
mod cli;
mod config;
mod error;
mod log;
mod naming;
mod notify;
mod remote;
mod transfer;
mod upload;

use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tlm-remote-backup")]
#[command(about = "Backs up folders on remote servers over SSH", long_about = None)]
struct Cli {
    /// Without a command the interactive menu starts.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up once without the menu; exits 1 when any server failed.
    Run {
        /// Only back up this server.
        server: Option<String>,
    },
}

async fn run_headless(only: Option<&str>) -> i32 {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Could not load configuration: {}", e);
            return 1;
        }
    };
    if config.servers.is_empty() {
        error!(
            "No servers configured in {:?}; run without arguments to set up",
            config::config_path()
        );
        return 1;
    }

    match cli::run_all(&config, only).await {
        Ok(bulk) => {
            cli::print_results(&bulk);
            if bulk.all_succeeded() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            error!("Backup could not start: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    log::init();

    info!("TLM Remote Backup starting...");

    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let ctrl_c_count_clone = ctrl_c_count.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        let count = ctrl_c_count_clone.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            println!("\n\nShutdown signal received. Press Ctrl+C again to force exit...");
        } else {
            println!("\nForce exiting...");
            std::process::exit(130);
        }
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    if let Some(Commands::Run { server }) = &args.command {
        let code = run_headless(server.as_deref()).await;
        std::process::exit(code);
    }

    match cli::run_menu(ctrl_c_count).await {
        Ok(_) => {
            info!("Application exited normally");
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_arguments_means_menu() {
        let cli = Cli::try_parse_from(["tlm-remote-backup"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_with_and_without_server() {
        let all = Cli::try_parse_from(["tlm-remote-backup", "run"]).unwrap();
        assert!(matches!(all.command, Some(Commands::Run { server: None })));

        let one = Cli::try_parse_from(["tlm-remote-backup", "run", "db1"]).unwrap();
        match one.command {
            Some(Commands::Run { server }) => assert_eq!(server.as_deref(), Some("db1")),
            None => panic!("expected run"),
        }
    }

    #[test]
    fn test_unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["tlm-remote-backup", "run", "--bogus"]).is_err());
        assert!(Cli::try_parse_from(["tlm-remote-backup", "backup"]).is_err());
    }
}
