use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};
use tokio::sync::broadcast::error::RecvError;

use meercon_provisioner_lib::commands::{self, ProvisionRequest, StdinPrompt};
use meercon_provisioner_lib::config::{CONFIG_FILE_NAME, ProvisionerConfig};
use meercon_provisioner_lib::core::{ProvisioningEvent, ProvisioningState};
use meercon_provisioner_lib::logging;
use meercon_provisioner_lib::state::AppState;

#[derive(Parser)]
#[command(name = "meercon-provisioner")]
#[command(about = "Bluetooth Wi-Fi provisioning tool for MeerCon cameras")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for cameras
    Scan {
        /// Scan duration in seconds (defaults to the configured scan timeout)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Send Wi-Fi credentials to the first camera found
    Provision {
        /// Network name; chosen from the camera's list when omitted
        #[arg(short, long)]
        network: Option<String>,
        /// Network password; prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Write the current configuration (defaults if none exists) to the config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let config = ProvisionerConfig::load_config(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::InitConfig => {
            config.save_config(&cli.config).await?;
            println!("Wrote {}", cli.config.display());
        }
        Commands::Scan { duration } => {
            let duration = duration.map(Duration::from_secs).unwrap_or(config.scan_timeout());
            let app_state = AppState::new(config).await?;
            println!("Scanning for cameras ({} seconds)...", duration.as_secs());
            let found = commands::scan_devices(&app_state.scanner, &app_state.config, duration).await?;
            println!("\nFound {} devices:", found.len());
            for handle in found {
                println!("  {}", handle);
            }
        }
        Commands::Provision { network, password } => {
            let app_state = AppState::new(config).await?;
            let progress = tokio::spawn(report_progress(app_state.machine.subscribe()));

            let mut prompt = StdinPrompt::new();
            let request = ProvisionRequest { network, password };
            let result = commands::provision(&app_state.machine, request, &mut prompt).await;

            app_state.machine.reset().await?;
            progress.abort();
            let outcome = result?;
            println!(
                "\n{} joined {:?}.",
                outcome.peripheral.name, outcome.network
            );
        }
    }

    Ok(())
}

async fn report_progress(mut events: tokio::sync::broadcast::Receiver<ProvisioningEvent>) {
    loop {
        match events.recv().await {
            Ok(ProvisioningEvent::StateChanged { to, .. }) => match to {
                ProvisioningState::Scanning => println!("Scanning for a camera..."),
                ProvisioningState::Connecting => println!("Connecting..."),
                ProvisioningState::Submitting => println!("Sending credentials..."),
                ProvisioningState::Error(e) => println!("Failed: {}", e),
                _ => {}
            },
            Ok(ProvisioningEvent::PeripheralFound(handle)) => println!("Found {}", handle),
            Ok(ProvisioningEvent::CredentialsRejected { code, .. }) => {
                info!("Camera answered with status {}", code)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => info!("Skipped {} progress events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
