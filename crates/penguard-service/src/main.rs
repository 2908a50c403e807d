//! Penguard Service - BLE collector for acoustic field sensors.
//!
//! Run with: `cargo run -p penguard-service`

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use penguard_core::{EventReceiver, SensorSystem, SystemEvent};
use penguard_service::{Config, default_config_path};

/// Penguard Service - discovers detectors, keeps their links up and logs readings.
#[derive(Parser, Debug)]
#[command(name = "penguard-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Maximum concurrent connections (overrides config).
    #[arg(long, global = true)]
    max_connections: Option<usize>,

    /// Scan interval in milliseconds (overrides config).
    #[arg(long, global = true)]
    scan_interval_ms: Option<u64>,

    /// Print every event as a JSON line on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collector in the foreground (default behavior).
    Run,

    /// Write a configuration file with the default settings.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::InitConfig { force }) => init_config(args.config, force),
        Some(Command::Run) | None => run(args).await,
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("penguard_service={level},penguard_core={level}"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };

    if let Some(max) = args.max_connections {
        config.system.max_concurrent_connections = max;
    }
    if let Some(interval) = args.scan_interval_ms {
        config.system.scan_interval_ms = interval;
    }
    config.validate()?;

    let system = SensorSystem::open(config.to_system_config())
        .await
        .context("failed to open Bluetooth adapter")?;
    let logger = tokio::spawn(log_events(system.subscribe(), args.json));

    if let Err(e) = system.start().await {
        error!("Failed to start: {}", e);
        system.shutdown().await.ok();
        return Err(e.into());
    }
    info!(
        max_connections = config.system.max_concurrent_connections,
        scan_interval_ms = config.system.scan_interval_ms,
        "Collector running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");

    let status = system.system_status().await;
    info!(
        devices = status.devices.total,
        connected = status.active_connections,
        blacklisted = status.devices.blacklisted,
        "Final device counts"
    );

    let result = system.shutdown().await;
    drop(system);
    if let Err(e) = logger.await {
        debug!("Event logger ended abnormally: {}", e);
    }
    result.context("shutdown did not complete cleanly")
}

async fn log_events(mut events: EventReceiver, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        }

        match &event {
            SystemEvent::DeviceDiscovered { device } => {
                info!(address = %device.address, device_type = %device.device_type, "Discovered");
            }
            SystemEvent::DeviceStateChange {
                address,
                old_state,
                new_state,
                ..
            } => {
                debug!(address = %address, "{:?} -> {:?}", old_state, new_state);
            }
            SystemEvent::DeviceError { address, error } => {
                warn!(address = %address, "Device error: {}", error);
            }
            SystemEvent::DeviceBlacklisted { address } => {
                warn!(address = %address, "Device blacklisted");
            }
            SystemEvent::DataProcessed { address, readings } => {
                for reading in readings {
                    match reading.summary() {
                        Some(summary) if summary.detection => info!(
                            address = %address,
                            amplitude = summary.amplitude,
                            frequency = summary.frequency,
                            "Detection"
                        ),
                        Some(summary) => debug!(
                            address = %address,
                            amplitude = summary.amplitude,
                            frequency = summary.frequency,
                            "Reading"
                        ),
                        None => debug!(address = %address, raw = %reading.raw, "Malformed frame"),
                    }
                }
            }
            SystemEvent::ProcessingError {
                address,
                error,
                frames,
            } => {
                warn!(address = %address, frames = frames.len(), "Processing failed: {}", error);
            }
            SystemEvent::SystemStopped { .. } => break,
            _ => {}
        }
    }
}
