//! `dgctl`: command-line front end for a BNC 565 delay generator.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dgctl::config::{Settings, DEFAULT_CONFIG_PATH};
use dgctl::control::{commit_message, Controller};
use dgctl::device::{json, Device};
use dgctl::transport::{MockTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "dgctl", about = "Control a BNC 565 digital delay generator", version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate, overriding the configuration
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Talk to the built-in BNC 565 simulator instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and print the device snapshot as JSON
    Status,
    /// Commit a snapshot JSON file to the device
    Commit { file: PathBuf },
    /// Restore the factory pulse layout and start the trigger
    Reset,
    /// Send raw commands and print each reply
    Send {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Run one control request, e.g. "/dg/ctl?banner"
    Request {
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Print tick events until Ctrl-C
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(port) = cli.port.clone() {
        settings.serial.port = port;
    }
    if let Some(baud) = cli.baud {
        settings.serial.baud_rate = baud;
    }
    settings.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let transport = build_transport(&settings, cli.simulate)?;
    let device = Arc::new(Device::new(settings.clone(), transport));

    let outcome = run(&device, &settings, cli.command).await;
    device.shutdown().await;
    outcome
}

fn build_transport(settings: &Settings, simulate: bool) -> Result<Arc<dyn Transport>> {
    if simulate {
        info!("Using the built-in BNC 565 simulator");
        return Ok(Arc::new(MockTransport::simulator()));
    }
    serial_transport(settings)
}

#[cfg(feature = "serial")]
fn serial_transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(dgctl::transport::SerialTransport::new(
        settings.shutdown.grace(),
    )))
}

#[cfg(not(feature = "serial"))]
fn serial_transport(_settings: &Settings) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("built without the `serial` feature; use --simulate")
}

async fn run(device: &Arc<Device>, settings: &Settings, command: Command) -> Result<()> {
    let port = settings.serial.port.as_str();
    let baud = settings.serial.baud_rate;

    match command {
        Command::Status => {
            connect_or_warn(device, port, baud).await;
            let snapshot = device.fetch().await;
            println!("{}", json::to_string(&snapshot)?);
        }
        Command::Commit { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let snapshot = json::from_str(&text)?;
            device
                .connect(port, baud)
                .await
                .with_context(|| format!("connecting to {}", port))?;
            let report = device.commit(&snapshot.protocol).await;
            println!("{}", commit_message(&report));
            if !report.is_success() {
                anyhow::bail!("{} directive(s) not acknowledged", report.failed.len());
            }
        }
        Command::Reset => {
            device
                .connect(port, baud)
                .await
                .with_context(|| format!("connecting to {}", port))?;
            if !device.reset().await {
                anyhow::bail!("reset did not complete; trigger may be inactive");
            }
            println!("reset complete; trigger is active");
        }
        Command::Send { commands } => {
            device
                .connect(port, baud)
                .await
                .with_context(|| format!("connecting to {}", port))?;
            for command in commands {
                match device.send(&command).await {
                    Ok(reply) => println!("{}", reply),
                    Err(e) => println!("Error: {}", e),
                }
            }
        }
        Command::Request { path, method } => {
            connect_or_warn(device, port, baud).await;
            let controller = Controller::new(device.clone());
            println!("{}", controller.handle(&method, &path).await);
        }
        Command::Watch { seconds } => {
            connect_or_warn(device, port, baud).await;
            let _sub = device.subscribe_ticks(|tick| println!("{}", tick.to_event_json()));
            match seconds {
                Some(s) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(s)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => {
                    tokio::signal::ctrl_c().await?;
                }
            }
            info!(ticks = device.ticks().ticks(), "Watch finished");
        }
    }
    Ok(())
}

/// Status-style commands still answer without a device.
async fn connect_or_warn(device: &Device, port: &str, baud: u32) {
    if let Err(e) = device.connect(port, baud).await {
        warn!(port, "Continuing without a device: {}", e);
    }
}
