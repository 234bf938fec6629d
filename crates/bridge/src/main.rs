//! hid-bridge
//!
//! Streams decoded boot-mouse reports from every matching USB device until
//! interrupted, then cancels, drains and releases everything before exiting
//! with the last USB status code.

use anyhow::{Context, Result};
use bridge::config::{BridgeConfig, OutputFormat};
use bridge::sink::{EventSink, JsonSink, KeyBridgeSink, StdoutInput, TextSink};
use bridge::spawn_bridge_worker;
use bridge::usb::scan;
use clap::Parser;
use common::{BridgeEvent, ControlBridge, create_control_bridge, setup_logging};
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hid-bridge")]
#[command(
    author,
    version,
    about = "Bridge USB boot mice to a stream of decoded events"
)]
#[command(long_about = "
Claims every USB boot-protocol mouse, keeps an interrupt read in flight on
each one and prints every decoded report. Ctrl+C cancels outstanding reads,
waits for them to retire and releases the devices.

EXAMPLES:
    # Stream as text
    hid-bridge

    # One JSON object per report
    hid-bridge --output json

    # Map buttons to KEY_L / KEY_S / KEY_ENTER
    hid-bridge --output keys

    # Only a specific device
    hid-bridge --config ~/bridge.toml

    # List matching devices without claiming them
    hid-bridge --list-devices

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hid-bridge/bridge.toml
    3. /etc/hid-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Drop reports shorter than 8 bytes instead of zero-filling them
    #[arg(long)]
    strict: bool,

    /// Give up on a device after this many consecutive transient failures
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };
    apply_overrides(&mut config, &args);

    let log_level = config.bridge.log_level.clone();
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("hid-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        list_devices_mode(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let sink = build_sink(&config);
    let (bridge, worker) = create_control_bridge();
    let worker_handle = spawn_bridge_worker(config, worker, sink)
        .context("Failed to spawn USB worker thread")?;

    let status = run(bridge).await;

    let status = match worker_handle.join() {
        Ok(Ok(code)) => status.unwrap_or(code),
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e).context("Failed to initialize USB"));
        }
        Err(e) => {
            error!("USB worker thread panicked: {:?}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    info!("Exiting with status {}", status);
    Ok(ExitCode::from(status as u8))
}

fn apply_overrides(config: &mut BridgeConfig, args: &Args) {
    if let Some(level) = &args.log_level {
        config.bridge.log_level = level.clone();
    }
    if let Some(output) = args.output {
        config.bridge.output = output;
    }
    if args.strict {
        config.transfer.decode_policy = protocol::DecodePolicy::Strict;
    }
    if let Some(max) = args.max_retries {
        config.transfer.max_transient_retries = Some(max);
    }
}

fn build_sink(config: &BridgeConfig) -> Box<dyn EventSink + Send> {
    match config.bridge.output {
        OutputFormat::Text => Box::new(TextSink::new(
            std::io::stdout(),
            config.bridge.activity_only,
        )),
        OutputFormat::Json => Box::new(JsonSink::new(std::io::stdout())),
        OutputFormat::Keys => Box::new(KeyBridgeSink::new(StdoutInput::new(std::io::stdout()))),
    }
}

/// Wait for Ctrl+C or for the worker to stop on its own.
///
/// Returns the status reported by the worker, if it got that far.
async fn run(bridge: ControlBridge) -> Option<i32> {
    let mut shutdown_sent = false;

    loop {
        tokio::select! {
            result = signal::ctrl_c(), if !shutdown_sent => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Interrupt received, shutting down...");
                if let Err(e) = bridge.shutdown().await {
                    warn!("Failed to send shutdown: {}", e);
                }
                shutdown_sent = true;
            }
            event = bridge.recv_event() => match event {
                Ok(BridgeEvent::Started { devices }) => {
                    info!("Streaming from {} device(s)", devices.len());
                    for device in &devices {
                        info!("  {}", device);
                    }
                }
                Ok(BridgeEvent::DeviceRetired { slot, vendor_id, product_id, reason }) => {
                    warn!(
                        "Device {:04x}:{:04x} (slot {}) stopped: {}",
                        vendor_id, product_id, slot, reason
                    );
                }
                Ok(BridgeEvent::Stopped { status }) => return Some(status),
                Err(_) => return None,
            }
        }
    }
}

fn list_devices_mode(config: &BridgeConfig) -> Result<()> {
    let context = rusb::Context::new().context("Failed to initialize USB")?;
    let candidates = scan(&context, &config.interface_filter(), &config.usb.filters)
        .context("Failed to enumerate USB devices")?;

    if candidates.is_empty() {
        println!("No matching devices found");
        return Ok(());
    }

    println!("Matching devices:");
    for candidate in &candidates {
        println!("  {}", candidate.summary());
    }
    Ok(())
}
