//! printlink
//!
//! Command-line console for receipt printers reachable over TCP,
//! Bluetooth RFCOMM or USB.

mod config;
mod console;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::ClientConfig;
use console::DirectLink;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use transport::usb::{RusbBackend, UsbBackend, UsbFilter, matches_any};
use transport::{BdAddr, RfcommTarget, RfcommTransport, TcpTarget, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "printlink")]
#[command(author, version, about = "printlink - Talk to receipt printers")]
#[command(long_about = "
Connects to a receipt printer over TCP, Bluetooth RFCOMM or USB and
forwards console input to it. Bytes the printer sends back are shown
as hex.

EXAMPLES:
    # Interactive session with a network printer
    printlink tcp 192.168.0.50

    # Print a file over Bluetooth and exit
    printlink bluetooth 00:11:22:33:44:55 --send receipt.bin

    # Wait for a USB printer and follow it across replugs
    printlink usb --filter 0x2a92:*

    # List attached USB devices
    printlink list-usb

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/printlink/client.toml
    3. /etc/printlink/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a network printer (raw TCP, port 9100 by default)
    Tcp {
        /// Host name or IP address, with optional `:port`
        host: Option<String>,

        /// Port, overriding the config and any `:port` suffix
        #[arg(short, long)]
        port: Option<u16>,

        /// Write this file once connected, then exit
        #[arg(long, value_name = "FILE")]
        send: Option<PathBuf>,
    },
    /// Connect to a Bluetooth printer over RFCOMM
    Bluetooth {
        /// Printer address (XX:XX:XX:XX:XX:XX)
        address: Option<String>,

        /// RFCOMM channel
        #[arg(long)]
        channel: Option<u8>,

        /// Write this file once connected, then exit
        #[arg(long, value_name = "FILE")]
        send: Option<PathBuf>,
    },
    /// Claim a USB printer and follow attach and detach
    Usb {
        /// Device filter `VID:PID` (repeatable, `*` for any product)
        #[arg(short, long = "filter", value_name = "VID:PID")]
        filters: Vec<String>,

        /// Write this file once connected, then exit
        #[arg(long, value_name = "FILE")]
        send: Option<PathBuf>,
    },
    /// List attached USB devices and whether they match the filters
    ListUsb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("printlink v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let Some(command) = args.command else {
        return Err(anyhow!(
            "No transport given, run with `tcp`, `bluetooth`, `usb` or `list-usb`"
        ));
    };

    match command {
        Command::Tcp { host, port, send } => run_tcp(&config, host, port, send).await,
        Command::Bluetooth {
            address,
            channel,
            send,
        } => run_bluetooth(&config, address, channel, send).await,
        Command::Usb { filters, send } => run_usb(&config, filters, send).await,
        Command::ListUsb => list_usb(&config),
    }
}

async fn run_tcp(
    config: &ClientConfig,
    host: Option<String>,
    port: Option<u16>,
    send: Option<PathBuf>,
) -> Result<()> {
    let host = host
        .or_else(|| config.tcp.host.clone())
        .ok_or_else(|| anyhow!("No printer host given and none configured in [tcp]"))?;

    let mut target: TcpTarget = host.parse().context("Invalid printer address")?;
    match port {
        Some(port) => target = TcpTarget::parse(&target.host, &port.to_string())?,
        None if !has_port_suffix(&host) => target.port = config.tcp.port,
        None => {}
    }

    info!("Connecting to {} over TCP", target);
    let link = DirectLink::new(TcpTransport::new(config.tcp.settings()), target);
    console::run(link, send).await
}

/// Returns true if `host` carries its own `:port`
fn has_port_suffix(host: &str) -> bool {
    match host.trim().strip_prefix('[') {
        Some(rest) => rest.contains("]:"),
        None => matches!(host.rsplit_once(':'), Some((h, _)) if !h.contains(':')),
    }
}

async fn run_bluetooth(
    config: &ClientConfig,
    address: Option<String>,
    channel: Option<u8>,
    send: Option<PathBuf>,
) -> Result<()> {
    let address = address
        .or_else(|| config.bluetooth.address.clone())
        .ok_or_else(|| anyhow!("No Bluetooth address given and none configured in [bluetooth]"))?;
    let address: BdAddr = address.parse().context("Invalid Bluetooth address")?;

    let mut target =
        RfcommTarget::new(address).with_channel(channel.unwrap_or(config.bluetooth.channel));
    if let Some(name) = &config.bluetooth.name {
        target = target.with_name(name.clone());
    }

    info!("Connecting to {} on RFCOMM channel {}", target.address, target.channel);
    let link = DirectLink::new(RfcommTransport::new(config.bluetooth.settings()), target);
    console::run(link, send).await
}

fn usb_filters(config: &ClientConfig, cli: Vec<String>) -> Result<Vec<UsbFilter>> {
    if cli.is_empty() {
        return config.usb.parsed_filters();
    }
    cli.iter()
        .map(|f| {
            f.parse::<UsbFilter>()
                .with_context(|| format!("Invalid USB filter '{}'", f))
        })
        .collect()
}

async fn run_usb(config: &ClientConfig, filters: Vec<String>, send: Option<PathBuf>) -> Result<()> {
    let filters = usb_filters(config, filters)?;
    let backend = Arc::new(RusbBackend::new().context("Failed to initialize libusb")?);

    info!(
        "Watching for USB printers matching: {}",
        if filters.is_empty() {
            "any device".to_string()
        } else {
            filters
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    let link = console::usb_link(backend, filters, config.usb.interface, config.usb.settings())?;
    console::run(link, send).await
}

fn list_usb(config: &ClientConfig) -> Result<()> {
    let filters = config.usb.parsed_filters()?;
    let backend = RusbBackend::new().context("Failed to initialize libusb")?;
    let devices = backend.devices().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found");
        return Ok(());
    }

    for device in devices {
        let marker = if matches_any(&filters, device.vendor_id, device.product_id) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {} {:04x}:{:04x} {}",
            marker,
            device.id,
            device.vendor_id,
            device.product_id,
            device.label()
        );
    }
    Ok(())
}
