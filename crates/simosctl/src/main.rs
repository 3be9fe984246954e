//! Simos 8/18 Tricore ECU service tool (simosctl)
//!
//! Interactive tool that:
//! - Drives the ECU into its SBOOT service shell via PWM + reset timing
//! - Recovers boot passwords through the validator's CRC primitive
//! - Uploads a stage-two BSL into SRAM over raw CAN
//! - Reads, erases and reprograms on-chip flash through that BSL

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simosctl::config::Config;
use simosctl::device::Device;
use simosctl::flash::TargetVariant;
use simosctl::shell;

#[derive(Parser)]
#[command(name = "simosctl", version, about = "Simos 8/18 SBOOT exploitation and BSL programming")]
struct Cli {
    /// Target ECU generation
    #[arg(long, value_enum, default_value_t = TargetVariant::Simos8)]
    variant: TargetVariant,
    /// Override the SocketCAN interface from the environment/default
    #[arg(long)]
    interface: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(interface) = cli.interface {
        config.can_interface = interface;
    }

    // Plain-text session log next to the tool, one file per run.
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let log_path = format!("logfile_{timestamp}");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {log_path}"))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(Arc::new(log_file)).with_ansi(false).with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting simosctl {}", env!("CARGO_PKG_VERSION"));
    info!(variant = ?cli.variant, interface = %config.can_interface, "session configuration");

    let mut device = Device::open(config, cli.variant)
        .context("acquiring CAN bus and GPIO hardware")?;
    shell::run(&mut device)
}
