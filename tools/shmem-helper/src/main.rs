//! shmem-helper - reference helper process for the acpi-shmem device
//!
//! Creates the shared battery memory, hands it to the VMM together with an
//! interrupt and a doorbell descriptor, then services the doorbell and
//! optionally simulates a discharging battery.
//!
//! Usage:
//!   shmem-helper --socket /run/acpi-shmem.sock --size 0x1000 --tick-ms 1000

mod region;
mod server;

use std::fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use acpi_shmem::{ShmemConfig, MAX_SIZE, MIN_SIZE};
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use crate::region::SharedRegion;
use crate::server::{serve, ServeOptions};

#[derive(Parser, Debug)]
#[command(name = "shmem-helper")]
#[command(version)]
#[command(about = "Share battery registers with an acpi-shmem device")]
struct Args {
    /// Unix socket to listen on (default: `chardev` from the config file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Shared memory size in bytes
    #[arg(long, default_value = "0x1000")]
    size: String,

    /// TOML device configuration; `battery_regs` seeds the registers
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drain the battery and interrupt the guest every N milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Charge drained per tick, in mAh
    #[arg(long, default_value_t = 10)]
    step: u32,
}

fn parse_hex_or_dec(s: &str) -> Result<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).context("Invalid hex number")
    } else {
        s.parse::<u64>().context("Invalid decimal number")
    }
}

fn load_config(path: Option<&Path>) -> Result<ShmemConfig> {
    let Some(path) = path else {
        return Ok(ShmemConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let size = parse_hex_or_dec(&args.size)?;
    if !(MIN_SIZE..=MAX_SIZE).contains(&size) {
        anyhow::bail!("Size {:#x} outside [{:#x}, {:#x}]", size, MIN_SIZE, MAX_SIZE);
    }

    let socket = args
        .socket
        .or(config.chardev.clone())
        .context("No socket given (use --socket or set chardev in the config)")?;

    let mut region = SharedRegion::create(size)?;
    region.seed(&config.battery_regs);

    if socket.exists() {
        fs::remove_file(&socket).with_context(|| format!("Failed to remove stale {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket).with_context(|| format!("Failed to bind {}", socket.display()))?;

    println!(
        "{} listening on {} ({:#x} bytes)",
        "shmem-helper".green().bold(),
        socket.display(),
        size
    );

    let opts = ServeOptions {
        tick: args.tick_ms.map(Duration::from_millis),
        step: args.step,
    };
    let stats = serve(&listener, &mut region, opts)?;

    log::info!("doorbell rings: {}, ticks: {}", stats.rings, stats.ticks);
    fs::remove_file(&socket).ok();
    Ok(())
}
