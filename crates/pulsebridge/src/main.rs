//! # pulsebridge
//!
//! Bridge daemon relaying a BLE heart-rate sensor to the ingestion endpoint.
//!
//! The daemon runs until killed; systemd is expected to restart it if it
//! ever exits.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package pulsebridge --features bluetooth -- --config ./pulsebridge.toml
//!
//! # Production (on Raspberry Pi)
//! ./pulsebridge --production
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pulsebridge_core::{BridgeConfig, CredentialStore, Credentials};
use tracing::info;

mod logging;

/// Relay a BLE heart-rate peripheral to a cloud ingestion endpoint.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to /etc/pulsebridge/config.toml)
    #[arg(short, long, env = "PULSEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Credential file path, overriding the configured one
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Log as a production service (JSON file + journald-friendly stdout)
    #[arg(long, env = "PULSEBRIDGE_PRODUCTION")]
    production: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        BridgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = cli.credentials {
        config.credentials_path = path;
    }
    config.validate().context("Invalid configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init(cli.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.endpoint,
        "Starting pulsebridge"
    );

    let credentials = CredentialStore::new(&config.credentials_path, Credentials::default());
    run(config, credentials).await
}

#[cfg(feature = "bluetooth")]
async fn run(config: BridgeConfig, credentials: CredentialStore) -> anyhow::Result<()> {
    use pulsebridge_core::{BluezTransport, Supervisor};

    let transport = BluezTransport::open()
        .await
        .context("Failed to open a BlueZ session; is bluetoothd running?")?;
    let peripheral = config.peripheral.clone();

    let supervisor = Supervisor::new(config, credentials, move || transport.link(&peripheral))
        .context("Failed to start supervisor")?;
    supervisor.run().await;
    Ok(())
}

#[cfg(not(feature = "bluetooth"))]
async fn run(_config: BridgeConfig, _credentials: CredentialStore) -> anyhow::Result<()> {
    anyhow::bail!("pulsebridge was built without the `bluetooth` feature; rebuild with --features bluetooth")
}
