//! Host application that exercises `modbus-ble-core` end to end over a real BLE
//! adapter: scans for a device, connects, lets the client auto-detect encryption,
//! and runs a register scan to completion.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use clap::Parser;
use modbus_ble_core::ble::PeripheralLink;
use modbus_ble_core::{Client, InMemoryResultStore, ResultStore, ScanRange, Scanner};
use tracing::{info, warn};

use config::Settings;

#[derive(Parser)]
#[command(name = "modbus-ble-cli")]
#[command(about = "Discover readable MODBUS-over-BLE registers on a device", long_about = None)]
struct Cli {
    /// Substring match against the advertised device name. Overrides
    /// MODBUS_BLE_DEVICE_NAME_FILTER if given.
    #[arg(long)]
    device_name: Option<String>,

    /// How long to scan for BLE advertisements before giving up.
    #[arg(long)]
    scan_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load().context("failed to load configuration")?;
    if let Some(name) = cli.device_name {
        settings.device_name_filter = Some(name);
    }
    if let Some(seconds) = cli.scan_seconds {
        settings.adapter_scan_seconds = seconds;
    }

    info!("==============================================");
    info!("   modbus-ble-cli v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");

    let key_bundle = settings.key_bundle()?;
    if key_bundle.is_some() {
        info!("key bundle configured, client will attempt the encrypted handshake");
    } else {
        info!("no key bundle configured, client will use plaintext framing");
    }

    let peripheral = find_peripheral(&settings).await?;
    let device_name = peripheral
        .properties()
        .await
        .ok()
        .flatten()
        .and_then(|p| p.local_name)
        .unwrap_or_else(|| "<unnamed>".to_string());
    info!(name = %device_name, "connecting to device");

    let link = Arc::new(PeripheralLink::new(peripheral, device_name.clone()));
    let client = Client::new(link, key_bundle);

    client
        .connect(Some(settings.response_timeout()))
        .await
        .context("failed to connect to device")?;
    info!(encrypted = client.is_encrypted().await, "connected");

    let store = InMemoryResultStore::shared();
    let (mut scanner, mut progress_rx) = Scanner::new(
        client.clone(),
        client.id(),
        vec![ScanRange {
            start: settings.scan_start,
            end: settings.scan_end,
        }],
        store.clone() as Arc<dyn ResultStore>,
    );

    let progress_task = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            info!(
                scanned = progress.scanned,
                total = progress.total,
                "scan progress"
            );
        }
    });

    scanner.run(None).await.context("scan failed")?;
    progress_task.abort();

    print_summary(&store, &client.id()).await;

    client.disconnect().await;
    Ok(())
}

async fn find_peripheral(settings: &Settings) -> Result<btleplug::platform::Peripheral> {
    let manager = Manager::new().await.context("failed to initialize BLE manager")?;
    let adapters = manager
        .adapters()
        .await
        .context("failed to enumerate BLE adapters")?;
    let central = adapters
        .into_iter()
        .next()
        .context("no BLE adapter found")?;

    central
        .start_scan(ScanFilter::default())
        .await
        .context("failed to start BLE scan")?;
    info!(
        seconds = settings.adapter_scan_seconds,
        "scanning for devices"
    );
    tokio::time::sleep(Duration::from_secs(settings.adapter_scan_seconds)).await;
    let _ = central.stop_scan().await;

    let peripherals = central
        .peripherals()
        .await
        .context("failed to list discovered peripherals")?;

    for peripheral in peripherals {
        let Some(props) = peripheral.properties().await.ok().flatten() else {
            continue;
        };
        let Some(name) = props.local_name else {
            continue;
        };
        match &settings.device_name_filter {
            Some(filter) if name.contains(filter.as_str()) => return Ok(peripheral),
            None => {
                warn!(name = %name, "no device_name_filter configured, using first advertised peripheral");
                return Ok(peripheral);
            }
            _ => continue,
        }
    }

    anyhow::bail!("no matching BLE device found during scan")
}

async fn print_summary(store: &InMemoryResultStore, device_id: &str) {
    let results = store.all(device_id).await;
    let readable = results.iter().filter(|(_, r)| r.readable).count();
    info!(
        readable,
        unreadable = results.len() - readable,
        "scan complete"
    );
    for (register, result) in results {
        if let Some(value) = result.value {
            info!(
                register,
                value = %hex::encode(value),
                "readable register"
            );
        }
    }
}
