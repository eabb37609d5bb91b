use anyhow::{Context, Result};
use clap::Parser;
use heart_link::domain::heart_rate::HeartRateReading;
use heart_link::domain::models::{ConnectRequested, Connected, DeviceFound, Disconnected};
use heart_link::domain::settings::SettingsService;
use heart_link::infrastructure::bluetooth::adapter::BleAdapter;
use heart_link::infrastructure::bluetooth::scanner::ScanConfig;
use heart_link::infrastructure::bluetooth::{HeartRateService, StartOutcome};
use heart_link::infrastructure::event_bus::handler;
use heart_link::infrastructure::logging::init_logger;
use heart_link::infrastructure::storage::JsonFileStore;
use heart_link::infrastructure::timer::TokioScheduler;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Stream heart rate readings from a Bluetooth LE sensor
#[derive(Parser, Debug)]
#[command(name = "heart-link", version, about)]
struct Cli {
    /// Connect to the first discovered device whose name contains this text
    #[arg(short, long)]
    name: Option<String>,

    /// Forget the remembered device and scan instead of reconnecting
    #[arg(long)]
    forget: bool,

    /// Settings file (default: per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[cfg(feature = "bluest")]
async fn open_adapter() -> Result<Arc<dyn BleAdapter>> {
    use heart_link::infrastructure::bluetooth::bluest_backend::BluestAdapter;

    let adapter = BluestAdapter::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    Ok(Arc::new(adapter))
}

#[cfg(not(feature = "bluest"))]
async fn open_adapter() -> Result<Arc<dyn BleAdapter>> {
    anyhow::bail!("No Bluetooth backend compiled in; rebuild with `--features bluest`")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_service = match &cli.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Settings loaded from {:?}", settings_service.path());

    let store_dir = match settings_service.path().parent() {
        Some(dir) => dir.to_path_buf(),
        None => SettingsService::config_dir()?,
    };
    let store = Arc::new(JsonFileStore::new(store_dir.join(&settings.store_file)));

    let adapter = open_adapter().await?;
    let service = HeartRateService::new(
        adapter,
        store,
        Arc::new(TokioScheduler::current()),
        ScanConfig::from(&settings),
    );

    if cli.forget {
        service.forget().context("Failed to forget remembered device")?;
    }

    let bus = service.bus();
    bus.subscribe(handler(|r: &HeartRateReading| {
        println!("{} bpm ({})", r.bpm, r.format);
    }));
    bus.subscribe(handler(|e: &Connected| {
        println!("Connected to {}", e.0);
    }));
    bus.subscribe(handler(|e: &Disconnected| {
        println!("Disconnected from {}", e.0);
    }));

    let filter = cli.name.as_ref().map(|n| n.to_lowercase());
    let requested = AtomicBool::new(false);
    let weak_bus = Arc::downgrade(bus);
    bus.subscribe(handler(move |e: &DeviceFound| {
        println!("Found {}", e.0);
        let Some(filter) = &filter else {
            return;
        };
        let matches = e
            .0
            .name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(filter));
        if matches && !requested.swap(true, Ordering::SeqCst) {
            if let Some(bus) = weak_bus.upgrade() {
                bus.publish(ConnectRequested(e.0.clone()));
            }
        }
    }));

    match service.start()? {
        StartOutcome::Reconnecting(identity) => {
            println!("Reconnecting to {}", identity.display_name())
        }
        StartOutcome::Scanning => println!(
            "Scanning for {}s{}",
            settings.scan_duration_secs,
            if cli.name.is_none() {
                " (pass --name to connect)"
            } else {
                ""
            }
        ),
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted; shutting down");
    service.shutdown().await;
    Ok(())
}
