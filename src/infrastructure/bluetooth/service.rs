//! Heart Rate Service Module
//!
//! Wires discovery, the GATT session and connection memory together and
//! decides what happens on start: reconnect to the remembered peripheral, or
//! scan for a new one.

use crate::domain::error::HeartLinkError;
use crate::domain::models::{ConnectRequested, DeviceIdentity};
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::protocol::{GattNameLookup, StandardGattNames};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::scanner::{ScanConfig, Scanner};
use crate::infrastructure::bluetooth::session::GattSession;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::storage::{ConnectionMemory, KeyValueStore};
use crate::infrastructure::timer::Scheduler;
use std::sync::Arc;
use tracing::{error, info};

/// What [`HeartRateService::start`] decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Reconnecting(DeviceIdentity),
    Scanning,
}

/// Main service coordinating discovery and the heart rate link
pub struct HeartRateService {
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    scanner: Arc<Scanner>,
    memory: Arc<ConnectionMemory>,
    session: GattSession,
}

impl HeartRateService {
    /// Build the service. Must be called within a tokio runtime.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        store: Arc<dyn KeyValueStore>,
        scheduler: Arc<dyn Scheduler>,
        config: ScanConfig,
    ) -> Self {
        Self::with_names(adapter, store, scheduler, config, Arc::new(StandardGattNames))
    }

    pub fn with_names(
        adapter: Arc<dyn BleAdapter>,
        store: Arc<dyn KeyValueStore>,
        scheduler: Arc<dyn Scheduler>,
        config: ScanConfig,
        names: Arc<dyn GattNameLookup>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let memory = Arc::new(ConnectionMemory::new(store));
        let scanner = Arc::new(Scanner::new(
            adapter.clone(),
            registry.clone(),
            bus.clone(),
            scheduler,
            config,
        ));
        let session = GattSession::spawn(
            adapter,
            scanner.clone(),
            memory.clone(),
            bus.clone(),
            names,
        );

        Self {
            bus,
            registry,
            scanner,
            memory,
            session,
        }
    }

    /// Reconnect to the remembered peripheral if there is one, otherwise
    /// start discovery.
    pub fn start(&self) -> Result<StartOutcome, HeartLinkError> {
        if let Some(identity) = self.memory.recall() {
            info!("Reconnecting to remembered peripheral {}", identity);
            self.scanner.stop_scan("reconnecting to remembered peripheral");
            self.bus.publish(ConnectRequested(identity.clone()));
            return Ok(StartOutcome::Reconnecting(identity));
        }

        self.scanner.start_scan()?;
        self.session.mark_scanning();
        Ok(StartOutcome::Scanning)
    }

    /// Ask the session to connect to `identity`.
    pub fn connect(&self, identity: DeviceIdentity) {
        self.bus.publish(ConnectRequested(identity));
    }

    /// Drop the remembered peripheral so the next start scans again.
    pub fn forget(&self) -> Result<(), HeartLinkError> {
        self.memory.forget()?;
        Ok(())
    }

    /// Stop scanning, drop any link and empty the registry.
    pub fn stop(&self) {
        info!("Stopping heart rate service");
        self.scanner.stop_scan("service stopped");
        self.session.disconnect();
        self.registry.clear();
    }

    /// [`stop`](Self::stop), then wait for the session to finish and for
    /// already published events to be delivered.
    pub async fn shutdown(&self) {
        self.stop();
        self.session.shutdown().await;

        // Flushing blocks until the delivery thread catches up
        let bus = self.bus.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || bus.flush()).await {
            error!("Event bus flush failed: {}", e);
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn session(&self) -> &GattSession {
        &self.session
    }

    pub fn memory(&self) -> &Arc<ConnectionMemory> {
        &self.memory
    }
}
