//! GATT Session Module
//!
//! Owns at most one link to a peripheral and drives it from connect request
//! to decoded heart rate notifications.
//!
//! ```text
//!  Idle/Scanning/Disconnected ──Connect──▶ Connecting ──link up──▶ ServiceDiscovery
//!                                             │                       │ HRM found,
//!                                             │ link failed           ▼ notify enabled
//!                                             ▼                    Subscribing ──▶ Active
//!                                        Disconnected ◀──link lost────────────────┘
//! ```
//!
//! All transitions run on a single actor task fed by one command queue, so a
//! transition always completes before the next one starts. Transport
//! callbacks are queued with the generation of the link that produced them;
//! anything from an earlier generation is dropped.

use crate::domain::error::HeartLinkError;
use crate::domain::heart_rate::decode_measurement;
use crate::domain::models::{
    ConnectRequested, Connected, DeviceIdentity, Disconnected, SessionState,
};
use crate::infrastructure::bluetooth::adapter::{
    BleAdapter, GattCallback, GattCallbackSink, GattService, GattStatus, GattTransport, LinkState,
};
use crate::infrastructure::bluetooth::protocol::{GattNameLookup, HEART_RATE_MEASUREMENT};
use crate::infrastructure::bluetooth::scanner::Scanner;
use crate::infrastructure::event_bus::{handler, EventBus, Handler};
use crate::infrastructure::storage::ConnectionMemory;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Everything the session actor reacts to.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Connect(DeviceIdentity),
    Disconnect,
    MarkScanning,
    ScanEnded,
    Callback {
        generation: u64,
        callback: GattCallback,
    },
    Shutdown,
}

/// Observable session status. `peer` is the peripheral of the current or
/// most recent link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub peer: Option<DeviceIdentity>,
}

/// Handle to the session actor.
pub struct GattSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    bus: Arc<EventBus>,
    connect_handler: Handler<ConnectRequested>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GattSession {
    /// Start the actor on the current tokio runtime and subscribe it to
    /// [`ConnectRequested`].
    pub fn spawn(
        adapter: Arc<dyn BleAdapter>,
        scanner: Arc<Scanner>,
        memory: Arc<ConnectionMemory>,
        bus: Arc<EventBus>,
        names: Arc<dyn GattNameLookup>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let actor = SessionActor {
            adapter,
            scanner,
            memory,
            bus: bus.clone(),
            names,
            status: status_tx,
            sinks: tx.downgrade(),
            link: None,
            generation: 0,
        };
        let scan_events = tx.downgrade();
        actor.scanner.set_stop_listener(Box::new(move || {
            if let Some(commands) = scan_events.upgrade() {
                let _ = commands.send(SessionCommand::ScanEnded);
            }
        }));
        let task = tokio::spawn(actor.run(rx));

        let requests = tx.clone();
        let connect_handler = handler(move |e: &ConnectRequested| {
            if requests.send(SessionCommand::Connect(e.0.clone())).is_err() {
                debug!("Session stopped; connect request for {} ignored", e.0.address);
            }
        });
        bus.subscribe(connect_handler.clone());

        Self {
            commands: tx,
            status: status_rx,
            bus,
            connect_handler,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn peer(&self) -> Option<DeviceIdentity> {
        self.status.borrow().peer.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Same as publishing [`ConnectRequested`], without going through the bus.
    pub fn connect(&self, identity: DeviceIdentity) {
        self.send(SessionCommand::Connect(identity));
    }

    pub fn disconnect(&self) {
        self.send(SessionCommand::Disconnect);
    }

    /// Reflect that discovery is running while no link is open.
    pub(crate) fn mark_scanning(&self) {
        self.send(SessionCommand::MarkScanning);
    }

    /// Tear down any link, stop the actor and wait for it to finish.
    pub async fn shutdown(&self) {
        self.bus.unsubscribe(&self.connect_handler);
        self.send(SessionCommand::Shutdown);

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("GATT session task failed: {}", e);
            }
        }
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!("GATT session already stopped");
        }
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.connect_handler);
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

struct Link {
    generation: u64,
    identity: DeviceIdentity,
    transport: Box<dyn GattTransport>,
}

impl Link {
    fn release(mut self) {
        debug!("Releasing link generation {} to {}", self.generation, self.identity.address);
        self.transport.disconnect();
        self.transport.close();
    }
}

struct SessionActor {
    adapter: Arc<dyn BleAdapter>,
    scanner: Arc<Scanner>,
    memory: Arc<ConnectionMemory>,
    bus: Arc<EventBus>,
    names: Arc<dyn GattNameLookup>,
    status: watch::Sender<SessionStatus>,
    // Weak so the queue closes once every handle is gone
    sinks: mpsc::WeakUnboundedSender<SessionCommand>,
    link: Option<Link>,
    generation: u64,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.recv().await {
            trace!("Session command: {:?}", command);
            match command {
                SessionCommand::Connect(identity) => self.connect(identity),
                SessionCommand::Disconnect => self.disconnect(),
                SessionCommand::MarkScanning => {
                    if !self.state().has_link() && self.scanner.is_scanning() {
                        self.set_state(SessionState::Scanning);
                    }
                }
                SessionCommand::ScanEnded => {
                    if self.state() == SessionState::Scanning {
                        self.set_state(SessionState::Idle);
                    }
                }
                SessionCommand::Callback {
                    generation,
                    callback,
                } => self.on_callback(generation, callback),
                SessionCommand::Shutdown => break,
            }
        }

        if self.link.is_some() {
            self.teardown("session shutting down");
        }
        debug!("GATT session stopped");
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            debug!("Session {:?} -> {:?}", status.state, state);
            status.state = state;
            true
        });
    }

    fn connect(&mut self, identity: DeviceIdentity) {
        if !self.adapter.is_supported() {
            error!(
                "Cannot connect to {}: {}",
                identity.address,
                HeartLinkError::AdapterUnavailable
            );
            return;
        }

        if let Some(current) = self.link.as_ref().map(|link| link.identity.address.clone()) {
            info!("Replacing link to {} with {}", current, identity.address);
            self.teardown("superseded by new connect request");
        }

        self.scanner.stop_scan("connecting");

        // Remembered before the attempt so an interrupted connect still
        // reconnects on the next start.
        if let Err(e) = self.memory.remember(&identity) {
            warn!(
                "{}; connecting to {} anyway",
                HeartLinkError::Persistence(e),
                identity.address
            );
        }

        let Some(commands) = self.sinks.upgrade() else {
            debug!("Session queue closed; not connecting");
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        info!("Connecting to {} (link generation {})", identity, generation);

        // Callbacks only queue up behind this command, so the state can be
        // published once the attempt is underway.
        let sink = GattCallbackSink::new(generation, commands);
        let (state, link) = match self.adapter.connect(&identity, sink) {
            Ok(transport) => (SessionState::Connecting, Some(transport)),
            Err(e) => {
                error!("{}", HeartLinkError::from(e));
                (SessionState::Disconnected, None)
            }
        };

        self.status.send_modify(|status| {
            debug!("Session {:?} -> {:?}", status.state, state);
            status.state = state;
            status.peer = Some(identity.clone());
        });

        match link {
            Some(transport) => {
                self.link = Some(Link {
                    generation,
                    identity,
                    transport,
                });
            }
            None => self.bus.publish(Disconnected(identity)),
        }
    }

    fn disconnect(&mut self) {
        if self.link.is_some() {
            self.teardown("disconnect requested");
        } else {
            debug!("Disconnect requested with no open link");
        }
    }

    /// Release the current link, if any, and report it as gone.
    fn teardown(&mut self, reason: &str) {
        let Some(link) = self.link.take() else {
            return;
        };
        info!("Disconnecting from {}: {}", link.identity.address, reason);
        let identity = link.identity.clone();
        link.release();
        self.set_state(SessionState::Disconnected);
        self.bus.publish(Disconnected(identity));
    }

    fn fail_link(&mut self, error: HeartLinkError) {
        error!("{}", error);
        self.teardown("link failed");
    }

    fn on_callback(&mut self, generation: u64, callback: GattCallback) {
        let current = self.link.as_ref().map(|link| link.generation);
        if current != Some(generation) {
            debug!(
                "Dropping callback from stale link generation {} (current {:?}): {:?}",
                generation, current, callback
            );
            return;
        }

        match callback {
            GattCallback::LinkStateChanged(LinkState::Connected) => self.on_link_up(),
            GattCallback::LinkStateChanged(LinkState::Disconnected) => {
                info!("Peer disconnected");
                self.teardown("link lost");
            }
            GattCallback::LinkFailed(reason) => {
                self.fail_link(HeartLinkError::LinkFailure(reason));
            }
            GattCallback::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            GattCallback::DescriptorWritten {
                characteristic,
                status,
            } => {
                if status.is_success() {
                    debug!("Notifications confirmed for {}", self.names.lookup(&characteristic));
                } else {
                    warn!(
                        "Descriptor write for {} failed: {:?}",
                        self.names.lookup(&characteristic),
                        status
                    );
                }
            }
            GattCallback::CharacteristicRead {
                characteristic,
                status,
                value,
            } => {
                if !status.is_success() {
                    warn!(
                        "Read of {} failed: {:?}",
                        self.names.lookup(&characteristic),
                        status
                    );
                } else if matches!(
                    self.state(),
                    SessionState::ServiceDiscovery | SessionState::Subscribing | SessionState::Active
                ) {
                    self.on_value(characteristic, &value);
                }
            }
            GattCallback::CharacteristicChanged {
                characteristic,
                value,
            } => {
                if matches!(self.state(), SessionState::Subscribing | SessionState::Active) {
                    self.on_value(characteristic, &value);
                } else {
                    debug!(
                        "Ignoring change of {} in state {:?}",
                        characteristic,
                        self.state()
                    );
                }
            }
        }
    }

    fn on_link_up(&mut self) {
        if self.state() != SessionState::Connecting {
            debug!("Link-up ignored in state {:?}", self.state());
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        info!("Connected to {}", link.identity);
        let identity = link.identity.clone();
        let discovery = link.transport.discover_services();

        self.set_state(SessionState::ServiceDiscovery);
        self.bus.publish(Connected(identity));

        if let Err(e) = discovery {
            self.fail_link(HeartLinkError::ServiceDiscoveryFailure(e.to_string()));
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, services: Vec<GattService>) {
        if self.state() != SessionState::ServiceDiscovery {
            debug!("Service list ignored in state {:?}", self.state());
            return;
        }
        if let GattStatus::Failure(code) = status {
            self.fail_link(HeartLinkError::ServiceDiscoveryFailure(format!(
                "status {}",
                code
            )));
            return;
        }

        let Some(target) = self.find_measurement(&services) else {
            warn!("No Heart Rate Measurement characteristic found; staying idle on this link");
            return;
        };

        self.set_state(SessionState::Subscribing);
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.transport.enable_notifications(target) {
            Ok(()) => {
                info!("Subscribed to heart rate notifications from {}", link.identity.address);
                self.set_state(SessionState::Active);
            }
            Err(e) => self.fail_link(HeartLinkError::LinkFailure(format!(
                "enabling notifications: {}",
                e
            ))),
        }
    }

    /// Walk the service tree once, logging what is there; stop at the first
    /// Heart Rate Measurement characteristic.
    fn find_measurement(&self, services: &[GattService]) -> Option<Uuid> {
        for service in services {
            debug!("Service: {} ({})", self.names.lookup(&service.uuid), service.uuid);
            for characteristic in &service.characteristics {
                debug!(
                    "  Characteristic: {} ({}) props 0x{:02X}",
                    self.names.lookup(&characteristic.uuid),
                    characteristic.uuid,
                    characteristic.properties
                );
                if characteristic.uuid == HEART_RATE_MEASUREMENT {
                    return Some(characteristic.uuid);
                }
            }
        }
        None
    }

    fn on_value(&self, characteristic: Uuid, value: &[u8]) {
        if characteristic != HEART_RATE_MEASUREMENT {
            debug!(
                "{} ({}) value: {:02X?}",
                self.names.lookup(&characteristic),
                characteristic,
                value
            );
            return;
        }

        // Flags are the record's own first byte, not the characteristic's
        // GATT property bits.
        match decode_measurement(value) {
            Ok(reading) => {
                debug!("Heart rate: {} bpm ({})", reading.bpm, reading.format);
                self.bus.publish(reading);
            }
            Err(e) => warn!("{}; payload {:02X?} dropped", HeartLinkError::Decode(e), value),
        }
    }
}
