//! BLE Adapter Collaborator
//!
//! The radio is reached only through these traits. Every primitive is
//! non-blocking: it either fails immediately with an [`AdapterError`] or
//! reports completion later through a callback.
//!
//! ```text
//!   BleAdapter ──start_scan──▶ ScanCallback(Advertisement)      (radio thread)
//!        │
//!        └──connect──▶ GattTransport ──ops──▶ GattCallbackSink(GattCallback)
//!                                              tagged with the link generation
//! ```

use crate::domain::error::AdapterError;
use crate::domain::models::{DeviceAddress, DeviceIdentity, DeviceType};
use crate::infrastructure::bluetooth::session::SessionCommand;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Invoked once per received advertisement, from whatever thread the radio
/// stack uses.
pub type ScanCallback = Arc<dyn Fn(Advertisement) + Send + Sync>;

/// One advertisement report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub device_type: DeviceType,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.address.clone(), self.name.clone(), self.device_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Completion status of a GATT procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// ATT / stack specific error code
    Failure(u16),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// Characteristic properties bit field (read, write, notify, ...)
    pub properties: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Asynchronous results of a link, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    LinkStateChanged(LinkState),
    LinkFailed(String),
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    DescriptorWritten {
        characteristic: Uuid,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Where a transport reports its callbacks. Each sink belongs to exactly one
/// link generation; callbacks from a superseded link are recognized by the
/// session and dropped.
#[derive(Debug, Clone)]
pub struct GattCallbackSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl GattCallbackSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a callback to the session. Never blocks; silently dropped once
    /// the session has shut down.
    pub fn deliver(&self, callback: GattCallback) {
        let command = SessionCommand::Callback {
            generation: self.generation,
            callback,
        };
        if self.tx.send(command).is_err() {
            trace!("Session gone; callback for generation {} dropped", self.generation);
        }
    }
}

/// An open (or opening) link to one peripheral.
pub trait GattTransport: Send {
    /// Completion: [`GattCallback::ServicesDiscovered`]
    fn discover_services(&mut self) -> Result<(), AdapterError>;

    /// Enable local notification delivery and write the Client
    /// Characteristic Configuration descriptor.
    /// Completion: [`GattCallback::DescriptorWritten`], then
    /// [`GattCallback::CharacteristicChanged`] per notification.
    fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), AdapterError>;

    /// Completion: [`GattCallback::CharacteristicRead`]
    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<(), AdapterError>;

    fn write_characteristic(&mut self, characteristic: Uuid, value: &[u8])
        -> Result<(), AdapterError>;

    /// Drop the logical link. Must be a no-op when already disconnected.
    fn disconnect(&mut self);

    /// Release the native handle. Must be a no-op when already closed.
    fn close(&mut self);
}

/// Platform adapter access.
pub trait BleAdapter: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Begin an LE scan; `callback` receives every advertisement until
    /// [`BleAdapter::stop_scan`].
    fn start_scan(&self, callback: ScanCallback) -> Result<(), AdapterError>;

    fn stop_scan(&self);

    /// Start connecting. Completion arrives on `sink` as
    /// [`GattCallback::LinkStateChanged`] or [`GattCallback::LinkFailed`].
    fn connect(
        &self,
        identity: &DeviceIdentity,
        sink: GattCallbackSink,
    ) -> Result<Box<dyn GattTransport>, AdapterError>;
}
