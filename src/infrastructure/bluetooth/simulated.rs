//! In-process BLE adapter.
//!
//! Nothing touches a radio: the host injects advertisements and transport
//! callbacks by hand, and every transport primitive is recorded so it can be
//! inspected afterwards.

use crate::domain::error::AdapterError;
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::adapter::{
    Advertisement, BleAdapter, GattCallback, GattCallbackSink, GattCharacteristic, GattService,
    GattTransport, ScanCallback,
};
use crate::infrastructure::bluetooth::protocol::{
    sig_uuid, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE, PROPERTY_NOTIFY, PROPERTY_READ,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// A primitive issued on a simulated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    DiscoverServices,
    EnableNotifications(Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Disconnect,
    Close,
}

type OpLog = Arc<Mutex<Vec<TransportOp>>>;

/// One connect attempt made through the simulated adapter.
#[derive(Clone)]
pub struct SimulatedLink {
    identity: DeviceIdentity,
    sink: GattCallbackSink,
    ops: OpLog,
}

impl SimulatedLink {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Report `callback` as if the radio stack produced it for this link.
    pub fn deliver(&self, callback: GattCallback) {
        self.sink.deliver(callback);
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct SimulatedTransport {
    ops: OpLog,
    connected: bool,
    open: bool,
}

impl SimulatedTransport {
    fn record(&self, op: TransportOp) -> Result<(), AdapterError> {
        if !self.open {
            return Err(AdapterError::Operation("transport closed".into()));
        }
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).push(op);
        Ok(())
    }
}

impl GattTransport for SimulatedTransport {
    fn discover_services(&mut self) -> Result<(), AdapterError> {
        self.record(TransportOp::DiscoverServices)
    }

    fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), AdapterError> {
        self.record(TransportOp::EnableNotifications(characteristic))
    }

    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<(), AdapterError> {
        self.record(TransportOp::Read(characteristic))
    }

    fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        self.record(TransportOp::Write(characteristic, value.to_vec()))
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.record(TransportOp::Disconnect);
        }
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.record(TransportOp::Close);
            self.open = false;
        }
    }
}

struct SimState {
    supported: bool,
    scan_failure: Option<AdapterError>,
    connect_failure: Option<AdapterError>,
    scan_callback: Option<ScanCallback>,
    scan_starts: usize,
    scan_stops: usize,
    links: Vec<SimulatedLink>,
}

/// [`BleAdapter`] driven entirely by the host.
pub struct SimulatedAdapter {
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                supported: true,
                scan_failure: None,
                connect_failure: None,
                scan_callback: None,
                scan_starts: 0,
                scan_stops: 0,
                links: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_supported(&self, supported: bool) {
        self.lock().supported = supported;
    }

    /// Make the next `start_scan` fail with `error`.
    pub fn fail_next_scan(&self, error: AdapterError) {
        self.lock().scan_failure = Some(error);
    }

    /// Make the next `connect` fail with `error`.
    pub fn fail_next_connect(&self, error: AdapterError) {
        self.lock().connect_failure = Some(error);
    }

    /// Feed an advertisement to the running scan. Returns false when no scan
    /// is running.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let callback = self.lock().scan_callback.clone();
        match callback {
            Some(callback) => {
                callback(advertisement);
                true
            }
            None => {
                debug!("No scan running; advertisement from {} lost", advertisement.address);
                false
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_callback.is_some()
    }

    pub fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.lock().scan_stops
    }

    /// Peripherals connected to, oldest first.
    pub fn connections(&self) -> Vec<DeviceIdentity> {
        self.lock()
            .links
            .iter()
            .map(|link| link.identity.clone())
            .collect()
    }

    pub fn latest_link(&self) -> Option<SimulatedLink> {
        self.lock().links.last().cloned()
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BleAdapter for SimulatedAdapter {
    fn is_supported(&self) -> bool {
        self.lock().supported
    }

    fn start_scan(&self, callback: ScanCallback) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if let Some(error) = state.scan_failure.take() {
            return Err(error);
        }
        if !state.supported {
            return Err(AdapterError::Unavailable);
        }
        state.scan_callback = Some(callback);
        state.scan_starts += 1;
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = self.lock();
        if state.scan_callback.take().is_some() {
            state.scan_stops += 1;
        }
    }

    fn connect(
        &self,
        identity: &DeviceIdentity,
        sink: GattCallbackSink,
    ) -> Result<Box<dyn GattTransport>, AdapterError> {
        let mut state = self.lock();
        if let Some(error) = state.connect_failure.take() {
            return Err(error);
        }
        if !state.supported {
            return Err(AdapterError::Unavailable);
        }

        let ops = OpLog::default();
        state.links.push(SimulatedLink {
            identity: identity.clone(),
            sink,
            ops: ops.clone(),
        });
        Ok(Box::new(SimulatedTransport {
            ops,
            connected: true,
            open: true,
        }))
    }
}

/// Service tree of a typical chest strap: Generic Access, Heart Rate and
/// Battery.
pub fn heart_rate_profile() -> Vec<GattService> {
    vec![
        GattService {
            uuid: sig_uuid(0x1800),
            characteristics: vec![
                GattCharacteristic {
                    uuid: sig_uuid(0x2A00),
                    properties: PROPERTY_READ,
                },
                GattCharacteristic {
                    uuid: sig_uuid(0x2A01),
                    properties: PROPERTY_READ,
                },
            ],
        },
        GattService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                GattCharacteristic {
                    uuid: HEART_RATE_MEASUREMENT,
                    properties: PROPERTY_NOTIFY,
                },
                GattCharacteristic {
                    uuid: sig_uuid(0x2A38),
                    properties: PROPERTY_READ,
                },
            ],
        },
        GattService {
            uuid: sig_uuid(0x180F),
            characteristics: vec![GattCharacteristic {
                uuid: sig_uuid(0x2A19),
                properties: PROPERTY_READ | PROPERTY_NOTIFY,
            }],
        },
    ]
}
