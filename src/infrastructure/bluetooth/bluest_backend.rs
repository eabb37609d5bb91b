//! Platform BLE backend built on `bluest`.
//!
//! `bluest` is async; every GATT primitive here spawns a task on the captured
//! runtime and reports its outcome through the link's callback sink, so the
//! [`GattTransport`] calls return immediately. Starting a scan is the
//! exception: it waits for the platform's answer, which needs a
//! multi-threaded runtime.

use crate::domain::error::AdapterError;
use crate::domain::models::{DeviceAddress, DeviceIdentity, DeviceType};
use crate::infrastructure::bluetooth::adapter::{
    Advertisement, BleAdapter, GattCallback, GattCallbackSink, GattCharacteristic, GattService,
    GattStatus, GattTransport, LinkState, ScanCallback,
};
use crate::infrastructure::bluetooth::protocol::{
    PROPERTY_INDICATE, PROPERTY_NOTIFY, PROPERTY_READ, PROPERTY_WRITE,
};
use bluest::{Adapter, AdapterEvent, Characteristic, Device};
use futures_util::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Generic failure status reported for procedures `bluest` rejects.
const GATT_FAILURE: u16 = 0x0101;

type DeviceCache = Arc<Mutex<HashMap<DeviceAddress, Device>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static ADDRESS_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").ok());

/// Pull the hardware address out of a platform device id.
fn extract_address(device_id: &str) -> Option<DeviceAddress> {
    ADDRESS_PATTERN
        .as_ref()?
        .find_iter(device_id)
        .last()
        .and_then(|m| DeviceAddress::parse(&m.as_str().replace('_', ":")).ok())
}

fn device_address(device: &Device) -> Option<DeviceAddress> {
    extract_address(&device.id().to_string())
}

/// Find a peripheral that was not seen by the current scan: already
/// connected devices first, then a dedicated scan until it shows up.
async fn locate(adapter: &Adapter, address: &DeviceAddress) -> Result<Device, AdapterError> {
    let connected = adapter
        .connected_devices()
        .await
        .map_err(|e| AdapterError::Connect(e.to_string()))?;
    if let Some(device) = connected
        .into_iter()
        .find(|d| device_address(d).as_ref() == Some(address))
    {
        return Ok(device);
    }

    info!("Scanning for {}", address);
    let mut scan = adapter
        .scan(&[])
        .await
        .map_err(|e| AdapterError::Connect(e.to_string()))?;
    while let Some(found) = scan.next().await {
        if device_address(&found.device).as_ref() == Some(address) {
            return Ok(found.device);
        }
    }
    Err(AdapterError::Connect(format!("{} not found", address)))
}

/// Run `future` to completion from synchronous code that may itself be on
/// a runtime worker. A current-thread runtime cannot be blocked, so callers
/// there get `None`.
fn block_on<F: Future>(runtime: &Handle, future: F) -> Option<F::Output> {
    match Handle::try_current() {
        Ok(current) => match current.runtime_flavor() {
            RuntimeFlavor::CurrentThread => None,
            _ => Some(tokio::task::block_in_place(|| current.block_on(future))),
        },
        Err(_) => Some(runtime.block_on(future)),
    }
}

/// [`BleAdapter`] over the system's default Bluetooth adapter.
pub struct BluestAdapter {
    adapter: Adapter,
    runtime: Handle,
    devices: DeviceCache,
    available: Arc<AtomicBool>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    watch_task: JoinHandle<()>,
}

impl BluestAdapter {
    /// Open the default adapter and wait until it is powered. Must be called
    /// within a tokio runtime.
    pub async fn new() -> Result<Self, AdapterError> {
        let adapter = Adapter::default().await.ok_or(AdapterError::Unavailable)?;
        adapter
            .wait_available()
            .await
            .map_err(|e| AdapterError::Operation(e.to_string()))?;
        info!("Bluetooth adapter is available");

        let available = Arc::new(AtomicBool::new(true));
        let watch_task = tokio::spawn(watch_availability(adapter.clone(), available.clone()));

        Ok(Self {
            adapter,
            runtime: Handle::current(),
            devices: DeviceCache::default(),
            available,
            scan_task: Mutex::new(None),
            watch_task,
        })
    }
}

/// Track power/permission changes of the adapter.
async fn watch_availability(adapter: Adapter, available: Arc<AtomicBool>) {
    match adapter.is_available().await {
        Ok(now) => available.store(now, Ordering::SeqCst),
        Err(e) => warn!("Adapter availability unknown: {}", e),
    }

    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Adapter events unavailable: {}", e);
            return;
        }
    };
    while let Some(event) = events.next().await {
        match event {
            Ok(AdapterEvent::Available) => {
                info!("Bluetooth adapter became available");
                available.store(true, Ordering::SeqCst);
            }
            Ok(AdapterEvent::Unavailable) => {
                warn!("Bluetooth adapter became unavailable");
                available.store(false, Ordering::SeqCst);
            }
            Err(e) => debug!("Adapter event error: {}", e),
        }
    }
}

impl Drop for BluestAdapter {
    fn drop(&mut self) {
        self.watch_task.abort();
        self.stop_scan();
    }
}

impl BleAdapter for BluestAdapter {
    fn is_supported(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Blocks until the platform has accepted or refused the scan, so the
    /// outcome is known before this returns.
    fn start_scan(&self, callback: ScanCallback) -> Result<(), AdapterError> {
        if !self.is_supported() {
            return Err(AdapterError::Unavailable);
        }

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let (started_tx, started_rx) = oneshot::channel::<Result<(), AdapterError>>();

        let task = self.runtime.spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => {
                    let _ = started_tx.send(Ok(()));
                    scan
                }
                Err(e) => {
                    error!("LE scan failed: {}", e);
                    let _ = started_tx.send(Err(AdapterError::ScanStart(e.to_string())));
                    return;
                }
            };

            while let Some(found) = scan.next().await {
                let id = found.device.id().to_string();
                let Some(address) = extract_address(&id) else {
                    debug!("No hardware address in device id {}", id);
                    continue;
                };
                let name = found
                    .adv_data
                    .local_name
                    .clone()
                    .or_else(|| found.device.name().ok());

                lock(&devices).insert(address.clone(), found.device.clone());
                callback(Advertisement {
                    address,
                    name,
                    device_type: DeviceType::Unknown,
                    rssi: found.rssi,
                });
            }
            debug!("Scan stream ended");
        });

        let outcome = match block_on(&self.runtime, started_rx) {
            Some(Ok(started)) => started,
            Some(Err(_)) => Err(AdapterError::ScanStart(
                "scan task ended before starting".into(),
            )),
            None => Err(AdapterError::ScanStart(
                "a multi-threaded tokio runtime is required".into(),
            )),
        };
        if outcome.is_err() {
            task.abort();
            return outcome;
        }

        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
    }

    fn connect(
        &self,
        identity: &DeviceIdentity,
        sink: GattCallbackSink,
    ) -> Result<Box<dyn GattTransport>, AdapterError> {
        let cached = lock(&self.devices).get(&identity.address).cloned();
        let slot: Arc<Mutex<Option<Device>>> = Arc::default();

        let adapter = self.adapter.clone();
        let address = identity.address.clone();
        let link_sink = sink.clone();
        let device_slot = slot.clone();
        let connect_task = self.runtime.spawn(async move {
            let device = match cached {
                Some(device) => device,
                None => match locate(&adapter, &address).await {
                    Ok(device) => device,
                    Err(e) => {
                        link_sink.deliver(GattCallback::LinkFailed(e.to_string()));
                        return;
                    }
                },
            };

            match adapter.connect_device(&device).await {
                Ok(()) => {
                    *lock(&device_slot) = Some(device);
                    link_sink.deliver(GattCallback::LinkStateChanged(LinkState::Connected));
                }
                Err(e) => link_sink.deliver(GattCallback::LinkFailed(e.to_string())),
            }
        });

        Ok(Box::new(BluestTransport {
            adapter: self.adapter.clone(),
            runtime: self.runtime.clone(),
            sink,
            device: slot,
            characteristics: Arc::default(),
            tasks: vec![connect_task],
            connected: true,
            closed: false,
        }))
    }
}

struct BluestTransport {
    adapter: Adapter,
    runtime: Handle,
    sink: GattCallbackSink,
    device: Arc<Mutex<Option<Device>>>,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    tasks: Vec<JoinHandle<()>>,
    connected: bool,
    closed: bool,
}

impl BluestTransport {
    fn device(&self) -> Result<Device, AdapterError> {
        lock(&self.device)
            .clone()
            .ok_or_else(|| AdapterError::Operation("link not established".into()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, AdapterError> {
        lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or_else(|| AdapterError::Operation(format!("characteristic {} not discovered", uuid)))
    }

    fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(self.runtime.spawn(future));
    }
}

async fn properties_of(characteristic: &Characteristic) -> u8 {
    match characteristic.properties().await {
        Ok(props) => {
            let mut bits = 0;
            if props.read {
                bits |= PROPERTY_READ;
            }
            if props.write {
                bits |= PROPERTY_WRITE;
            }
            if props.notify {
                bits |= PROPERTY_NOTIFY;
            }
            if props.indicate {
                bits |= PROPERTY_INDICATE;
            }
            bits
        }
        Err(e) => {
            debug!("Properties of {} unavailable: {}", characteristic.uuid(), e);
            0
        }
    }
}

impl GattTransport for BluestTransport {
    fn discover_services(&mut self) -> Result<(), AdapterError> {
        let device = self.device()?;
        let sink = self.sink.clone();
        let cache = self.characteristics.clone();

        self.spawn(async move {
            let services = match device.discover_services().await {
                Ok(services) => services,
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    sink.deliver(GattCallback::ServicesDiscovered {
                        status: GattStatus::Failure(GATT_FAILURE),
                        services: Vec::new(),
                    });
                    return;
                }
            };

            let mut tree = Vec::with_capacity(services.len());
            for service in services {
                let characteristics = match service.discover_characteristics().await {
                    Ok(characteristics) => characteristics,
                    Err(e) => {
                        warn!("Characteristics of {} unavailable: {}", service.uuid(), e);
                        Vec::new()
                    }
                };

                let mut entries = Vec::with_capacity(characteristics.len());
                for characteristic in characteristics {
                    entries.push(GattCharacteristic {
                        uuid: characteristic.uuid(),
                        properties: properties_of(&characteristic).await,
                    });
                    lock(&cache).insert(characteristic.uuid(), characteristic);
                }
                tree.push(GattService {
                    uuid: service.uuid(),
                    characteristics: entries,
                });
            }

            sink.deliver(GattCallback::ServicesDiscovered {
                status: GattStatus::Success,
                services: tree,
            });
        });
        Ok(())
    }

    fn enable_notifications(&mut self, characteristic: Uuid) -> Result<(), AdapterError> {
        let target = self.characteristic(characteristic)?;
        let sink = self.sink.clone();

        self.spawn(async move {
            let mut notifications = match target.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Enabling notifications on {} failed: {}", characteristic, e);
                    sink.deliver(GattCallback::DescriptorWritten {
                        characteristic,
                        status: GattStatus::Failure(GATT_FAILURE),
                    });
                    return;
                }
            };
            sink.deliver(GattCallback::DescriptorWritten {
                characteristic,
                status: GattStatus::Success,
            });

            while let Some(item) = notifications.next().await {
                match item {
                    Ok(value) => sink.deliver(GattCallback::CharacteristicChanged {
                        characteristic,
                        value,
                    }),
                    Err(e) => {
                        warn!("Notification stream error: {}", e);
                        break;
                    }
                }
            }

            info!("Notification stream ended");
            sink.deliver(GattCallback::LinkStateChanged(LinkState::Disconnected));
        });
        Ok(())
    }

    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<(), AdapterError> {
        let target = self.characteristic(characteristic)?;
        let sink = self.sink.clone();

        self.spawn(async move {
            let callback = match target.read().await {
                Ok(value) => GattCallback::CharacteristicRead {
                    characteristic,
                    status: GattStatus::Success,
                    value,
                },
                Err(e) => {
                    warn!("Read of {} failed: {}", characteristic, e);
                    GattCallback::CharacteristicRead {
                        characteristic,
                        status: GattStatus::Failure(GATT_FAILURE),
                        value: Vec::new(),
                    }
                }
            };
            sink.deliver(callback);
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        let target = self.characteristic(characteristic)?;
        let value = value.to_vec();

        self.spawn(async move {
            if let Err(e) = target.write(&value).await {
                warn!("Write to {} failed: {}", characteristic, e);
            }
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Ok(device) = self.device() {
            let adapter = self.adapter.clone();
            self.runtime.spawn(async move {
                if let Err(e) = adapter.disconnect_device(&device).await {
                    warn!("Disconnect of {} failed: {}", device.id(), e);
                }
            });
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        lock(&self.characteristics).clear();
        lock(&self.device).take();
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.disconnect();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_outside_runtime_uses_captured_handle() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        assert_eq!(block_on(runtime.handle(), async { 7 }), Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_from_worker_thread() {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(42);
        });
        assert_eq!(block_on(&Handle::current(), rx), Some(Ok(42)));
    }

    #[tokio::test]
    async fn test_block_on_refuses_current_thread_runtime() {
        assert_eq!(block_on(&Handle::current(), async { 1 }), None);
    }

    #[test]
    fn test_extract_address_from_platform_ids() {
        assert_eq!(
            extract_address("BluetoothLE#BluetoothLEe4:aa:ea:12:34:56-c0:ff:ee:00:00:01"),
            Some(DeviceAddress::parse("C0:FF:EE:00:00:01").unwrap())
        );
        assert_eq!(
            extract_address("/org/bluez/hci0/dev_C0_FF_EE_00_00_01"),
            Some(DeviceAddress::parse("C0:FF:EE:00:00:01").unwrap())
        );
        assert_eq!(extract_address("4F2B1C3A-0000-1000-8000-00805F9B34FB"), None);
    }
}
