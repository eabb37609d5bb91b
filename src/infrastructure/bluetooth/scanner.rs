//! BLE Scanner Module
//!
//! Drives the adapter's LE scan for a bounded window, keeps the discovery
//! registry, and publishes one [`DeviceFound`] per new address.
//!
//! Two timers are armed when a scan starts:
//! - the scan stop, after `scan_duration`;
//! - the registry reset, after `registry_reset`, which empties the registry
//!   only if no scan is running when it fires.
//!
//! Starting while a scan is already running is a no-op and does not extend
//! the running scan's stop timer.
//!
//! Whoever tracks scan state elsewhere can register a stop listener; it runs
//! once per scan that actually ends, whatever ended it.

use crate::domain::error::{AdapterError, HeartLinkError};
use crate::domain::models::DeviceFound;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{Advertisement, BleAdapter, ScanCallback};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::timer::{Scheduler, TimerHandle};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub scan_duration: Duration,
    pub registry_reset: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(45),
            registry_reset: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&Settings> for ScanConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            scan_duration: settings.scan_duration(),
            registry_reset: settings.registry_reset(),
        }
    }
}

/// Called when a running scan ends.
pub type StopListener = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ScanState {
    scanning: bool,
    // Bumped on every start so a stale stop timer can tell it is stale
    window: u64,
    stop_timer: Option<TimerHandle>,
}

struct ScannerInner {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    scheduler: Arc<dyn Scheduler>,
    config: ScanConfig,
    state: Mutex<ScanState>,
    stop_listener: Mutex<Option<StopListener>>,
}

/// BLE scanner for discovering LE peripherals
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

impl Scanner {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        scheduler: Arc<dyn Scheduler>,
        config: ScanConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                adapter,
                registry,
                bus,
                scheduler,
                config,
                state: Mutex::new(ScanState::default()),
                stop_listener: Mutex::new(None),
            }),
        }
    }

    /// Start scanning if not already running.
    ///
    /// Adapter failures are returned as-is and leave the scanner stopped.
    pub fn start_scan(&self) -> Result<(), HeartLinkError> {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if state.scanning {
            debug!("Scan already running; start ignored");
            return Ok(());
        }

        if !inner.adapter.is_supported() {
            warn!("Cannot scan: Bluetooth LE adapter unavailable");
            return Err(HeartLinkError::AdapterUnavailable);
        }

        let weak = Arc::downgrade(inner);
        let callback: ScanCallback = Arc::new(move |advertisement| {
            if let Some(inner) = weak.upgrade() {
                inner.on_advertisement(advertisement);
            }
        });

        inner.adapter.start_scan(callback).map_err(|e| match e {
            AdapterError::Unavailable => HeartLinkError::AdapterUnavailable,
            other => HeartLinkError::ScanStartFailure(other.to_string()),
        })?;

        state.scanning = true;
        state.window += 1;
        let window = state.window;
        info!(
            "Scanning for LE devices ({}s, window {})",
            inner.config.scan_duration.as_secs(),
            window
        );

        let weak = Arc::downgrade(inner);
        state.stop_timer = Some(inner.scheduler.schedule(
            inner.config.scan_duration,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_scan_timeout(window);
                }
            }),
        ));

        let weak: Weak<ScannerInner> = Arc::downgrade(inner);
        inner.scheduler.schedule(
            inner.config.registry_reset,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_registry_reset();
                }
            }),
        );

        Ok(())
    }

    /// Stop scanning. Safe to call at any time, any number of times.
    pub fn stop_scan(&self, reason: &str) {
        let mut state = self.inner.lock_state();
        self.inner.stop_locked(&mut state, reason);
    }

    /// Replace the listener told about every scan that ends.
    pub fn set_stop_listener(&self, listener: StopListener) {
        *self
            .inner
            .stop_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock_state().scanning
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> ScanConfig {
        self.inner.config
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_scan("scanner dropped");
    }
}

impl ScannerInner {
    fn lock_state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_locked(&self, state: &mut ScanState, reason: &str) {
        if let Some(timer) = state.stop_timer.take() {
            self.scheduler.cancel(&timer);
        }
        if !state.scanning {
            debug!("Stop requested ({}) but no scan running", reason);
            return;
        }
        state.scanning = false;
        self.adapter.stop_scan();
        info!("Scan stopped: {}", reason);

        let listener = self.stop_listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = listener.as_ref() {
            listener();
        }
    }

    fn on_scan_timeout(&self, window: u64) {
        let mut state = self.lock_state();
        if state.window != window {
            debug!("Stale scan timer for window {} ignored", window);
            return;
        }
        // The timer has fired; nothing left to cancel
        state.stop_timer = None;
        self.stop_locked(&mut state, "scan period elapsed");
    }

    fn on_registry_reset(&self) {
        if self.lock_state().scanning {
            debug!("Registry reset skipped; scan in progress");
            return;
        }
        info!("Discovery window closed; clearing {} devices", self.registry.len());
        self.registry.clear();
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        if !advertisement.device_type.is_le_capable() {
            debug!(
                "Ignoring non-LE device {} ({:?})",
                advertisement.address, advertisement.device_type
            );
            return;
        }

        let identity = advertisement.identity();
        if self.registry.insert_if_absent(identity.clone()) {
            info!("Found {} (RSSI: {:?})", identity, advertisement.rssi);
            self.bus.publish(DeviceFound(identity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceAddress, DeviceType};
    use crate::infrastructure::bluetooth::simulated::SimulatedAdapter;
    use crate::infrastructure::event_bus::handler;
    use crate::infrastructure::timer::ManualScheduler;

    struct Fixture {
        adapter: Arc<SimulatedAdapter>,
        scheduler: Arc<ManualScheduler>,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        found: Arc<Mutex<Vec<DeviceFound>>>,
        scanner: Scanner,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(SimulatedAdapter::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let found = Arc::new(Mutex::new(Vec::new()));

        let sink = found.clone();
        bus.subscribe(handler(move |e: &DeviceFound| sink.lock().unwrap().push(e.clone())));

        let scanner = Scanner::new(
            adapter.clone(),
            registry.clone(),
            bus.clone(),
            scheduler.clone(),
            ScanConfig::default(),
        );

        Fixture {
            adapter,
            scheduler,
            registry,
            bus,
            found,
            scanner,
        }
    }

    fn advert(address: &str, device_type: DeviceType) -> Advertisement {
        Advertisement {
            address: DeviceAddress::parse(address).unwrap(),
            name: Some("Strap".into()),
            device_type,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let f = fixture();
        f.scanner.start_scan().unwrap();
        f.scanner.start_scan().unwrap();
        assert!(f.scanner.is_scanning());
        assert_eq!(f.adapter.scan_starts(), 1);
        // one stop timer + one reset timer
        assert_eq!(f.scheduler.pending_count(), 2);
    }

    #[test]
    fn test_found_once_per_address_and_classic_dropped() {
        let f = fixture();
        f.scanner.start_scan().unwrap();

        f.adapter.advertise(advert("00:00:00:00:00:01", DeviceType::Le));
        f.adapter.advertise(advert("00:00:00:00:00:01", DeviceType::Le));
        f.adapter.advertise(advert("00:00:00:00:00:02", DeviceType::Classic));
        f.adapter.advertise(advert("00:00:00:00:00:03", DeviceType::Unknown));
        f.adapter.advertise(advert("00:00:00:00:00:04", DeviceType::Dual));
        f.bus.flush();

        let found: Vec<String> = f
            .found
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.0.address.to_string())
            .collect();
        assert_eq!(
            found,
            vec!["00:00:00:00:00:01", "00:00:00:00:00:03", "00:00:00:00:00:04"]
        );
        assert_eq!(f.registry.len(), 3);
    }

    #[test]
    fn test_scan_stops_after_duration() {
        let f = fixture();
        f.scanner.start_scan().unwrap();

        f.scheduler.advance(Duration::from_secs(44));
        assert!(f.scanner.is_scanning());
        f.scheduler.advance(Duration::from_secs(1));
        assert!(!f.scanner.is_scanning());
        assert_eq!(f.adapter.scan_stops(), 1);
    }

    #[test]
    fn test_registry_cleared_after_quiet_period() {
        let f = fixture();
        f.scanner.start_scan().unwrap();
        f.adapter.advertise(advert("00:00:00:00:00:01", DeviceType::Le));

        f.scheduler.advance(Duration::from_secs(299));
        assert_eq!(f.registry.len(), 1);
        f.scheduler.advance(Duration::from_secs(1));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_registry_kept_while_a_later_scan_runs() {
        let f = fixture();
        f.scanner.start_scan().unwrap();
        f.adapter.advertise(advert("00:00:00:00:00:01", DeviceType::Le));

        // first scan ends at 45s; second starts at 295s and runs to 340s
        f.scheduler.advance(Duration::from_secs(295));
        f.scanner.start_scan().unwrap();
        f.scheduler.advance(Duration::from_secs(10));
        assert_eq!(f.registry.len(), 1);

        // second reset (295s + 300s) finds no scan running
        f.scheduler.advance(Duration::from_secs(290));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_stop_is_idempotent_and_cancels_timer() {
        let f = fixture();
        f.scanner.stop_scan("nothing running");
        assert_eq!(f.adapter.scan_stops(), 0);

        f.scanner.start_scan().unwrap();
        f.scanner.stop_scan("user");
        f.scanner.stop_scan("user again");
        assert_eq!(f.adapter.scan_stops(), 1);
        // only the registry reset remains
        assert_eq!(f.scheduler.pending_count(), 1);

        f.scanner.start_scan().unwrap();
        f.scheduler.advance(Duration::from_secs(45));
        assert_eq!(f.adapter.scan_stops(), 2);
    }

    #[test]
    fn test_stop_listener_runs_once_per_ended_scan() {
        let f = fixture();
        let stops = Arc::new(Mutex::new(0));
        let counter = stops.clone();
        f.scanner
            .set_stop_listener(Box::new(move || *counter.lock().unwrap() += 1));

        f.scanner.stop_scan("nothing running");
        assert_eq!(*stops.lock().unwrap(), 0);

        f.scanner.start_scan().unwrap();
        f.scheduler.advance(Duration::from_secs(45));
        assert_eq!(*stops.lock().unwrap(), 1);

        f.scanner.start_scan().unwrap();
        f.scanner.stop_scan("user");
        f.scanner.stop_scan("user again");
        assert_eq!(*stops.lock().unwrap(), 2);
    }

    #[test]
    fn test_unsupported_adapter() {
        let f = fixture();
        f.adapter.set_supported(false);
        assert!(matches!(
            f.scanner.start_scan(),
            Err(HeartLinkError::AdapterUnavailable)
        ));
        assert!(!f.scanner.is_scanning());
        assert_eq!(f.scheduler.pending_count(), 0);
    }

    #[test]
    fn test_scan_start_failure_leaves_scanner_stopped() {
        let f = fixture();
        f.adapter
            .fail_next_scan(AdapterError::ScanStart("radio busy".into()));
        assert!(matches!(
            f.scanner.start_scan(),
            Err(HeartLinkError::ScanStartFailure(_))
        ));
        assert!(!f.scanner.is_scanning());

        f.scanner.start_scan().unwrap();
        assert!(f.scanner.is_scanning());
    }
}
