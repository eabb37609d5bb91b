use heart_link::domain::heart_rate::{HeartRateReading, ValueFormat};
use heart_link::domain::models::{
    ConnectRequested, Connected, DeviceAddress, DeviceFound, DeviceIdentity, DeviceType,
    SessionState,
};
use heart_link::infrastructure::bluetooth::adapter::{
    Advertisement, GattCallback, GattStatus, LinkState,
};
use heart_link::infrastructure::bluetooth::protocol::HEART_RATE_MEASUREMENT;
use heart_link::infrastructure::bluetooth::scanner::ScanConfig;
use heart_link::infrastructure::bluetooth::simulated::{heart_rate_profile, SimulatedAdapter};
use heart_link::infrastructure::bluetooth::{HeartRateService, StartOutcome};
use heart_link::infrastructure::event_bus::handler;
use heart_link::infrastructure::storage::JsonFileStore;
use heart_link::infrastructure::timer::ManualScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn strap() -> DeviceIdentity {
    DeviceIdentity::new(
        DeviceAddress::parse("C0:FF:EE:00:00:01").unwrap(),
        Some("Polar H10".into()),
        DeviceType::Le,
    )
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

async fn wait_for(service: &HeartRateService, state: SessionState) {
    let mut rx = service.session().watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("session gone");
}

#[tokio::test]
async fn test_discover_connect_and_read_heart_rate() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("prefs.json");
    let adapter = Arc::new(SimulatedAdapter::new());

    let service = HeartRateService::new(
        adapter.clone(),
        Arc::new(JsonFileStore::new(&store_path)),
        Arc::new(ManualScheduler::new()),
        ScanConfig::default(),
    );

    let (found_tx, mut found) = mpsc::unbounded_channel();
    service.bus().subscribe(handler(move |e: &DeviceFound| {
        let _ = found_tx.send(e.0.clone());
    }));
    let (connected_tx, mut connected) = mpsc::unbounded_channel();
    service.bus().subscribe(handler(move |e: &Connected| {
        let _ = connected_tx.send(e.0.clone());
    }));
    let (reading_tx, mut readings) = mpsc::unbounded_channel();
    service.bus().subscribe(handler(move |r: &HeartRateReading| {
        let _ = reading_tx.send(*r);
    }));

    assert_eq!(service.start().unwrap(), StartOutcome::Scanning);
    adapter.advertise(Advertisement {
        address: strap().address,
        name: strap().name,
        device_type: DeviceType::Le,
        rssi: Some(-58),
    });

    // Consumer picks the discovered device
    let picked = next(&mut found).await;
    assert_eq!(picked, strap());
    service.bus().publish(ConnectRequested(picked));
    wait_for(&service, SessionState::Connecting).await;
    assert!(!adapter.is_scanning());

    let link = adapter.latest_link().unwrap();
    link.deliver(GattCallback::LinkStateChanged(LinkState::Connected));
    assert_eq!(next(&mut connected).await, strap());

    link.deliver(GattCallback::ServicesDiscovered {
        status: GattStatus::Success,
        services: heart_rate_profile(),
    });
    wait_for(&service, SessionState::Active).await;

    link.deliver(GattCallback::CharacteristicChanged {
        characteristic: HEART_RATE_MEASUREMENT,
        value: vec![0x00, 72],
    });
    let reading = next(&mut readings).await;
    assert_eq!(reading.bpm, 72);
    assert_eq!(reading.format, ValueFormat::Uint8);

    service.shutdown().await;
    assert_eq!(service.session().state(), SessionState::Disconnected);
    drop(service);

    // The next run reconnects without scanning
    let adapter = Arc::new(SimulatedAdapter::new());
    let service = HeartRateService::new(
        adapter.clone(),
        Arc::new(JsonFileStore::new(&store_path)),
        Arc::new(ManualScheduler::new()),
        ScanConfig::default(),
    );
    assert_eq!(service.start().unwrap(), StartOutcome::Reconnecting(strap()));
    wait_for(&service, SessionState::Connecting).await;
    assert_eq!(adapter.scan_starts(), 0);
    assert_eq!(adapter.connections(), vec![strap()]);
}

#[tokio::test]
async fn test_superseded_link_is_silent() {
    let adapter = Arc::new(SimulatedAdapter::new());
    let service = HeartRateService::new(
        adapter.clone(),
        Arc::new(heart_link::infrastructure::storage::MemoryStore::new()),
        Arc::new(ManualScheduler::new()),
        ScanConfig::default(),
    );
    let (reading_tx, mut readings) = mpsc::unbounded_channel();
    service.bus().subscribe(handler(move |r: &HeartRateReading| {
        let _ = reading_tx.send(*r);
    }));

    service.connect(strap());
    wait_for(&service, SessionState::Connecting).await;
    let first = adapter.latest_link().unwrap();

    let other = DeviceIdentity::new(
        DeviceAddress::parse("C0:FF:EE:00:00:02").unwrap(),
        None,
        DeviceType::Unknown,
    );
    service.connect(other.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while adapter.connections().len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let second = adapter.latest_link().unwrap();

    // First link comes up late and streams; none of it may surface
    first.deliver(GattCallback::LinkStateChanged(LinkState::Connected));
    first.deliver(GattCallback::CharacteristicChanged {
        characteristic: HEART_RATE_MEASUREMENT,
        value: vec![0x00, 40],
    });

    second.deliver(GattCallback::LinkStateChanged(LinkState::Connected));
    second.deliver(GattCallback::ServicesDiscovered {
        status: GattStatus::Success,
        services: heart_rate_profile(),
    });
    second.deliver(GattCallback::CharacteristicChanged {
        characteristic: HEART_RATE_MEASUREMENT,
        value: vec![0x01, 0x2C, 0x01],
    });

    let reading = next(&mut readings).await;
    assert_eq!(reading.bpm, 300);
    assert_eq!(reading.format, ValueFormat::Uint16);
    assert_eq!(service.session().peer(), Some(other));
}
