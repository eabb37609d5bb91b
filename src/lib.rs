//! Heart Link
//!
//! Discovers Bluetooth LE heart rate sensors, keeps a GATT link to one of
//! them and publishes decoded readings on a typed event bus.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{AdapterError, DecodeError, HeartLinkError, StoreError};
pub use domain::heart_rate::{HeartRateReading, ValueFormat};
pub use domain::models::{
    ConnectRequested, Connected, DeviceAddress, DeviceFound, DeviceIdentity, DeviceType,
    Disconnected, SessionState,
};
pub use infrastructure::bluetooth::{HeartRateService, StartOutcome};
pub use infrastructure::event_bus::{handler, EventBus};
