//! Discovered-device registry shared by discovery and consumers.

use crate::domain::models::{DeviceAddress, DeviceIdentity, StoredDevice};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Address -> first sighting. At most one entry per address; entries are
/// never modified, only inserted or cleared all at once.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<DeviceAddress, StoredDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `identity` unless its address is already known. Returns true
    /// when a new entry was created.
    pub fn insert_if_absent(&self, identity: DeviceIdentity) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(&identity.address) {
            return false;
        }
        devices.insert(identity.address.clone(), StoredDevice::new(identity));
        true
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<StoredDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Snapshot ordered by address.
    pub fn devices(&self) -> Vec<StoredDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Clearing {} discovered devices", devices.len());
        devices.clear();
    }
}
