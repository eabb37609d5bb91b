//! Key/value persistence and the remembered peripheral.

use crate::domain::error::StoreError;
use crate::domain::models::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Opaque key/value storage collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value under `key`, durably committed before returning.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Values kept in memory only.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// One stored value. UTF-8 values are kept as JSON strings so the file stays
/// readable; anything else is kept as a byte array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl StoredValue {
    fn from_bytes(value: &[u8]) -> Self {
        match std::str::from_utf8(value) {
            Ok(text) => StoredValue::Text(text.to_string()),
            Err(_) => StoredValue::Bytes(value.to_vec()),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            StoredValue::Text(text) => text.into_bytes(),
            StoredValue::Bytes(bytes) => bytes,
        }
    }
}

/// A JSON object on disk mapping keys to values.
///
/// Every `put` writes a temporary sibling, syncs it, and renames it into
/// place.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, StoredValue>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        Ok(map.remove(key).map(StoredValue::into_bytes))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        // A corrupt file is replaced rather than blocking every later write.
        let mut map = self.read_map().unwrap_or_else(|e| {
            warn!("Discarding unreadable store {:?}: {}", self.path, e);
            BTreeMap::new()
        });
        map.insert(key.to_string(), StoredValue::from_bytes(value));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(&map)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

const BLE_DEVICE_KEY: &str = "ble_device";

/// Last peripheral a connection was attempted to, used to skip discovery on
/// the next start.
pub struct ConnectionMemory {
    store: Arc<dyn KeyValueStore>,
}

impl ConnectionMemory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persist `identity`, replacing whatever was remembered before.
    pub fn remember(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(identity)?;
        self.store.put(BLE_DEVICE_KEY, &blob)?;
        info!("Remembered peripheral {}", identity.address);
        Ok(())
    }

    /// The remembered peripheral, or `None` if nothing usable is stored.
    pub fn recall(&self) -> Option<DeviceIdentity> {
        let blob = match self.store.get(BLE_DEVICE_KEY) {
            Ok(Some(blob)) if !blob.is_empty() => blob,
            Ok(_) => {
                debug!("No remembered peripheral");
                return None;
            }
            Err(e) => {
                warn!("Could not read remembered peripheral: {}", e);
                return None;
            }
        };

        match serde_json::from_slice::<DeviceIdentity>(&blob) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring unparseable remembered peripheral: {}", e);
                None
            }
        }
    }

    /// Drop the remembered peripheral.
    pub fn forget(&self) -> Result<(), StoreError> {
        self.store.put(BLE_DEVICE_KEY, b"")?;
        info!("Forgot remembered peripheral");
        Ok(())
    }
}
