//! Error kinds surfaced by the heart rate link.
//!
//! Every failure is local to the operation that produced it. Nothing here is
//! process-fatal; callers decide whether to log, surface or ignore.

use crate::domain::heart_rate::ValueFormat;
use thiserror::Error;

/// What an adapter collaborator reports when a primitive cannot be issued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Bluetooth LE adapter unavailable")]
    Unavailable,
    #[error("Scan could not be started: {0}")]
    ScanStart(String),
    #[error("Connection could not be initiated: {0}")]
    Connect(String),
    #[error("GATT operation failed: {0}")]
    Operation(String),
}

/// Failure kinds of the discovery / connection / decode pipeline.
#[derive(Debug, Error)]
pub enum HeartLinkError {
    #[error("Bluetooth LE adapter unavailable")]
    AdapterUnavailable,
    #[error("Failed to start scan: {0}")]
    ScanStartFailure(String),
    #[error("Link failure: {0}")]
    LinkFailure(String),
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailure(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<AdapterError> for HeartLinkError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Unavailable => HeartLinkError::AdapterUnavailable,
            AdapterError::ScanStart(reason) => HeartLinkError::ScanStartFailure(reason),
            AdapterError::Connect(reason) => HeartLinkError::LinkFailure(reason),
            AdapterError::Operation(reason) => HeartLinkError::LinkFailure(reason),
        }
    }
}

/// A measurement payload too short for the format its flags select.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{format} heart rate needs {required} bytes, got {actual}")]
pub struct DecodeError {
    pub format: ValueFormat,
    pub required: usize,
    pub actual: usize,
}

/// Key/value persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Hardware address text that is not six colon/dash separated hex octets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0:?}")]
pub struct AddressError(pub String);
