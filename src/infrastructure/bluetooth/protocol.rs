//! Heart Rate Profile Protocol
//!
//! GATT identifiers used by the session and the human-readable names shown
//! in logs while walking a peripheral's service tree.

use uuid::Uuid;

/// Bluetooth SIG base UUID: `0000xxxx-0000-1000-8000-00805f9b34fb`
const SIG_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG assigned number into a full UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | SIG_BASE_UUID)
}

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);

/// Heart Rate Measurement characteristic (0x2A37) - notify only
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = sig_uuid(0x2902);

/// Descriptor value that turns notifications on
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

// Characteristic property bits
pub const PROPERTY_READ: u8 = 0x02;
pub const PROPERTY_WRITE: u8 = 0x08;
pub const PROPERTY_NOTIFY: u8 = 0x10;
pub const PROPERTY_INDICATE: u8 = 0x20;

const KNOWN_NAMES: &[(u16, &str)] = &[
    // Services
    (0x1800, "Generic Access"),
    (0x1801, "Generic Attribute"),
    (0x180A, "Device Information"),
    (0x180D, "Heart Rate"),
    (0x180F, "Battery Service"),
    (0x1814, "Running Speed and Cadence"),
    (0x1816, "Cycling Speed and Cadence"),
    // Characteristics
    (0x2A00, "Device Name"),
    (0x2A01, "Appearance"),
    (0x2A19, "Battery Level"),
    (0x2A24, "Model Number String"),
    (0x2A25, "Serial Number String"),
    (0x2A26, "Firmware Revision String"),
    (0x2A29, "Manufacturer Name String"),
    (0x2A37, "Heart Rate Measurement"),
    (0x2A38, "Body Sensor Location"),
    (0x2A39, "Heart Rate Control Point"),
    // Descriptors
    (0x2902, "Client Characteristic Configuration"),
];

/// Maps GATT identifiers to display names. Used for logging only.
pub trait GattNameLookup: Send + Sync {
    /// Never fails; unknown identifiers get a placeholder.
    fn lookup(&self, uuid: &Uuid) -> String;
}

/// Names for the SIG assigned numbers this crate deals with.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardGattNames;

impl GattNameLookup for StandardGattNames {
    fn lookup(&self, uuid: &Uuid) -> String {
        KNOWN_NAMES
            .iter()
            .find(|(short, _)| sig_uuid(*short) == *uuid)
            .map(|(_, name)| (*name).to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
