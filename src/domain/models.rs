use crate::domain::error::AddressError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Bluetooth hardware address, normalized to upper-case `XX:XX:XX:XX:XX:XX`.
///
/// Parsing accepts either case and `-` separators, so two addresses compare
/// equal whenever they name the same hardware.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let octets: Vec<&str> = text.trim().split([':', '-']).collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(AddressError(text.to_string()));
        }
        Ok(Self(octets.join(":").to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

/// Coarse radio classification reported with an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Unknown,
    Le,
    Dual,
    Classic,
}

impl DeviceType {
    /// Classic-only devices cannot carry a GATT-over-LE link.
    pub fn is_le_capable(self) -> bool {
        !matches!(self, DeviceType::Classic)
    }
}

/// A peripheral as seen by discovery and remembered across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: DeviceAddress,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    pub fn new(address: DeviceAddress, name: Option<String>, device_type: DeviceType) -> Self {
        Self {
            address,
            name,
            device_type,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {}; {:?}",
            self.address,
            self.display_name(),
            self.device_type
        )
    }
}

/// Registry entry: an identity plus when it was first seen in the current
/// discovery window. Ordered and compared by address only.
#[derive(Debug, Clone)]
pub struct StoredDevice {
    identity: DeviceIdentity,
    first_seen: DateTime<Utc>,
}

impl StoredDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            first_seen: Utc::now(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.identity.address
    }

    pub fn name(&self) -> Option<&str> {
        self.identity.name.as_deref()
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }
}

impl PartialEq for StoredDevice {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for StoredDevice {}

impl PartialOrd for StoredDevice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoredDevice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address().cmp(other.address())
    }
}

/// Lifecycle of a GATT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Active,
    Disconnected,
}

impl SessionState {
    /// States in which a transport handle may be open.
    pub fn has_link(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::ServiceDiscovery
                | SessionState::Subscribing
                | SessionState::Active
        )
    }
}

/// Marker for payloads that travel over the event bus. Each implementing type
/// is its own discriminator.
pub trait BusEvent: Send + Sync + 'static {}

/// A new LE-capable address appeared in the current discovery window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound(pub DeviceIdentity);

/// A consumer picked a peripheral to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequested(pub DeviceIdentity);

/// The link to a peripheral was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected(pub DeviceIdentity);

/// A link was torn down or could not be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected(pub DeviceIdentity);

impl BusEvent for DeviceFound {}
impl BusEvent for ConnectRequested {}
impl BusEvent for Connected {}
impl BusEvent for Disconnected {}
impl BusEvent for crate::domain::heart_rate::HeartRateReading {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let a = DeviceAddress::parse("aa:bb:cc:dd:ee:0f").unwrap();
        let b = DeviceAddress::parse("AA-BB-CC-DD-EE-0F").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:0F");
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!(DeviceAddress::parse("").is_err());
        assert!(DeviceAddress::parse("AA:BB:CC:DD:EE").is_err());
        assert!(DeviceAddress::parse("AA:BB:CC:DD:EE:GG").is_err());
        assert!(DeviceAddress::parse("AAB:B:CC:DD:EE:FF").is_err());
    }

    #[test]
    fn test_identity_json_round_trip_normalizes() {
        let json = r#"{"address":"0a:0b:0c:0d:0e:0f","name":"Strap","device_type":"Le"}"#;
        let identity: DeviceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.address.as_str(), "0A:0B:0C:0D:0E:0F");
        assert_eq!(identity.display_name(), "Strap");
    }

    #[test]
    fn test_stored_devices_order_by_address() {
        let mut devices = vec![
            StoredDevice::new(DeviceIdentity::new(
                DeviceAddress::parse("CC:00:00:00:00:00").unwrap(),
                Some("a".into()),
                DeviceType::Le,
            )),
            StoredDevice::new(DeviceIdentity::new(
                DeviceAddress::parse("AA:00:00:00:00:00").unwrap(),
                Some("z".into()),
                DeviceType::Le,
            )),
        ];
        devices.sort();
        assert_eq!(devices[0].address().as_str(), "AA:00:00:00:00:00");
    }

    #[test]
    fn test_classic_is_not_le_capable() {
        assert!(!DeviceType::Classic.is_le_capable());
        assert!(DeviceType::Unknown.is_le_capable());
        assert!(DeviceType::Dual.is_le_capable());
    }
}
