//! Shared domain types.
//!
//! Telemetry samples, the one-shot initialization event, link status signals
//! and the GATT identifiers exchanged between the peripheral link, the decoder
//! and the uploader.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peripheral::LinkError;

/// Metric key for heart-rate notifications.
pub const HEART_RATE: &str = "heart_rate";

/// Metric key for polled battery readings.
pub const BATTERY: &str = "battery";

/// Heart Rate service (`0x180D`).
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (`0x2A37`).
pub const HEART_RATE_MEASUREMENT: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Battery service (`0x180F`).
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Battery Level characteristic (`0x2A19`).
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

static MAC_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("valid MAC regex"));

/// Returns `true` if `value` is a colon-separated 48-bit MAC address.
#[must_use]
pub fn is_valid_mac_address(value: &str) -> bool {
    MAC_ADDRESS.is_match(value)
}

// ============================================================================
// Telemetry
// ============================================================================

/// One reading destined for the remote endpoint.
///
/// Serializes as a flat JSON object (`{"heart_rate": 72}`). Samples are
/// consumed by a single upload attempt and never retained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetrySample(BTreeMap<String, i64>);

impl TelemetrySample {
    /// Create an empty sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample holding a single heart-rate value.
    #[must_use]
    pub fn heart_rate(bpm: u8) -> Self {
        Self::new().with(HEART_RATE, i64::from(bpm))
    }

    /// Sample holding a single battery level.
    #[must_use]
    pub fn battery(level: u8) -> Self {
        Self::new().with(BATTERY, i64::from(level))
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, metric: impl Into<String>, value: i64) -> Self {
        self.insert(metric, value);
        self
    }

    /// Insert or overwrite a metric.
    pub fn insert(&mut self, metric: impl Into<String>, value: i64) {
        self.0.insert(metric.into(), value);
    }

    /// Look up a metric.
    #[must_use]
    pub fn get(&self, metric: &str) -> Option<i64> {
        self.0.get(metric).copied()
    }

    /// `true` when the sample carries no metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of metrics in the sample.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Status tag carried in the first byte of every telemetry notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The peripheral is (re)booting its sensor front end.
    Booting,
    /// The peripheral lost contact with the sensor.
    ConnectionLost,
    /// A valid reading follows the tag.
    NotifyOk,
}

impl LinkStatus {
    /// Tag byte as sent by the peripheral.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Booting => 0x06,
            Self::ConnectionLost => 0x14,
            Self::NotifyOk => 0x16,
        }
    }

    /// Map a tag byte back to a status.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x06 => Some(Self::Booting),
            0x14 => Some(Self::ConnectionLost),
            0x16 => Some(Self::NotifyOk),
            _ => None,
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Booting => "booting",
            Self::ConnectionLost => "connection lost",
            Self::NotifyOk => "ok",
        };
        f.write_str(label)
    }
}

/// Event sent once per successful peripheral connection, before any telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationEvent {
    /// Always `true`; the event announces a fresh connection.
    pub connected: bool,

    /// LAN address of the bridge host, if one could be determined.
    #[serde(rename = "lan_ip_address")]
    pub local_network_address: Option<IpAddr>,

    /// Hardware (MAC) address of the bridge host's primary interface,
    /// sent as a 48-bit integer.
    #[serde(rename = "mac_address")]
    pub hardware_identifier: Option<u64>,

    /// Firmware revision the bridge was deployed against.
    pub firmware_version: String,

    /// Address of the peripheral that was connected.
    pub device_id: String,
}

// ============================================================================
// Peripheral identifiers
// ============================================================================

/// Validated Bluetooth device address, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// The normalized address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if is_valid_mac_address(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(LinkError::InvalidAddress {
                address: s.to_string(),
            })
        }
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Property flags of a characteristic that the bridge cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicFlags {
    /// The characteristic supports reads.
    pub read: bool,
    /// The characteristic supports notifications.
    pub notify: bool,
}

/// A characteristic resolved on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Attribute handle assigned by the peripheral for this connection.
    pub handle: u16,
    /// Supported operations.
    pub flags: CharacteristicFlags,
}

impl Characteristic {
    /// `true` if the characteristic can be read.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.flags.read
    }

    /// `true` if the characteristic can push notifications.
    #[must_use]
    pub const fn is_notifiable(&self) -> bool {
        self.flags.notify
    }
}

/// Raw notification pushed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Handle of the characteristic that produced the value.
    pub handle: u16,
    /// Raw payload.
    pub value: Vec<u8>,
}

/// Item delivered on the notification channel by the transport.
#[derive(Debug)]
pub enum LinkEvent {
    /// A notification arrived.
    Notification(Notification),
    /// The transport detected a link failure outside of a request.
    Lost(LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_mac_address("ab:cd:ef:gh:ij:kl"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
    }

    #[test]
    fn test_device_address_normalizes_case() {
        let addr: DeviceAddress = " aa:bb:cc:dd:ee:ff ".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_device_address_rejects_garbage() {
        let err = "not-an-address".parse::<DeviceAddress>().unwrap_err();
        assert!(matches!(err, LinkError::InvalidAddress { .. }));
    }

    #[test]
    fn test_sample_serializes_flat() {
        let sample = TelemetrySample::heart_rate(72);
        assert_eq!(
            serde_json::to_value(&sample).unwrap(),
            serde_json::json!({ "heart_rate": 72 })
        );
    }

    #[test]
    fn test_link_status_tags_round_trip() {
        for status in [
            LinkStatus::Booting,
            LinkStatus::ConnectionLost,
            LinkStatus::NotifyOk,
        ] {
            assert_eq!(LinkStatus::from_tag(status.tag()), Some(status));
        }
        assert_eq!(LinkStatus::from_tag(0x00), None);
    }

    #[test]
    fn test_initialization_event_wire_keys() {
        let event = InitializationEvent {
            connected: true,
            local_network_address: Some("192.168.1.20".parse().unwrap()),
            hardware_identifier: Some(0xb827_eb00_1122),
            firmware_version: "032618a".into(),
            device_id: "AA:BB:CC:DD:EE:FF".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["lan_ip_address"], "192.168.1.20");
        assert_eq!(json["mac_address"], 202_481_585_885_474_u64);
        assert_eq!(json["connected"], true);
    }

    #[test]
    fn test_service_uuids_use_bluetooth_base() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }
}
