//! Wireless link to the sensor peripheral.
//!
//! [`PeripheralLink`] is the seam between the supervisor and the Bluetooth
//! stack. A link walks `Disconnected -> Connected -> Subscribed`; any
//! wireless-layer failure drops it back to `Disconnected` and surfaces as a
//! [`LinkError`]. Notifications are pushed by the transport onto an `mpsc`
//! channel handed over at subscription time, so they are delivered while the
//! supervisor is waiting on a poll timer or an HTTP request.
//!
//! Implementations:
//! - [`BluezLink`] (feature `bluetooth`): BlueZ via `bluer`.
//! - [`MockLink`] (feature `mock-bluetooth`, tests, or builds without
//!   Bluetooth): scripted in-memory peripheral.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Characteristic, DeviceAddress, LinkEvent};

#[cfg(feature = "bluetooth")]
mod bluez;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
mod mock;

#[cfg(feature = "bluetooth")]
pub use bluez::{BluezLink, BluezTransport};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MockLink, MockPeripheral, MOCK_BATTERY_HANDLE, MOCK_TELEMETRY_HANDLE};

/// Errors raised by the wireless link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running.")]
    AdapterNotFound,

    /// The configured address is not a valid Bluetooth address.
    #[error("Invalid Bluetooth address: '{address}'")]
    InvalidAddress {
        /// Address as configured.
        address: String,
    },

    /// Connecting to the peripheral failed.
    #[error("Could not connect to {address}: {message}")]
    ConnectFailed {
        /// Target address.
        address: String,
        /// Stack error message.
        message: String,
    },

    /// Connecting did not finish in time.
    #[error("Connection to {address} timed out after {timeout_secs}s")]
    ConnectTimeout {
        /// Target address.
        address: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The operation requires a connected link.
    #[error("Peripheral is not connected")]
    NotConnected,

    /// The peripheral does not expose the requested service.
    #[error("Service {uuid} not found on peripheral")]
    ServiceNotFound {
        /// Service UUID.
        uuid: Uuid,
    },

    /// No characteristic with the expected UUID or handle exists.
    #[error("Characteristic {uuid} not found on peripheral")]
    CharacteristicNotFound {
        /// Characteristic UUID.
        uuid: Uuid,
    },

    /// The characteristic does not support reads.
    #[error("Characteristic {uuid} is not readable")]
    NotReadable {
        /// Characteristic UUID.
        uuid: Uuid,
    },

    /// The notification stream ended, which means the link went down.
    #[error("Notification stream closed")]
    NotificationsClosed,

    /// Any other error reported by the Bluetooth stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// A specialized [`Result`] type for link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Connection state of a [`PeripheralLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection.
    Disconnected,
    /// Connected, no notification subscriptions yet.
    Connected,
    /// Connected with at least one notification subscription.
    Subscribed,
}

impl LinkState {
    /// `true` in `Connected` and `Subscribed`.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Connection to one peripheral.
#[async_trait]
pub trait PeripheralLink: Send {
    /// Current state.
    fn state(&self) -> LinkState;

    /// Connect to `address`.
    async fn connect(&mut self, address: &DeviceAddress) -> LinkResult<()>;

    /// Resolve the characteristics of `service`.
    async fn discover_characteristics(&mut self, service: Uuid) -> LinkResult<Vec<Characteristic>>;

    /// Enable notifications on `characteristic`, delivering them to `sink`.
    async fn subscribe(
        &mut self,
        characteristic: &Characteristic,
        sink: mpsc::Sender<LinkEvent>,
    ) -> LinkResult<()>;

    /// Read the current value of `characteristic`.
    async fn read(&mut self, characteristic: &Characteristic) -> LinkResult<Vec<u8>>;

    /// Tear the connection down.
    async fn disconnect(&mut self) -> LinkResult<()>;
}

/// Best-effort teardown: failures are logged and swallowed so they never mask
/// the error that caused the teardown.
pub async fn disconnect_quietly<L: PeripheralLink + ?Sized>(link: &mut L) {
    match link.disconnect().await {
        Ok(()) => debug!("peripheral disconnected"),
        Err(e) => warn!(error = %e, "error while disconnecting peripheral, continuing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnect_quietly_swallows_errors() {
        let peripheral = MockPeripheral::new();
        peripheral.fail_disconnect(true);
        let mut link = peripheral.link();

        disconnect_quietly(&mut link).await;

        assert_eq!(peripheral.disconnect_calls(), 1);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_link_state_connected() {
        assert!(!LinkState::Disconnected.is_connected());
        assert!(LinkState::Connected.is_connected());
        assert!(LinkState::Subscribed.is_connected());
    }
}
