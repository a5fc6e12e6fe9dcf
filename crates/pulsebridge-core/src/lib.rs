//! # pulsebridge-core
//!
//! Core logic for the pulsebridge sensor relay.
//!
//! The bridge keeps a Bluetooth Low Energy link to a heart-rate peripheral,
//! decodes its notifications and battery readings, and forwards them to a
//! remote ingestion endpoint over an authenticated HTTP session. Both the
//! wireless link and the network are expected to fail; the supervisor
//! recovers from either indefinitely.
//!
//! ## Architecture
//!
//! - [`supervisor`] - Outer loop: reload credentials, connect, announce, relay, tear down
//! - [`peripheral`] - `PeripheralLink` trait, BlueZ implementation and a scripted mock
//! - [`decoder`] - Status-tagged notification payloads to telemetry samples
//! - [`session`] - Cookie session with transparent re-login
//! - [`uploader`] - Event posting and retryable/fatal classification
//! - [`host`] - LAN address and hardware identifier of the bridge host
//! - [`alert`] - Threshold alert rules for downstream workflows
//! - [`config`] - Bridge settings and the credential file
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared data types and GATT identifiers
//!
//! ## Features
//!
//! - `bluetooth`: BlueZ transport via `bluer` (Linux, needs libdbus).
//! - `mock-bluetooth`: in-memory peripheral for tests and demos. Also
//!   available whenever `bluetooth` is off.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alert;
pub mod config;
pub mod decoder;
pub mod error;
pub mod host;
pub mod peripheral;
pub mod session;
pub mod supervisor;
pub mod types;
pub mod uploader;

// Re-export primary types for convenience
pub use alert::{
    AlertError, AlertOutcome, AlertRule, AlertSender, CooldownStore, MemoryCooldownStore,
};
pub use config::{
    AddressKind, BridgeConfig, ConfigError, ConfigResult, CredentialStore, Credentials,
    PeripheralConfig, StreamConfig, TimingConfig,
};
pub use decoder::{DecodeError, Decoded, NotificationDecoder};
pub use error::{BridgeError, Result};
pub use host::HostIdentity;
#[cfg(feature = "bluetooth")]
pub use peripheral::{BluezLink, BluezTransport};
pub use peripheral::{disconnect_quietly, LinkError, LinkResult, LinkState, PeripheralLink};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use peripheral::{MockLink, MockPeripheral, MOCK_BATTERY_HANDLE, MOCK_TELEMETRY_HANDLE};
pub use session::{SessionError, SessionManager, SessionResult};
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{
    Characteristic, CharacteristicFlags, DeviceAddress, InitializationEvent, LinkEvent,
    LinkStatus, Notification, TelemetrySample,
};
pub use uploader::{EventUploader, UploadError, UploadResult};
