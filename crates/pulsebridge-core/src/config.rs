//! Bridge configuration and credential management.
//!
//! Two sources feed the bridge:
//! - [`BridgeConfig`]: deployment settings (endpoint, GATT identifiers,
//!   intervals). Loaded once at startup from an optional TOML file layered
//!   under `PULSEBRIDGE__*` environment variables.
//! - [`CredentialStore`]: the line-oriented login file, re-read at the start
//!   of every supervisor iteration so operators can rotate credentials or
//!   swap the peripheral without restarting the process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::types::{BATTERY_LEVEL, BATTERY_SERVICE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "PULSEBRIDGE";

/// Default remote ingestion endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api-sandbox.mediumone.com";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was explicitly requested but does not exist.
    #[error("Configuration file not found at: {0}")]
    NotFound(String),

    /// The layered configuration could not be built or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A field holds an unusable value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

/// A specialized [`Result`] type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// BRIDGE CONFIG
// =============================================================================

/// Deployment settings for one bridge process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the ingestion endpoint.
    pub endpoint: String,

    /// Path of the line-oriented credential file.
    pub credentials_path: PathBuf,

    /// Firmware revision reported in the initialization event.
    pub firmware_version: String,

    /// Stream names on the remote endpoint.
    pub streams: StreamConfig,

    /// GATT layout of the peripheral.
    pub peripheral: PeripheralConfig,

    /// Poll, retry and timeout intervals.
    pub timing: TimingConfig,
}

/// Remote stream names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream receiving telemetry samples.
    pub telemetry: String,
    /// Stream receiving the initialization event.
    pub device: String,
}

/// How the bridge addresses the peripheral over the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// LE public address.
    Public,
    /// LE random (static) address, used by the reference firmware.
    Random,
}

/// GATT identifiers and link timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// Address type used when connecting.
    pub address_kind: AddressKind,
    /// Service carrying the notifiable telemetry characteristic.
    pub telemetry_service: Uuid,
    /// Notifiable telemetry characteristic.
    pub telemetry_characteristic: Uuid,
    /// Service carrying the readable battery characteristic.
    pub battery_service: Uuid,
    /// Readable battery characteristic.
    pub battery_characteristic: Uuid,
    /// Upper bound for a single connect attempt.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

/// Fixed intervals used at every retry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between battery polls in the telemetry loop.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Sleep after a link failure or a session rebuild.
    #[serde(with = "duration_secs")]
    pub reset_interval: Duration,
    /// Sleep between initialization event attempts.
    #[serde(with = "duration_secs")]
    pub init_retry_interval: Duration,
    /// Minimum spacing between uploaded notification samples. Zero disables throttling.
    #[serde(with = "duration_secs")]
    pub min_notification_interval: Duration,
    /// Timeout applied to every HTTP request.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credentials_path: PathBuf::from("/etc/pulsebridge/login.txt"),
            firmware_version: "032618a".to_string(),
            streams: StreamConfig::default(),
            peripheral: PeripheralConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            telemetry: "sensor_data".to_string(),
            device: "device_data".to_string(),
        }
    }
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            address_kind: AddressKind::Random,
            telemetry_service: HEART_RATE_SERVICE,
            telemetry_characteristic: HEART_RATE_MEASUREMENT,
            battery_service: BATTERY_SERVICE,
            battery_characteristic: BATTERY_LEVEL,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reset_interval: Duration::from_secs(5),
            init_retry_interval: Duration::from_secs(5),
            min_notification_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// With `path = None` the default location is used if it exists. An
    /// explicit path that does not exist is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing (explicit path only), cannot
    /// be parsed, or an environment override has the wrong type.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (file, required) = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.display().to_string()));
                }
                (p.to_path_buf(), true)
            }
            None => (Self::default_path(), false),
        };
        debug!(path = %file.display(), required, "loading bridge configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Default configuration file location.
    ///
    /// On Linux (Raspberry Pi): `/etc/pulsebridge/config.toml`.
    /// Elsewhere: the platform config directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/pulsebridge/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "pulsebridge").map_or_else(
                || PathBuf::from("pulsebridge.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parsed endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the endpoint is not an http(s) URL.
    pub fn endpoint_url(&self) -> ConfigResult<Url> {
        let url = Url::parse(&self.endpoint).map_err(|e| ConfigError::ValidationError {
            field: "endpoint".into(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError {
                field: "endpoint".into(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Check the configuration for values that would make the bridge spin or stall.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> ConfigResult<()> {
        self.endpoint_url()?;

        for (field, value) in [
            ("streams.telemetry", &self.streams.telemetry),
            ("streams.device", &self.streams.device),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError {
                    field: field.into(),
                    message: "stream name cannot be empty".into(),
                });
            }
        }

        for (field, value) in [
            ("timing.poll_interval", self.timing.poll_interval),
            ("timing.reset_interval", self.timing.reset_interval),
            ("timing.init_retry_interval", self.timing.init_retry_interval),
            ("timing.request_timeout", self.timing.request_timeout),
            ("peripheral.connect_timeout", self.peripheral.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError {
                    field: field.into(),
                    message: "interval must be greater than zero".into(),
                });
            }
        }

        Ok(())
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Login material plus the address of the peripheral to bridge.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// API user.
    pub login_id: String,
    /// API user password.
    pub password: String,
    /// API key issued for the project.
    pub api_key: String,
    /// Bluetooth address of the peripheral.
    pub device_address: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_id", &self.login_id)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("device_address", &self.device_address)
            .finish()
    }
}

impl Credentials {
    /// Number of lines a complete credential file provides.
    pub const FIELD_COUNT: usize = 4;

    /// Parse the credential file format: login id, password, api key and
    /// device address, one per line. Extra lines are ignored.
    ///
    /// Returns `None` when fewer than four lines are present.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let fields: Vec<&str> = content.lines().map(str::trim).collect();
        if fields.len() < Self::FIELD_COUNT {
            return None;
        }
        Some(Self {
            login_id: fields[0].to_string(),
            password: fields[1].to_string(),
            api_key: fields[2].to_string(),
            device_address: fields[3].to_string(),
        })
    }
}

/// Re-readable credential source that keeps the last good values.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    current: Credentials,
}

impl CredentialStore {
    /// Create a store reading from `path`, starting from `initial`.
    pub fn new(path: impl Into<PathBuf>, initial: Credentials) -> Self {
        Self {
            path: path.into(),
            current: initial,
        }
    }

    /// Path of the credential file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last known credentials.
    #[must_use]
    pub const fn current(&self) -> &Credentials {
        &self.current
    }

    /// Re-read the credential file.
    ///
    /// A missing, unreadable or short file is logged and the previous values
    /// are kept in full; reload never fails.
    pub fn reload(&mut self) -> &Credentials {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match Credentials::parse(&content) {
                Some(credentials) => {
                    if credentials != self.current {
                        debug!(
                            login_id = %credentials.login_id,
                            device = %credentials.device_address,
                            "credentials reloaded"
                        );
                    }
                    self.current = credentials;
                }
                None => warn!(
                    path = %self.path.display(),
                    "credential file has fewer than {} lines, keeping previous values",
                    Credentials::FIELD_COUNT
                ),
            },
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "could not read credential file, keeping previous values"
            ),
        }
        &self.current
    }
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

/// Durations as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn sample_credentials() -> Credentials {
        Credentials {
            login_id: "nordic".into(),
            password: "Samplepw1".into(),
            api_key: "ABCDEFG".into(),
            device_address: "AA:BB:CC:DD:EE:FF".into(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.poll_interval, Duration::from_secs(5));
        assert_eq!(config.timing.request_timeout, Duration::from_secs(30));
        assert_eq!(config.peripheral.address_kind, AddressKind::Random);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(
            file.path(),
            "endpoint = \"http://localhost:9000\"\n\n[timing]\npoll_interval = 2.5\n",
        )
        .unwrap();

        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.endpoint, "http://localhost:9000");
        assert_eq!(config.timing.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.timing.reset_interval, Duration::from_secs(5));
        assert_eq!(config.streams.telemetry, "sensor_data");
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let err = BridgeConfig::load(Some(Path::new("/nonexistent/pulsebridge.toml")));
        assert!(matches!(err, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_toml_output_reloads() {
        let config = BridgeConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: BridgeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = BridgeConfig {
            endpoint: "ftp://example.com".into(),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "endpoint"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = BridgeConfig::default();
        config.timing.reset_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "timing.reset_interval"
        ));
    }

    #[test]
    fn test_parse_full_credentials() {
        let creds =
            Credentials::parse("nordic\nSamplepw1\nABCDEFG\nAA:BB:CC:DD:EE:FF\n").unwrap();
        assert_eq!(creds, sample_credentials());
    }

    #[test]
    fn test_parse_short_credentials() {
        assert!(Credentials::parse("nordic\nSamplepw1\nABCDEFG\n").is_none());
        assert!(Credentials::parse("").is_none());
    }

    #[test]
    fn test_reload_short_file_keeps_all_fields() {
        let file = write_file("other\npw\n");
        let mut store = CredentialStore::new(file.path(), sample_credentials());

        assert_eq!(store.reload(), &sample_credentials());
    }

    #[test]
    fn test_reload_missing_file_keeps_all_fields() {
        let mut store = CredentialStore::new("/nonexistent/login.txt", sample_credentials());
        assert_eq!(store.reload(), &sample_credentials());
    }

    #[test]
    fn test_reload_picks_up_rotation() {
        let file = write_file("other\npw2\nKEY2\n11:22:33:44:55:66\n");
        let mut store = CredentialStore::new(file.path(), sample_credentials());

        let creds = store.reload().clone();
        assert_eq!(creds.login_id, "other");
        assert_eq!(creds.device_address, "11:22:33:44:55:66");
        assert_eq!(store.current(), &creds);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", sample_credentials());
        assert!(!rendered.contains("Samplepw1"));
        assert!(!rendered.contains("ABCDEFG"));
        assert!(rendered.contains("nordic"));
    }
}
