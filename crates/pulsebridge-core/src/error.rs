//! Unified error types for the pulsebridge core library.
//!
//! Every module on the relay path owns a specific error enum
//! ([`ConfigError`], [`SessionError`], [`UploadError`], [`LinkError`],
//! [`DecodeError`]). The [`BridgeError`] type wraps them so the supervisor can
//! decide, in one place, which retry tier a failure belongs to.
//!
//! # Failure tiers
//!
//! - **Local**: decode failures are logged and dropped where they happen.
//! - **Session**: retryable transport failures rebuild the HTTP session and
//!   back off, without touching the peripheral link.
//! - **Link**: link failures, fatal upload failures and anything unexpected
//!   tear down the peripheral link and restart the whole cycle.
//!
//! # Example
//!
//! ```rust
//! use pulsebridge_core::error::BridgeError;
//! use pulsebridge_core::peripheral::LinkError;
//!
//! let err: BridgeError = LinkError::NotConnected.into();
//! assert!(err.is_link_error());
//! assert!(err.requires_reconnect());
//! ```

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::decoder::DecodeError;
pub use crate::peripheral::LinkError;
pub use crate::session::SessionError;
pub use crate::uploader::UploadError;

/// The unified error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    // =========================================================================
    // REMOTE ENDPOINT
    // =========================================================================
    /// The session layer failed outside of an upload (e.g. rebuilding the client).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),

    // =========================================================================
    // PERIPHERAL
    // =========================================================================
    /// The wireless link failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A notification payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    // =========================================================================
    // OTHER
    // =========================================================================
    /// Anything that does not fit the categories above.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// A specialized [`Result`] type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Returns `true` if this error originated in the peripheral link.
    #[inline]
    #[must_use]
    pub const fn is_link_error(&self) -> bool {
        matches!(self, Self::Link(_))
    }

    /// Returns `true` if this error only needs a session rebuild and a backoff.
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Upload(upload) if upload.is_retryable())
    }

    /// Returns `true` if this error must tear down the peripheral link.
    ///
    /// Link errors, fatal upload errors and unexpected errors all route to a
    /// full reconnect. Decode errors never do.
    #[inline]
    #[must_use]
    pub const fn requires_reconnect(&self) -> bool {
        !self.is_local() && !self.is_retryable()
    }

    /// Returns `true` if the error can be handled without leaving the current
    /// connection.
    #[inline]
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Returns a machine-readable error code for structured logs.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Session(SessionError::Auth { .. }) => "AUTH_ERROR",
            Self::Session(SessionError::Expired { .. }) => "AUTH_EXPIRED",
            Self::Session(_) => "SESSION_ERROR",
            Self::Upload(UploadError::RetryableTransport(_)) => "RETRYABLE_TRANSPORT",
            Self::Upload(UploadError::Fatal(_)) => "UPLOAD_FATAL",
            Self::Link(_) => "LINK_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Unexpected(_) => "UNEXPECTED",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn expired() -> SessionError {
        SessionError::Expired { status: 401 }
    }

    #[test]
    fn test_link_error_classification() {
        let err: BridgeError = LinkError::NotConnected.into();
        assert!(err.is_link_error());
        assert!(err.requires_reconnect());
        assert!(!err.is_retryable());
        assert!(!err.is_local());
    }

    #[test]
    fn test_retryable_upload_stays_connected() {
        let err: BridgeError = UploadError::RetryableTransport(expired()).into();
        assert!(err.is_retryable());
        assert!(!err.requires_reconnect());
        assert_eq!(err.error_code(), "RETRYABLE_TRANSPORT");
    }

    #[test]
    fn test_fatal_upload_requires_reconnect() {
        let err: BridgeError = UploadError::Fatal(SessionError::Auth { status: 403 }).into();
        assert!(!err.is_retryable());
        assert!(err.requires_reconnect());
    }

    #[test]
    fn test_unexpected_routes_like_link_error() {
        let err = BridgeError::Unexpected("boom".into());
        assert!(err.requires_reconnect());
        assert!(format!("{err}").contains("boom"));
    }

    #[test]
    fn test_decode_errors_are_local() {
        let err: BridgeError = DecodeError::Truncated { tag: 0x16, len: 1 }.into();
        assert!(err.is_local());
        assert!(!err.requires_reconnect());
        assert_eq!(err.error_code(), "DECODE_ERROR");
    }

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            BridgeError::from(SessionError::Auth { status: 401 }).error_code(),
            "AUTH_ERROR"
        );
        assert_eq!(BridgeError::from(expired()).error_code(), "AUTH_EXPIRED");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BridgeError>();
        assert_sync::<BridgeError>();
    }
}
