//! Telemetry upload and failure classification.
//!
//! The uploader wraps samples in the event envelope, hands them to the
//! [`SessionManager`] and sorts failures into the two tiers the supervisor
//! cares about. Samples are not retained: a failed upload is a lost sample.

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::session::{SessionError, SessionManager};
use crate::types::{InitializationEvent, TelemetrySample};

/// Upload failure, split by the action the caller has to take.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Rebuild the session, back off, and carry on.
    #[error("Retryable transport failure: {0}")]
    RetryableTransport(#[source] SessionError),

    /// Abandon the current connection cycle.
    #[error("Fatal upload failure: {0}")]
    Fatal(#[source] SessionError),
}

impl UploadError {
    /// Classify a session error.
    ///
    /// Connect failures, timeouts, an expired session and an unavailable
    /// login endpoint are retryable. Rejected credentials and everything else
    /// are fatal.
    #[must_use]
    pub fn classify(err: SessionError) -> Self {
        let retryable = err.is_connect_or_timeout()
            || matches!(
                err,
                SessionError::Expired { .. } | SessionError::Unavailable { .. }
            );
        if retryable {
            Self::RetryableTransport(err)
        } else {
            Self::Fatal(err)
        }
    }

    /// Returns `true` for [`UploadError::RetryableTransport`].
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableTransport(_))
    }
}

/// A specialized [`Result`] type for uploads.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// Posts telemetry and initialization events through a session.
#[derive(Debug, Clone)]
pub struct EventUploader {
    streams: StreamConfig,
}

impl EventUploader {
    /// Create an uploader writing to the given streams.
    #[must_use]
    pub const fn new(streams: StreamConfig) -> Self {
        Self { streams }
    }

    /// Stream names in use.
    #[must_use]
    pub const fn streams(&self) -> &StreamConfig {
        &self.streams
    }

    /// Upload `sample` to `stream`. Empty samples are skipped.
    ///
    /// # Errors
    ///
    /// Returns the classified session error.
    pub async fn upload(
        &self,
        session: &mut SessionManager,
        stream: &str,
        sample: &TelemetrySample,
    ) -> UploadResult<()> {
        if sample.is_empty() {
            trace!(stream, "skipping empty sample");
            return Ok(());
        }
        session
            .post_event(stream, sample, false)
            .await
            .map_err(UploadError::classify)?;
        debug!(stream, ?sample, "sample uploaded");
        Ok(())
    }

    /// Upload `sample` to the telemetry stream.
    ///
    /// # Errors
    ///
    /// Returns the classified session error.
    pub async fn upload_telemetry(
        &self,
        session: &mut SessionManager,
        sample: &TelemetrySample,
    ) -> UploadResult<()> {
        self.upload(session, &self.streams.telemetry, sample).await
    }

    /// Upload the initialization event to the device stream, asking the
    /// endpoint to attach the client IP.
    ///
    /// # Errors
    ///
    /// Returns the classified session error.
    pub async fn upload_init(
        &self,
        session: &mut SessionManager,
        event: &InitializationEvent,
    ) -> UploadResult<()> {
        session
            .post_event(&self.streams.device, event, true)
            .await
            .map_err(UploadError::classify)?;
        debug!(stream = %self.streams.device, device = %event.device_id, "initialization event uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_is_retryable() {
        let err = UploadError::classify(SessionError::Expired { status: 401 });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let err = UploadError::classify(SessionError::Unavailable { status: 503 });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_is_fatal() {
        let err = UploadError::classify(SessionError::Auth { status: 403 });
        assert!(matches!(err, UploadError::Fatal(SessionError::Auth { .. })));
    }

    #[test]
    fn test_client_build_is_fatal() {
        let err = UploadError::classify(SessionError::ClientBuild("tls".into()));
        assert!(!err.is_retryable());
    }
}
