//! Authenticated session with the remote ingestion endpoint.
//!
//! The endpoint uses cookie sessions: `POST /v2/login` sets the cookie, and
//! `POST /v2/events/{stream}/{login_id}` only succeeds while it is valid. The
//! [`SessionManager`] owns exactly one cookie-carrying `reqwest::Client` and
//! hides session expiry behind a single transparent re-login per call. Any
//! further retry policy belongs to the caller.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Credentials;

/// Errors raised by the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The endpoint rejected the credentials (4xx on login).
    #[error("Login rejected with HTTP {status}. Check login id, password and API key.")]
    Auth {
        /// Status returned by the login call.
        status: u16,
    },

    /// The endpoint answered the login with a server error or throttled it.
    #[error("Login failed with HTTP {status}; the endpoint is unavailable")]
    Unavailable {
        /// Status returned by the login call.
        status: u16,
    },

    /// The event was still rejected after one re-login.
    #[error("Session expired: event rejected with HTTP {status} after re-authentication")]
    Expired {
        /// Status of the retried post.
        status: u16,
    },

    /// The request never produced a response (connect failure, timeout, ...).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint base URL cannot carry path segments.
    #[error("Endpoint URL cannot be used as a base: {0}")]
    InvalidEndpoint(String),

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl SessionError {
    /// Returns `true` for transport failures while establishing the connection
    /// or waiting for the response.
    #[must_use]
    pub fn is_connect_or_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_connect() || e.is_timeout())
    }
}

/// A specialized [`Result`] type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Serialize)]
struct LoginRequest<'a> {
    login_id: &'a str,
    password: &'a str,
    api_key: &'a str,
}

#[derive(Serialize)]
struct EventEnvelope<'a, T: ?Sized> {
    event_data: &'a T,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    add_client_ip: bool,
}

/// Owner of the single authenticated session.
pub struct SessionManager {
    endpoint: Url,
    timeout: Duration,
    credentials: Credentials,
    http: reqwest::Client,
}

impl SessionManager {
    /// Create a manager for `endpoint` with the given per-request timeout.
    ///
    /// The session starts unauthenticated; the first rejected post triggers
    /// the login.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be used as a base URL or the
    /// HTTP client fails to build.
    pub fn new(endpoint: Url, timeout: Duration) -> SessionResult<Self> {
        if endpoint.cannot_be_a_base() {
            return Err(SessionError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self {
            http: build_client(timeout)?,
            endpoint,
            timeout,
            credentials: Credentials::default(),
        })
    }

    /// Replace the credentials used by the next login.
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    /// Credentials the next login will use.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Base endpoint URL.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Log in with the last known credentials.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`] on a 4xx answer other than 408 or 429,
    /// [`SessionError::Unavailable`] on any other non-200 answer, and
    /// [`SessionError::Transport`] if no answer arrives.
    pub async fn login(&mut self) -> SessionResult<()> {
        let url = self.url(&["v2", "login"])?;
        debug!(login_id = %self.credentials.login_id, "logging in");

        let body = LoginRequest {
            login_id: &self.credentials.login_id,
            password: &self.credentials.password,
            api_key: &self.credentials.api_key,
        };
        let status = self.http.post(url).json(&body).send().await?.status();

        if status == StatusCode::OK {
            info!(login_id = %self.credentials.login_id, "session authenticated");
            Ok(())
        } else if status.is_client_error() && !is_throttled(status) {
            Err(SessionError::Auth {
                status: status.as_u16(),
            })
        } else {
            Err(SessionError::Unavailable {
                status: status.as_u16(),
            })
        }
    }

    /// Post one event to `stream`.
    ///
    /// A non-200 answer triggers exactly one re-login and one retry. The
    /// retry is sent even when the endpoint answers the re-login with an
    /// error, so the outcome is decided by the event post alone.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] if the retry is rejected as well and
    /// [`SessionError::Transport`] if any request gets no answer.
    pub async fn post_event<T>(
        &mut self,
        stream: &str,
        data: &T,
        add_client_ip: bool,
    ) -> SessionResult<()>
    where
        T: Serialize + ?Sized,
    {
        let url = self.url(&["v2", "events", stream, &self.credentials.login_id])?;
        let envelope = EventEnvelope {
            event_data: data,
            add_client_ip,
        };

        let status = self.send(&url, &envelope).await?;
        if status == StatusCode::OK {
            return Ok(());
        }

        warn!(%status, stream, "event rejected, re-authenticating");
        match self.login().await {
            Ok(()) => {}
            Err(e @ SessionError::Transport(_)) => return Err(e),
            Err(e) => warn!(error = %e, stream, "re-authentication failed, retrying event once"),
        }

        let status = self.send(&url, &envelope).await?;
        if status == StatusCode::OK {
            debug!(stream, "event accepted after re-authentication");
            Ok(())
        } else {
            Err(SessionError::Expired {
                status: status.as_u16(),
            })
        }
    }

    /// Throw the current session away and start a fresh one.
    ///
    /// The new client has an empty cookie jar, so the next post
    /// re-authenticates.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn rebuild(&mut self) -> SessionResult<()> {
        self.http = build_client(self.timeout)?;
        info!("session rebuilt");
        Ok(())
    }

    async fn send<B: Serialize + ?Sized>(&self, url: &Url, body: &B) -> SessionResult<StatusCode> {
        debug!("POST {}", url);
        let response = self.http.post(url.clone()).json(body).send().await?;
        Ok(response.status())
    }

    fn url(&self, segments: &[&str]) -> SessionResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| SessionError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Rate limiting and request timeouts say nothing about the credentials.
fn is_throttled(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

fn build_client(timeout: Duration) -> SessionResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    reqwest::Client::builder()
        .timeout(timeout)
        .cookie_store(true)
        .default_headers(headers)
        .user_agent(concat!("pulsebridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SessionError::ClientBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(endpoint: &str) -> SessionManager {
        SessionManager::new(Url::parse(endpoint).unwrap(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_event_url_is_stream_scoped() {
        let mut session = manager("https://api.example.com");
        session.set_credentials(Credentials {
            login_id: "nordic".into(),
            ..Credentials::default()
        });
        let url = session
            .url(&["v2", "events", "sensor_data", "nordic"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/events/sensor_data/nordic"
        );
    }

    #[test]
    fn test_url_keeps_base_path() {
        let session = manager("https://api.example.com/proxy/");
        let url = session.url(&["v2", "login"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/proxy/v2/login");
    }

    #[test]
    fn test_url_escapes_login_id() {
        let session = manager("https://api.example.com");
        let url = session.url(&["v2", "events", "s", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/events/s/a%2Fb");
    }

    #[test]
    fn test_rejects_non_base_endpoint() {
        let result = SessionManager::new(
            Url::parse("mailto:ops@example.com").unwrap(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SessionError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_throttling_statuses_are_not_auth_failures() {
        assert!(is_throttled(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_throttled(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_throttled(StatusCode::UNAUTHORIZED));
        assert!(!is_throttled(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_envelope_omits_false_client_ip() {
        let data = serde_json::json!({ "battery": 88 });
        let body = serde_json::to_value(EventEnvelope {
            event_data: &data,
            add_client_ip: false,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "event_data": { "battery": 88 } }));

        let body = serde_json::to_value(EventEnvelope {
            event_data: &data,
            add_client_ip: true,
        })
        .unwrap();
        assert_eq!(body["add_client_ip"], true);
    }
}
