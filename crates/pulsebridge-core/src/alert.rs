//! Threshold alerts on ingested values.
//!
//! Alert workflows run downstream of the bridge: they receive one ingested
//! event, compare a single value against a threshold and notify a fixed
//! recipient by email and SMS, at most once per cooldown window. The cooldown
//! flag lives in an injected [`CooldownStore`] and delivery goes through two
//! opaque [`AlertSender`]s.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Default cooldown between two alerts.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Failure to deliver an alert.
#[derive(Debug, Error)]
pub enum AlertError {
    /// A sender failed.
    #[error("Failed to deliver {channel} alert: {message}")]
    Delivery {
        /// Which sink failed (`email`, `sms`).
        channel: &'static str,
        /// Provider error.
        message: String,
    },
}

/// Key-value store holding expiring cooldown flags.
pub trait CooldownStore: Send + Sync {
    /// Current value of `key`, or `None` if unset or expired.
    fn get(&self, key: &str) -> Option<String>;

    /// Set `key` to `value`, expiring after `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Duration);
}

/// A notification channel (email, SMS, ...).
#[async_trait]
pub trait AlertSender: Send + Sync {
    /// Deliver `message` to `recipient`.
    async fn send(&self, recipient: &str, subject: &str, message: &str) -> Result<(), String>;
}

/// In-process [`CooldownStore`] with wall-clock expiry.
#[derive(Debug, Default)]
pub struct MemoryCooldownStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryCooldownStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CooldownStore for MemoryCooldownStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Utc::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), expires_at));
    }
}

/// Result of evaluating a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    /// The value crossed the threshold and both notifications went out.
    Sent,
    /// The value did not exceed the threshold.
    BelowThreshold,
    /// The value crossed the threshold but an alert was sent recently.
    CoolingDown,
}

/// One threshold alert.
#[derive(Debug, Clone)]
pub struct AlertRule {
    /// JSON pointer of the input value inside an ingested event.
    pub input: String,
    /// Threshold; values strictly above it alert.
    pub threshold: f64,
    /// Key of the cooldown flag.
    pub cooldown_key: String,
    /// Cooldown window.
    pub cooldown: Duration,
    /// Email recipient.
    pub email: String,
    /// SMS recipient.
    pub phone: String,
    /// Email subject.
    pub subject: String,
    /// Message body for both channels.
    pub message: String,
}

impl AlertRule {
    /// Heart-rate rule matching the reference workflow: alert above 210 bpm.
    #[must_use]
    pub fn heart_rate(email: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            input: "/event_data/value".into(),
            threshold: 210.0,
            cooldown_key: "sent_alert".into(),
            cooldown: DEFAULT_COOLDOWN,
            email: email.into(),
            phone: phone.into(),
            subject: "Alert: Heart Rate Threshold Exceeded".into(),
            message: "Heads up! Your heart beat exceeds the threshold level!".into(),
        }
    }

    /// Extract the numeric input value from an ingested event.
    #[must_use]
    pub fn input_value(&self, event: &Value) -> Option<f64> {
        event.pointer(&self.input)?.as_f64()
    }

    /// Evaluate `value`, notifying both senders if it crosses the threshold
    /// outside the cooldown window.
    ///
    /// The cooldown flag is set only after both notifications succeed.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Delivery`] for the first sender that fails.
    pub async fn evaluate(
        &self,
        value: f64,
        store: &dyn CooldownStore,
        email: &dyn AlertSender,
        sms: &dyn AlertSender,
    ) -> Result<AlertOutcome, AlertError> {
        if value <= self.threshold {
            debug!(value, threshold = self.threshold, "below threshold");
            return Ok(AlertOutcome::BelowThreshold);
        }
        if store.get(&self.cooldown_key).is_some() {
            debug!(value, key = %self.cooldown_key, "alert suppressed by cooldown");
            return Ok(AlertOutcome::CoolingDown);
        }

        email
            .send(&self.email, &self.subject, &self.message)
            .await
            .map_err(|message| AlertError::Delivery {
                channel: "email",
                message,
            })?;
        sms.send(&self.phone, &self.subject, &self.message)
            .await
            .map_err(|message| AlertError::Delivery {
                channel: "sms",
                message,
            })?;

        store.set(&self.cooldown_key, "true", self.cooldown);
        info!(value, threshold = self.threshold, "alert sent");
        Ok(AlertOutcome::Sent)
    }
}
