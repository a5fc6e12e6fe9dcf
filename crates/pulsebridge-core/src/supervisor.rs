//! Outer supervisor loop.
//!
//! One iteration walks the bridge through its whole life cycle:
//!
//! ```text
//! ReloadCredentials -> AwaitPeripheralConnect -> RunningInitEvent
//!     -> RunningTelemetryLoop -> PeripheralTeardown -> (next iteration)
//! ```
//!
//! Failures are handled at the tier they belong to. Decode errors are logged
//! and dropped inside the telemetry loop. Retryable transport errors rebuild
//! the HTTP session and back off without touching the link. Everything else
//! ends the iteration: the link is torn down exactly once and the loop starts
//! over from a fresh credential reload.

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{BridgeConfig, CredentialStore};
use crate::decoder::{Decoded, NotificationDecoder};
use crate::error::{BridgeError, Result};
use crate::host::HostIdentity;
use crate::peripheral::{disconnect_quietly, LinkError, PeripheralLink};
use crate::session::SessionManager;
use crate::types::{
    Characteristic, DeviceAddress, InitializationEvent, LinkEvent, Notification,
    TelemetrySample, BATTERY,
};
use crate::uploader::EventUploader;

/// Capacity of the notification channel between transport and telemetry loop.
const NOTIFICATION_QUEUE: usize = 32;

/// Where the supervisor currently is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Re-reading the credential file.
    ReloadCredentials,
    /// Connecting to the peripheral, retrying until it answers.
    AwaitPeripheralConnect,
    /// Announcing the new connection to the endpoint.
    RunningInitEvent,
    /// Forwarding notifications and battery polls.
    RunningTelemetryLoop,
    /// Releasing the link after a failure.
    PeripheralTeardown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ReloadCredentials => "reload_credentials",
            Self::AwaitPeripheralConnect => "await_peripheral_connect",
            Self::RunningInitEvent => "running_init_event",
            Self::RunningTelemetryLoop => "running_telemetry_loop",
            Self::PeripheralTeardown => "peripheral_teardown",
        };
        f.write_str(label)
    }
}

/// Drives one peripheral and one session forever.
///
/// `link_factory` is called once per iteration to obtain a disconnected link,
/// so a link never outlives the iteration that connected it.
pub struct Supervisor<L, F>
where
    L: PeripheralLink,
    F: FnMut() -> L,
{
    config: BridgeConfig,
    credentials: CredentialStore,
    session: SessionManager,
    uploader: EventUploader,
    link_factory: F,
    state: SupervisorState,
}

impl<L, F> Supervisor<L, F>
where
    L: PeripheralLink,
    F: FnMut() -> L,
{
    /// Create a supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: BridgeConfig, credentials: CredentialStore, link_factory: F) -> Result<Self> {
        let session = SessionManager::new(config.endpoint_url()?, config.timing.request_timeout)?;
        let uploader = EventUploader::new(config.streams.clone());
        Ok(Self {
            config,
            credentials,
            session,
            uploader,
            link_factory,
            state: SupervisorState::ReloadCredentials,
        })
    }

    /// Current life-cycle state.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run iterations forever. Never returns.
    pub async fn run(mut self) {
        info!(
            endpoint = %self.session.endpoint(),
            credentials = %self.credentials.path().display(),
            "supervisor started"
        );
        loop {
            let reason = self.run_iteration().await;
            debug!(
                code = reason.error_code(),
                link_failure = reason.is_link_error(),
                "restarting supervisor cycle"
            );
        }
    }

    /// Run one full cycle and return the error that ended it.
    ///
    /// Connect failures and retryable transport failures are retried inside
    /// the iteration, so it only returns on an invalid device address, a
    /// link failure, a fatal upload failure, or an unexpected error.
    pub async fn run_iteration(&mut self) -> BridgeError {
        self.transition(SupervisorState::ReloadCredentials);
        let credentials = self.credentials.reload().clone();
        let parsed = credentials.device_address.parse::<DeviceAddress>();
        self.session.set_credentials(credentials);

        let address = match parsed {
            Ok(address) => address,
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = self.config.timing.reset_interval.as_millis(),
                    "credential file names no usable peripheral"
                );
                sleep(self.config.timing.reset_interval).await;
                return e.into();
            }
        };

        self.transition(SupervisorState::AwaitPeripheralConnect);
        let mut link = self.connect(&address).await;

        let reason = self.drive(&mut link, &address).await;

        self.transition(SupervisorState::PeripheralTeardown);
        warn!(
            error = %reason,
            code = reason.error_code(),
            link_failure = reason.is_link_error(),
            %address,
            "peripheral cycle ended, tearing down link"
        );
        disconnect_quietly(&mut link).await;
        sleep(self.config.timing.reset_interval).await;
        reason
    }

    fn transition(&mut self, next: SupervisorState) {
        info!(from = %self.state, to = %next, "supervisor state change");
        self.state = next;
    }

    async fn connect(&mut self, address: &DeviceAddress) -> L {
        let mut link = (self.link_factory)();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match link.connect(address).await {
                Ok(()) => {
                    info!(%address, attempt, "peripheral link up");
                    return link;
                }
                Err(e) => {
                    warn!(
                        %address,
                        attempt,
                        error = %e,
                        retry_in_ms = self.config.timing.reset_interval.as_millis(),
                        "peripheral connect failed"
                    );
                    sleep(self.config.timing.reset_interval).await;
                }
            }
        }
    }

    async fn drive(&mut self, link: &mut L, address: &DeviceAddress) -> BridgeError {
        if let Err(e) = self.announce(address).await {
            return e;
        }
        match self.telemetry(link).await {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    /// Upload the initialization event, retrying transport failures forever.
    async fn announce(&mut self, address: &DeviceAddress) -> Result<()> {
        self.transition(SupervisorState::RunningInitEvent);
        let host = tokio::task::spawn_blocking(HostIdentity::detect)
            .await
            .map_err(|e| BridgeError::Unexpected(format!("host identity lookup failed: {e}")))?;
        let event = InitializationEvent {
            connected: true,
            local_network_address: host.lan_address,
            hardware_identifier: host.hardware_id,
            firmware_version: self.config.firmware_version.clone(),
            device_id: address.to_string(),
        };

        loop {
            match self.uploader.upload_init(&mut self.session, &event).await {
                Ok(()) => {
                    info!(%address, "initialization event sent");
                    return Ok(());
                }
                Err(e) => {
                    let backoff = self.config.timing.init_retry_interval;
                    self.recover(e.into(), backoff).await?;
                }
            }
        }
    }

    async fn telemetry(&mut self, link: &mut L) -> Result<Infallible> {
        let (tx, mut rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let decoder = self.subscribe_telemetry(link, &tx).await?;
        // Only the transport may keep the channel open from here on.
        drop(tx);
        let battery = self.battery_characteristics(link).await?;

        self.transition(SupervisorState::RunningTelemetryLoop);
        let period = self.config.timing.poll_interval;
        let mut poll = interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_upload: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(LinkEvent::Notification(notification)) => {
                        self.on_notification(decoder, notification, &mut last_upload).await
                    }
                    Some(LinkEvent::Lost(e)) => Err(e.into()),
                    None => Err(LinkError::NotificationsClosed.into()),
                },
                _ = poll.tick() => self.poll_battery(link, &battery).await,
            };
            if let Err(e) = step {
                let backoff = self.config.timing.reset_interval;
                self.recover(e, backoff).await?;
            }
        }
    }

    /// Decide whether a failure leaves the connection up.
    ///
    /// Local failures are dropped. Retryable ones rebuild the session and
    /// back off for `backoff`. Anything else is handed back and ends the
    /// iteration.
    async fn recover(&mut self, err: BridgeError, backoff: Duration) -> Result<()> {
        if err.is_local() {
            warn!(error = %err, code = err.error_code(), "dropping malformed notification");
            return Ok(());
        }
        if err.requires_reconnect() {
            return Err(err);
        }
        warn!(
            error = %err,
            code = err.error_code(),
            retry_in_ms = backoff.as_millis(),
            "upload failed, rebuilding session"
        );
        self.session.rebuild()?;
        sleep(backoff).await;
        Ok(())
    }

    async fn subscribe_telemetry(
        &self,
        link: &mut L,
        sink: &mpsc::Sender<LinkEvent>,
    ) -> Result<NotificationDecoder> {
        let service = self.config.peripheral.telemetry_service;
        let wanted = self.config.peripheral.telemetry_characteristic;

        let mut decoder = None;
        for characteristic in link.discover_characteristics(service).await? {
            if characteristic.uuid != wanted || !characteristic.is_notifiable() {
                continue;
            }
            link.subscribe(&characteristic, sink.clone()).await?;
            decoder.get_or_insert(NotificationDecoder::new(characteristic.handle));
        }
        decoder.ok_or_else(|| LinkError::CharacteristicNotFound { uuid: wanted }.into())
    }

    async fn battery_characteristics(&self, link: &mut L) -> Result<Vec<Characteristic>> {
        let service = self.config.peripheral.battery_service;
        let wanted = self.config.peripheral.battery_characteristic;

        match link.discover_characteristics(service).await {
            Ok(found) => Ok(found
                .into_iter()
                .filter(|c| c.uuid == wanted && c.is_readable())
                .collect()),
            Err(LinkError::ServiceNotFound { uuid }) => {
                warn!(%uuid, "peripheral has no battery service, skipping battery polls");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_notification(
        &mut self,
        decoder: NotificationDecoder,
        notification: Notification,
        last_upload: &mut Option<Instant>,
    ) -> Result<()> {
        match decoder.decode(notification.handle, &notification.value) {
            Ok(Decoded::Telemetry(sample)) => {
                let now = Instant::now();
                let min_gap = self.config.timing.min_notification_interval;
                if last_upload.is_some_and(|at| now.duration_since(at) < min_gap) {
                    trace!(?sample, "notification throttled");
                    return Ok(());
                }
                *last_upload = Some(now);
                self.uploader
                    .upload_telemetry(&mut self.session, &sample)
                    .await?;
                Ok(())
            }
            Ok(Decoded::Status(status)) => {
                info!(%status, "peripheral status");
                Ok(())
            }
            Ok(Decoded::Unrecognized) => {
                debug!(handle = notification.handle, len = notification.value.len(), "ignoring notification");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn poll_battery(&mut self, link: &mut L, battery: &[Characteristic]) -> Result<()> {
        let mut sample = TelemetrySample::new();
        for characteristic in battery {
            let value = link.read(characteristic).await?;
            match value.first() {
                Some(&level) => sample.insert(BATTERY, i64::from(level)),
                None => debug!(handle = characteristic.handle, "empty battery read"),
            }
        }
        self.uploader
            .upload_telemetry(&mut self.session, &sample)
            .await?;
        Ok(())
    }
}
