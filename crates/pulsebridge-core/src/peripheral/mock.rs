//! Scripted in-memory peripheral.
//!
//! [`MockPeripheral`] is the shared control handle: tests script connect
//! failures, reads and notifications on it and inspect call counters.
//! [`MockPeripheral::link`] hands out fresh [`MockLink`]s that talk to it, so
//! the supervisor's link factory can be a plain closure.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{LinkError, LinkResult, LinkState, PeripheralLink};
use crate::types::{
    Characteristic, CharacteristicFlags, DeviceAddress, LinkEvent, Notification, BATTERY_LEVEL,
    BATTERY_SERVICE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
};

/// Handle of the mock heart-rate measurement characteristic.
pub const MOCK_TELEMETRY_HANDLE: u16 = 0x000e;

/// Handle of the mock battery level characteristic.
pub const MOCK_BATTERY_HANDLE: u16 = 0x0012;

/// Battery level returned once the read script is exhausted.
const UNSCRIPTED_BATTERY_LEVEL: u8 = 100;

struct MockState {
    services: HashMap<Uuid, Vec<Characteristic>>,
    connect_failures: usize,
    reads: VecDeque<LinkResult<Vec<u8>>>,
    pending: VecDeque<LinkEvent>,
    sink: Option<mpsc::Sender<LinkEvent>>,
    fail_disconnect: bool,
    connected_to: Option<DeviceAddress>,
    connect_calls: usize,
    disconnect_calls: usize,
    read_calls: usize,
    subscribe_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        let mut services = HashMap::new();
        services.insert(
            HEART_RATE_SERVICE,
            vec![Characteristic {
                uuid: HEART_RATE_MEASUREMENT,
                handle: MOCK_TELEMETRY_HANDLE,
                flags: CharacteristicFlags {
                    read: false,
                    notify: true,
                },
            }],
        );
        services.insert(
            BATTERY_SERVICE,
            vec![Characteristic {
                uuid: BATTERY_LEVEL,
                handle: MOCK_BATTERY_HANDLE,
                flags: CharacteristicFlags {
                    read: true,
                    notify: false,
                },
            }],
        );

        Self {
            services,
            connect_failures: 0,
            reads: VecDeque::new(),
            pending: VecDeque::new(),
            sink: None,
            fail_disconnect: false,
            connected_to: None,
            connect_calls: 0,
            disconnect_calls: 0,
            read_calls: 0,
            subscribe_calls: 0,
        }
    }
}

/// Control handle for a scripted peripheral.
#[derive(Clone, Default)]
pub struct MockPeripheral {
    inner: Arc<Mutex<MockState>>,
}

impl MockPeripheral {
    /// A peripheral exposing a notifiable heart-rate characteristic and a
    /// readable battery characteristic at 100 %.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh, disconnected link to this peripheral.
    #[must_use]
    pub fn link(&self) -> MockLink {
        MockLink {
            peripheral: self.clone(),
            state: LinkState::Disconnected,
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    /// Make disconnect report an error (the link still ends up disconnected).
    pub fn fail_disconnect(&self, fail: bool) {
        self.state().fail_disconnect = fail;
    }

    /// Queue the result of the next characteristic read.
    pub fn script_read(&self, result: LinkResult<Vec<u8>>) {
        self.state().reads.push_back(result);
    }

    /// Remove `service` from the GATT table.
    pub fn remove_service(&self, service: Uuid) {
        self.state().services.remove(&service);
    }

    /// Push a notification. Queued until a subscription exists.
    pub fn push_notification(&self, handle: u16, value: impl Into<Vec<u8>>) {
        self.push_event(LinkEvent::Notification(Notification {
            handle,
            value: value.into(),
        }));
    }

    /// Report a link failure through the notification channel.
    pub fn drop_link(&self, error: LinkError) {
        self.push_event(LinkEvent::Lost(error));
    }

    fn push_event(&self, event: LinkEvent) {
        let mut guard = self.state();
        let state = &mut *guard;
        match &state.sink {
            Some(sink) => {
                if let Err(e) = sink.try_send(event) {
                    debug!(error = %e, "mock notification dropped");
                }
            }
            None => state.pending.push_back(event),
        }
    }

    /// Address of the current connection, if any.
    #[must_use]
    pub fn connected_to(&self) -> Option<DeviceAddress> {
        self.state().connected_to.clone()
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    /// Number of disconnect attempts so far.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    /// Number of reads so far.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.state().read_calls
    }

    /// Number of subscriptions so far.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }
}

/// A link to a [`MockPeripheral`].
pub struct MockLink {
    peripheral: MockPeripheral,
    state: LinkState,
}

impl MockLink {
    fn ensure_connected(&self) -> LinkResult<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    fn drop_connection(&mut self) {
        self.state = LinkState::Disconnected;
        let mut shared = self.peripheral.state();
        shared.sink = None;
        shared.connected_to = None;
    }
}

#[async_trait]
impl PeripheralLink for MockLink {
    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, address: &DeviceAddress) -> LinkResult<()> {
        let mut shared = self.peripheral.state();
        shared.connect_calls += 1;
        if shared.connect_failures > 0 {
            shared.connect_failures -= 1;
            return Err(LinkError::ConnectFailed {
                address: address.to_string(),
                message: "scripted failure".into(),
            });
        }
        shared.connected_to = Some(address.clone());
        drop(shared);

        self.state = LinkState::Connected;
        Ok(())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> LinkResult<Vec<Characteristic>> {
        self.ensure_connected()?;
        self.peripheral
            .state()
            .services
            .get(&service)
            .cloned()
            .ok_or(LinkError::ServiceNotFound { uuid: service })
    }

    async fn subscribe(
        &mut self,
        characteristic: &Characteristic,
        sink: mpsc::Sender<LinkEvent>,
    ) -> LinkResult<()> {
        self.ensure_connected()?;
        if !characteristic.is_notifiable() {
            return Err(LinkError::Bluetooth(format!(
                "characteristic {} does not support notifications",
                characteristic.uuid
            )));
        }

        let mut shared = self.peripheral.state();
        shared.subscribe_calls += 1;
        while let Some(event) = shared.pending.pop_front() {
            if let Err(e) = sink.try_send(event) {
                debug!(error = %e, "mock notification dropped");
            }
        }
        shared.sink = Some(sink);
        drop(shared);

        self.state = LinkState::Subscribed;
        Ok(())
    }

    async fn read(&mut self, characteristic: &Characteristic) -> LinkResult<Vec<u8>> {
        self.ensure_connected()?;
        if !characteristic.is_readable() {
            return Err(LinkError::NotReadable {
                uuid: characteristic.uuid,
            });
        }

        let result = {
            let mut shared = self.peripheral.state();
            shared.read_calls += 1;
            shared
                .reads
                .pop_front()
                .unwrap_or_else(|| Ok(vec![UNSCRIPTED_BATTERY_LEVEL]))
        };
        if result.is_err() {
            self.drop_connection();
        }
        result
    }

    async fn disconnect(&mut self) -> LinkResult<()> {
        let fail = {
            let mut shared = self.peripheral.state();
            shared.disconnect_calls += 1;
            shared.fail_disconnect
        };
        self.drop_connection();
        if fail {
            Err(LinkError::Bluetooth("scripted disconnect failure".into()))
        } else {
            Ok(())
        }
    }
}
