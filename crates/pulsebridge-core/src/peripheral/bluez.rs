//! BlueZ-backed peripheral link (Linux, via `bluer`).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{AddressType, Device};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LinkError, LinkResult, LinkState, PeripheralLink};
use crate::config::{AddressKind, PeripheralConfig};
use crate::types::{Characteristic, CharacteristicFlags, DeviceAddress, LinkEvent, Notification};

const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        Self::Bluetooth(err.to_string())
    }
}

/// Shared BlueZ session. Cheap to clone; hands out one [`BluezLink`] per
/// supervisor iteration.
#[derive(Clone)]
pub struct BluezTransport {
    session: bluer::Session,
}

impl BluezTransport {
    /// Open a D-Bus session to bluetoothd.
    ///
    /// # Errors
    ///
    /// Returns an error if bluetoothd is unreachable.
    pub async fn open() -> LinkResult<Self> {
        let session = bluer::Session::new().await?;
        Ok(Self { session })
    }

    /// A fresh, disconnected link.
    #[must_use]
    pub fn link(&self, config: &PeripheralConfig) -> BluezLink {
        BluezLink {
            session: self.session.clone(),
            address_kind: config.address_kind,
            connect_timeout: config.connect_timeout,
            device: None,
            characteristics: HashMap::new(),
            forwarders: Vec::new(),
            state: LinkState::Disconnected,
        }
    }
}

/// GATT client connection to one peripheral through BlueZ.
pub struct BluezLink {
    session: bluer::Session,
    address_kind: AddressKind,
    connect_timeout: Duration,
    device: Option<Device>,
    characteristics: HashMap<u16, RemoteCharacteristic>,
    forwarders: Vec<JoinHandle<()>>,
    state: LinkState,
}

impl BluezLink {
    fn device(&self) -> LinkResult<&Device> {
        self.device.as_ref().ok_or(LinkError::NotConnected)
    }

    fn remote(&self, characteristic: &Characteristic) -> LinkResult<&RemoteCharacteristic> {
        self.characteristics
            .get(&characteristic.handle)
            .ok_or(LinkError::CharacteristicNotFound {
                uuid: characteristic.uuid,
            })
    }

    /// Drop to `Disconnected` and pass the error through.
    fn fail<T>(&mut self, err: LinkError) -> LinkResult<T> {
        self.release();
        Err(err)
    }

    fn release(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.characteristics.clear();
        self.state = LinkState::Disconnected;
    }

    async fn open_device(&self, address: &DeviceAddress) -> LinkResult<Device> {
        let addr = bluer::Address::from_str(address.as_str()).map_err(|_| {
            LinkError::InvalidAddress {
                address: address.to_string(),
            }
        })?;
        let adapter = self
            .session
            .default_adapter()
            .await
            .map_err(|_| LinkError::AdapterNotFound)?;
        adapter.set_powered(true).await?;

        let address_type = match self.address_kind {
            AddressKind::Public => AddressType::LePublic,
            AddressKind::Random => AddressType::LeRandom,
        };
        match adapter.connect_device(addr, address_type).await {
            Ok(device) => Ok(device),
            Err(e) => {
                debug!(error = %e, "connect_device failed, falling back to known device");
                let device = adapter.device(addr)?;
                device
                    .connect()
                    .await
                    .map_err(|e| LinkError::ConnectFailed {
                        address: address.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(device)
            }
        }
    }

    async fn wait_for_services(device: &Device) -> LinkResult<()> {
        while !device.is_services_resolved().await? {
            sleep(SERVICES_RESOLVED_POLL).await;
        }
        Ok(())
    }

    async fn connect_inner(&self, address: &DeviceAddress) -> LinkResult<Device> {
        let device = self.open_device(address).await?;
        Self::wait_for_services(&device).await?;
        Ok(device)
    }
}

#[async_trait]
impl PeripheralLink for BluezLink {
    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, address: &DeviceAddress) -> LinkResult<()> {
        let started = Instant::now();
        match timeout(self.connect_timeout, self.connect_inner(address)).await {
            Ok(Ok(device)) => {
                info!(
                    %address,
                    elapsed_ms = started.elapsed().as_millis(),
                    "peripheral connected"
                );
                self.device = Some(device);
                self.state = LinkState::Connected;
                Ok(())
            }
            Ok(Err(e)) => self.fail(e),
            Err(_) => self.fail(LinkError::ConnectTimeout {
                address: address.to_string(),
                timeout_secs: self.connect_timeout.as_secs(),
            }),
        }
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> LinkResult<Vec<Characteristic>> {
        let listed = self.device()?.services().await;
        let services = match listed {
            Ok(services) => services,
            Err(e) => return self.fail(e.into()),
        };

        let mut matched = None;
        for candidate in services {
            match candidate.uuid().await {
                Ok(uuid) if uuid == service => {
                    matched = Some(candidate);
                    break;
                }
                Ok(_) => {}
                Err(e) => return self.fail(e.into()),
            }
        }
        let Some(remote_service) = matched else {
            return Err(LinkError::ServiceNotFound { uuid: service });
        };

        let listed = remote_service.characteristics().await;
        let remotes = match listed {
            Ok(remotes) => remotes,
            Err(e) => return self.fail(e.into()),
        };

        let mut found = Vec::with_capacity(remotes.len());
        for remote in remotes {
            let (uuid, flags) = match (remote.uuid().await, remote.flags().await) {
                (Ok(uuid), Ok(flags)) => (uuid, flags),
                (Err(e), _) | (_, Err(e)) => return self.fail(e.into()),
            };
            let characteristic = Characteristic {
                uuid,
                handle: remote.id(),
                flags: CharacteristicFlags {
                    read: flags.read,
                    notify: flags.notify,
                },
            };
            debug!(%service, uuid = %characteristic.uuid, handle = characteristic.handle, "characteristic resolved");
            self.characteristics.insert(characteristic.handle, remote);
            found.push(characteristic);
        }
        Ok(found)
    }

    async fn subscribe(
        &mut self,
        characteristic: &Characteristic,
        sink: mpsc::Sender<LinkEvent>,
    ) -> LinkResult<()> {
        let subscribed = self.remote(characteristic)?.notify().await;
        let stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => return self.fail(e.into()),
        };

        let handle = characteristic.handle;
        let forwarder = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                match sink.try_send(LinkEvent::Notification(Notification { handle, value })) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(handle, "notification queue full, dropping notification");
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            // Stream end means bluetoothd dropped the connection.
            let _ = sink.send(LinkEvent::Lost(LinkError::NotificationsClosed)).await;
        });
        self.forwarders.push(forwarder);
        self.state = LinkState::Subscribed;
        debug!(handle, uuid = %characteristic.uuid, "subscribed to notifications");
        Ok(())
    }

    async fn read(&mut self, characteristic: &Characteristic) -> LinkResult<Vec<u8>> {
        if !characteristic.is_readable() {
            return Err(LinkError::NotReadable {
                uuid: characteristic.uuid,
            });
        }
        let value = self.remote(characteristic)?.read().await;
        match value {
            Ok(value) => Ok(value),
            Err(e) => self.fail(e.into()),
        }
    }

    async fn disconnect(&mut self) -> LinkResult<()> {
        self.release();
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        device.disconnect().await.map_err(|e| {
            warn!(error = %e, address = %device.address(), "bluetoothd refused disconnect");
            LinkError::from(e)
        })
    }
}
