//! BlueZ D-Bus backend for GATT heart rate devices.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running and the device
//! to be known to BlueZ (paired or recently seen in a scan).

use super::{LinkError, LinkFuture, LinkHandle, Notification, RadioLink};
use crate::mac_address::MacAddress;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Device, Session};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// How long to wait for BlueZ to resolve GATT services after connecting.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for service resolution.
const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// Link backed by the default BlueZ adapter.
pub struct BluerLink {
    // Keeps the D-Bus connection alive for the adapter
    _session: Session,
    adapter: Adapter,
}

impl BluerLink {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new() -> Result<Self, LinkError> {
        let session = Session::new().await.map_err(adapter_error)?;
        let adapter = session.default_adapter().await.map_err(adapter_error)?;
        adapter.set_powered(true).await.map_err(adapter_error)?;
        info!(adapter = adapter.name(), "Bluetooth adapter ready");
        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

fn adapter_error(err: bluer::Error) -> LinkError {
    LinkError::Adapter(err.to_string())
}

fn connect_error(err: bluer::Error) -> LinkError {
    LinkError::Connect(err.to_string())
}

impl RadioLink for BluerLink {
    fn connect(&self, device: MacAddress) -> LinkFuture<'_, Box<dyn LinkHandle>> {
        Box::pin(async move {
            let device = self.adapter.device(device.into()).map_err(connect_error)?;

            if !device.is_connected().await.map_err(connect_error)? {
                device.connect().await.map_err(connect_error)?;
            }

            wait_for_services(&device).await?;
            let characteristics = resolve_characteristics(&device).await?;
            debug!(
                device = %MacAddress::from(device.address()),
                characteristics = characteristics.len(),
                "GATT characteristics resolved"
            );

            Ok(Box::new(BluerHandle {
                device,
                characteristics,
                forwarders: Mutex::new(Vec::new()),
            }) as Box<dyn LinkHandle>)
        })
    }
}

async fn wait_for_services(device: &Device) -> Result<(), LinkError> {
    let resolved = tokio::time::timeout(SERVICE_RESOLVE_TIMEOUT, async {
        while !device.is_services_resolved().await.map_err(connect_error)? {
            tokio::time::sleep(SERVICE_RESOLVE_POLL).await;
        }
        Ok::<(), LinkError>(())
    })
    .await;

    resolved.map_err(|_| LinkError::Timeout(SERVICE_RESOLVE_TIMEOUT))?
}

async fn resolve_characteristics(
    device: &Device,
) -> Result<HashMap<Uuid, Characteristic>, LinkError> {
    let mut found = HashMap::new();
    for service in device.services().await.map_err(connect_error)? {
        for characteristic in service.characteristics().await.map_err(connect_error)? {
            let uuid = characteristic.uuid().await.map_err(connect_error)?;
            found.insert(uuid, characteristic);
        }
    }
    Ok(found)
}

/// An open BlueZ GATT connection.
///
/// Notification forwarders are aborted when the handle is disconnected or dropped.
struct BluerHandle {
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BluerHandle {
    fn characteristic(&self, id: Uuid) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .get(&id)
            .ok_or(LinkError::CharacteristicNotFound(id))
    }

    fn abort_forwarders(&self) {
        let mut forwarders = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in forwarders.drain(..) {
            task.abort();
        }
    }
}

impl LinkHandle for BluerHandle {
    fn read_characteristic(&self, id: Uuid) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            self.characteristic(id)?
                .read()
                .await
                .map_err(|e| LinkError::Read(e.to_string()))
        })
    }

    fn subscribe(&self, id: Uuid, tx: mpsc::Sender<Notification>) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let stream = self
                .characteristic(id)?
                .notify()
                .await
                .map_err(|e| LinkError::Subscribe(e.to_string()))?;

            let task = tokio::spawn(async move {
                let mut stream = Box::pin(stream);
                while let Some(value) = stream.next().await {
                    let notification = Notification {
                        characteristic: id,
                        value,
                    };
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                }
                debug!(characteristic = %id, "Notification stream ended");
            });

            self.forwarders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            Ok(())
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.abort_forwarders();
            self.device
                .disconnect()
                .await
                .map_err(|e| LinkError::Disconnect(e.to_string()))
        })
    }
}

impl Drop for BluerHandle {
    fn drop(&mut self) {
        self.abort_forwarders();
    }
}
