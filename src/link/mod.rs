//! Radio link abstraction for GATT heart rate devices.
//!
//! The connection manager only talks to the [`RadioLink`] and [`LinkHandle`]
//! traits. Backends provide the actual transport: BlueZ over D-Bus
//! (`bluer` feature) or a synthetic in-process device for running without
//! hardware.

#[cfg(feature = "bluer")]
pub mod bluer;

pub mod simulated;

use crate::mac_address::MacAddress;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Errors raised by radio link operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Adapter or session level failure
    #[error("Adapter error: {0}")]
    Adapter(String),
    /// Connection handshake failed
    #[error("Connect failed: {0}")]
    Connect(String),
    /// The device does not expose the requested characteristic
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    /// Reading a characteristic failed
    #[error("Read failed: {0}")]
    Read(String),
    /// Enabling notifications failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    /// Tearing down the connection failed
    #[error("Disconnect failed: {0}")]
    Disconnect(String),
    /// Operation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// The notification stream ended
    #[error("Link closed")]
    Closed,
}

/// Boxed future returned by link operations.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Raw characteristic value pushed by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Channel buffer size for notifications between the link and the manager.
pub const NOTIFICATION_CHANNEL_BUFFER_SIZE: usize = 64;

/// Opens connections to a device.
pub trait RadioLink: Send + Sync {
    fn connect(&self, device: MacAddress) -> LinkFuture<'_, Box<dyn LinkHandle>>;
}

/// An open connection to one device.
///
/// Notifications are delivered by message passing: `subscribe` forwards every
/// value of the characteristic into the given sender until the link goes down or
/// the receiver is dropped.
pub trait LinkHandle: Send + Sync {
    fn read_characteristic(&self, id: Uuid) -> LinkFuture<'_, Vec<u8>>;

    fn subscribe(&self, id: Uuid, tx: mpsc::Sender<Notification>) -> LinkFuture<'_, ()>;

    fn disconnect(&self) -> LinkFuture<'_, ()>;
}

/// Available link backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Synthetic wearable, no hardware required
    Simulated,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(not(feature = "bluer"))]
        return Backend::Simulated;
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            Backend::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            "simulated" | "sim" => Ok(Backend::Simulated),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the link for the selected backend.
pub async fn open(
    backend: Backend,
    simulated: simulated::SimulatedConfig,
) -> Result<Box<dyn RadioLink>, LinkError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => {
            let _ = simulated;
            Ok(Box::new(bluer::BluerLink::new().await?))
        }
        Backend::Simulated => Ok(Box::new(simulated::SimulatedLink::new(simulated))),
    }
}
