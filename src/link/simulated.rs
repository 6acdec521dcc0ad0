//! Synthetic wearable for running the pipeline without Bluetooth hardware.
//!
//! The simulated device emits encoded Heart Rate Measurement notifications at a
//! fixed rate, exposes a slowly draining Battery Level and can be configured to
//! vanish after a number of notifications to exercise reconnection.

use super::{LinkError, LinkFuture, LinkHandle, Notification, RadioLink};
use crate::mac_address::MacAddress;
use crate::measurement::HeartRateMeasurement;
use crate::protocol::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Notifications between one-percent battery drops.
const BATTERY_DRAIN_EVERY: u32 = 120;

/// Behaviour of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedConfig {
    /// Resting heart rate the generator oscillates around
    pub bpm: u16,
    /// Time between heart rate notifications
    pub notify_interval: Duration,
    /// Battery level at start
    pub battery_percent: u8,
    /// Drop the link after this many notifications
    pub drop_after: Option<u32>,
    /// Connect attempts refused after a drop
    pub outage_attempts: u32,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            bpm: 68,
            notify_interval: Duration::from_secs(1),
            battery_percent: 90,
            drop_after: None,
            outage_attempts: 2,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    connected: bool,
    refuse_connects: u32,
    battery: u8,
    sent: u32,
    total_sent: u32,
}

type SharedState = Arc<Mutex<DeviceState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`RadioLink`] backed by a simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    config: SimulatedConfig,
    state: SharedState,
}

impl SimulatedLink {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = DeviceState {
            connected: false,
            refuse_connects: 0,
            battery: config.battery_percent.min(100),
            sent: 0,
            total_sent: 0,
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Heart rate notifications produced so far.
    pub fn notifications_sent(&self) -> u32 {
        lock(&self.state).total_sent
    }
}

impl RadioLink for SimulatedLink {
    fn connect(&self, device: MacAddress) -> LinkFuture<'_, Box<dyn LinkHandle>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(LinkError::Connect(format!("{device} out of range")));
            }
            state.connected = true;
            state.sent = 0;
            info!(%device, "Simulated device connected");

            Ok(Box::new(SimulatedHandle {
                config: self.config.clone(),
                state: Arc::clone(&self.state),
                generators: Mutex::new(Vec::new()),
                battery_listeners: Mutex::new(Vec::new()),
            }) as Box<dyn LinkHandle>)
        })
    }
}

struct SimulatedHandle {
    config: SimulatedConfig,
    state: SharedState,
    generators: Mutex<Vec<JoinHandle<()>>>,
    // Battery changes are picked up by reads; listeners only keep the stream open
    battery_listeners: Mutex<Vec<mpsc::Sender<Notification>>>,
}

impl SimulatedHandle {
    fn ensure_connected(&self, error: fn(String) -> LinkError) -> Result<(), LinkError> {
        if lock(&self.state).connected {
            Ok(())
        } else {
            Err(error("simulated device not connected".into()))
        }
    }

    fn abort_generators(&self) {
        let mut generators = self
            .generators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in generators.drain(..) {
            task.abort();
        }
    }
}

/// Produce the next notification payload, or `None` once the device has dropped.
fn next_heart_rate(state: &SharedState, config: &SimulatedConfig) -> Option<Vec<u8>> {
    let mut state = lock(state);
    if !state.connected {
        return None;
    }

    state.sent += 1;
    state.total_sent += 1;
    if state.total_sent % BATTERY_DRAIN_EVERY == 0 {
        state.battery = state.battery.saturating_sub(1);
    }
    if config.drop_after.is_some_and(|n| state.sent >= n) {
        debug!("Simulated device going out of range");
        state.connected = false;
        state.refuse_connects = config.outage_attempts;
    }

    let offset: i32 = rand::thread_rng().gen_range(-3..=3);
    let bpm = (i32::from(config.bpm) + offset).clamp(30, 240) as u16;
    let rr = 60.0 / f64::from(bpm);
    let measurement = HeartRateMeasurement {
        bpm,
        energy_expended: None,
        rr_intervals: vec![rr],
    };
    Some(measurement.encode())
}

impl LinkHandle for SimulatedHandle {
    fn read_characteristic(&self, id: Uuid) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            self.ensure_connected(LinkError::Read)?;
            if id == BATTERY_LEVEL {
                Ok(vec![lock(&self.state).battery])
            } else if id == HEART_RATE_MEASUREMENT {
                Err(LinkError::Read("heart rate measurement is notify-only".into()))
            } else {
                Err(LinkError::CharacteristicNotFound(id))
            }
        })
    }

    fn subscribe(&self, id: Uuid, tx: mpsc::Sender<Notification>) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_connected(LinkError::Subscribe)?;
            if id == BATTERY_LEVEL {
                self.battery_listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(tx);
                return Ok(());
            }
            if id != HEART_RATE_MEASUREMENT {
                return Err(LinkError::CharacteristicNotFound(id));
            }

            let state = Arc::clone(&self.state);
            let config = self.config.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.notify_interval);
                loop {
                    ticker.tick().await;
                    let Some(value) = next_heart_rate(&state, &config) else {
                        break;
                    };
                    let notification = Notification {
                        characteristic: HEART_RATE_MEASUREMENT,
                        value,
                    };
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                }
            });

            self.generators
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            Ok(())
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.abort_generators();
            self.battery_listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            lock(&self.state).connected = false;
            Ok(())
        })
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        self.abort_generators();
    }
}
