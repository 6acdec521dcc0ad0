//! Connection lifecycle for one wearable.
//!
//! [`ConnectionManager`] owns the only link handle to the device. It connects,
//! subscribes to notifications, probes liveness on a fixed interval and
//! reconnects with jittered exponential backoff. Every notification is decoded
//! and merged into the shared [`TelemetryAggregator`].
//!
//! State transitions are published on a `watch` channel so the relay can gate
//! on [`LinkStatus::may_relay`] without touching the manager.

use crate::aggregator::TelemetryAggregator;
use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::link::{
    LinkError, LinkFuture, LinkHandle, NOTIFICATION_CHANNEL_BUFFER_SIZE, Notification, RadioLink,
};
use crate::mac_address::MacAddress;
use crate::measurement::Channel;
use crate::protocol::{self, BATTERY_LEVEL, HEART_RATE_MEASUREMENT};
use crate::shutdown::Shutdown;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound for tearing down a link handle.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the managed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Monitoring,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Telemetry may be relayed only while the link is up.
    pub fn may_relay(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Monitoring)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Monitoring => "monitoring",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only view of the manager's state.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    rx: watch::Receiver<ConnectionState>,
}

impl LinkStatus {
    pub(crate) fn new(rx: watch::Receiver<ConnectionState>) -> Self {
        Self { rx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn may_relay(&self) -> bool {
        self.state().may_relay()
    }

    /// Wait for the next state change. `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Timing parameters for the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Time between liveness probes while monitoring
    pub probe_interval: Duration,
    /// Upper bound for a single probe read
    pub probe_timeout: Duration,
    /// Upper bound for one connect handshake
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub notification_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            notification_buffer: NOTIFICATION_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Errors surfaced to the caller of [`ConnectionManager::connect`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Giving up after {attempts} failed connection attempts: {last_error}")]
    PersistentFault { attempts: u32, last_error: LinkError },
}

enum MonitorExit {
    Shutdown,
    LinkLost(LinkError),
}

enum SessionOutcome {
    Shutdown,
    Ready,
    Failed(LinkError),
}

/// Owns the link to one device and drives its state machine.
pub struct ConnectionManager {
    link: Box<dyn RadioLink>,
    device: MacAddress,
    config: ManagerConfig,
    aggregator: Arc<TelemetryAggregator>,
    backoff: BackoffPolicy,
    state: watch::Sender<ConnectionState>,
    handle: Option<Box<dyn LinkHandle>>,
    rng: StdRng,
}

impl ConnectionManager {
    pub fn new(
        link: Box<dyn RadioLink>,
        device: MacAddress,
        config: ManagerConfig,
        aggregator: Arc<TelemetryAggregator>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = BackoffPolicy::new(config.backoff.clone());
        Self {
            link,
            device,
            config,
            aggregator,
            backoff,
            state,
            handle: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// A cloneable handle for observing the state.
    pub fn status(&self) -> LinkStatus {
        LinkStatus::new(self.state.subscribe())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let device = self.device;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(%device, from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    /// Connect and keep the link alive until shutdown or persistent failure.
    ///
    /// Returns `Ok(())` after `shutdown` fires (state `Disconnected`), or
    /// [`ConnectionError::PersistentFault`] once `max_attempts` consecutive
    /// connects have failed (state `Failed`). The link handle is released on
    /// both paths.
    pub async fn connect(&mut self, shutdown: &mut Shutdown) -> Result<(), ConnectionError> {
        self.backoff.reset();
        self.set_state(ConnectionState::Connecting);
        let mut wait_first = false;

        loop {
            if wait_first {
                self.set_state(ConnectionState::Reconnecting);
                let wait = self.backoff.jittered_delay(&mut self.rng);
                debug!(
                    device = %self.device,
                    attempt = self.backoff.attempt() + 1,
                    wait = ?wait,
                    "Waiting before reconnect"
                );
                let cancelled = tokio::select! {
                    _ = shutdown.wait() => true,
                    _ = tokio::time::sleep(wait) => false,
                };
                if cancelled {
                    self.disconnect().await;
                    return Ok(());
                }
            }
            wait_first = true;

            let (tx, rx) = mpsc::channel(self.config.notification_buffer.max(1));
            let (outcome, subscribed) = match self.open_session(shutdown, tx).await {
                Ok(subscribed) => (SessionOutcome::Ready, subscribed),
                Err(None) => (SessionOutcome::Shutdown, false),
                Err(Some(err)) => (SessionOutcome::Failed(err), false),
            };

            match outcome {
                SessionOutcome::Shutdown => {
                    self.disconnect().await;
                    return Ok(());
                }
                SessionOutcome::Failed(err) => {
                    self.release().await;
                    self.backoff.record_failure();
                    warn!(
                        device = %self.device,
                        attempt = self.backoff.attempt(),
                        max_attempts = self.backoff.max_attempts(),
                        error = %err,
                        "Connection attempt failed"
                    );
                    if self.backoff.exhausted() {
                        let attempts = self.backoff.attempt();
                        self.set_state(ConnectionState::Failed);
                        error!(device = %self.device, attempts, "Device unreachable");
                        return Err(ConnectionError::PersistentFault {
                            attempts,
                            last_error: err,
                        });
                    }
                }
                SessionOutcome::Ready => {
                    self.backoff.reset();
                    self.set_state(ConnectionState::Monitoring);

                    let exit = match self.handle.as_deref() {
                        Some(handle) => {
                            monitor(
                                handle,
                                &self.aggregator,
                                &self.config,
                                rx,
                                subscribed,
                                shutdown,
                            )
                            .await
                        }
                        None => MonitorExit::LinkLost(LinkError::Closed),
                    };

                    match exit {
                        MonitorExit::Shutdown => {
                            self.disconnect().await;
                            return Ok(());
                        }
                        MonitorExit::LinkLost(err) => {
                            warn!(device = %self.device, error = %err, "Link lost");
                            self.release().await;
                        }
                    }
                }
            }
        }
    }

    /// Release the link handle and go to `Disconnected`. Always succeeds.
    pub async fn disconnect(&mut self) {
        self.release().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Handshake plus initial reads and subscriptions.
    ///
    /// The handshake and the preparation are each bounded by `connect_timeout`.
    /// `Ok(subscribed)` tells whether any notification stream feeds `tx`.
    /// `Err(None)` means shutdown fired first.
    async fn open_session(
        &mut self,
        shutdown: &mut Shutdown,
        tx: mpsc::Sender<Notification>,
    ) -> Result<bool, Option<LinkError>> {
        let connect_timeout = self.config.connect_timeout;
        let handshake = self.link.connect(self.device);
        let connected = tokio::select! {
            _ = shutdown.wait() => return Err(None),
            result = tokio::time::timeout(connect_timeout, handshake) => result,
        };
        let handle = connected
            .map_err(|_| LinkError::Timeout(connect_timeout))
            .and_then(|result| result)
            .map_err(Some)?;
        self.handle = Some(handle);
        self.set_state(ConnectionState::Connected);

        let Some(handle) = self.handle.as_deref() else {
            return Err(Some(LinkError::Closed));
        };
        let preparation = prepare(handle, &self.aggregator, tx);
        let prepared = tokio::select! {
            _ = shutdown.wait() => return Err(None),
            result = tokio::time::timeout(connect_timeout, preparation) => result,
        };
        prepared
            .map_err(|_| LinkError::Timeout(connect_timeout))
            .and_then(|result| result)
            .map_err(Some)
    }

    /// Drop the link handle, logging teardown errors.
    async fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(RELEASE_TIMEOUT, handle.disconnect()).await {
            Ok(Ok(())) => debug!(device = %self.device, "Link released"),
            Ok(Err(err)) => warn!(device = %self.device, error = %err, "Teardown failed"),
            Err(_) => warn!(device = %self.device, "Teardown timed out"),
        }
    }
}

/// Initial battery read and notification subscriptions.
async fn prepare(
    handle: &dyn LinkHandle,
    aggregator: &TelemetryAggregator,
    tx: mpsc::Sender<Notification>,
) -> Result<bool, LinkError> {
    let channels = aggregator.channels();
    let mut subscribed = false;

    if channels.contains(Channel::Battery) {
        let value = handle.read_characteristic(BATTERY_LEVEL).await?;
        merge_value(aggregator, BATTERY_LEVEL, &value);

        match handle.subscribe(BATTERY_LEVEL, tx.clone()).await {
            Ok(()) => subscribed = true,
            Err(err) => debug!(error = %err, "Battery notifications unavailable"),
        }
    }

    if channels.wants_heart_rate_notifications() {
        handle.subscribe(HEART_RATE_MEASUREMENT, tx).await?;
        subscribed = true;
    }

    Ok(subscribed)
}

/// Steady state: merge notifications and probe liveness until something ends it.
async fn monitor(
    handle: &dyn LinkHandle,
    aggregator: &TelemetryAggregator,
    config: &ManagerConfig,
    mut notifications: mpsc::Receiver<Notification>,
    subscribed: bool,
    shutdown: &mut Shutdown,
) -> MonitorExit {
    let mut probes =
        tokio::time::interval_at(Instant::now() + config.probe_interval, config.probe_interval);
    probes.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // At most one probe in flight; polled alongside shutdown and notifications.
    let mut probe: Option<LinkFuture<'_, Vec<u8>>> = None;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return MonitorExit::Shutdown,
            received = notifications.recv(), if subscribed => match received {
                Some(notification) => {
                    merge_value(aggregator, notification.characteristic, &notification.value);
                }
                None => return MonitorExit::LinkLost(LinkError::Closed),
            },
            _ = probes.tick(), if probe.is_none() => {
                probe = Some(probe_battery(handle, config.probe_timeout));
            }
            result = in_flight(&mut probe), if probe.is_some() => {
                probe = None;
                match result {
                    Ok(value) => merge_value(aggregator, BATTERY_LEVEL, &value),
                    Err(err) => return MonitorExit::LinkLost(err),
                }
            }
        }
    }
}

/// Liveness probe: a battery read bounded by `timeout`.
fn probe_battery(handle: &dyn LinkHandle, timeout: Duration) -> LinkFuture<'_, Vec<u8>> {
    Box::pin(async move {
        match tokio::time::timeout(timeout, handle.read_characteristic(BATTERY_LEVEL)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    })
}

async fn in_flight(probe: &mut Option<LinkFuture<'_, Vec<u8>>>) -> Result<Vec<u8>, LinkError> {
    match probe {
        Some(probe) => probe.await,
        None => std::future::pending().await,
    }
}

fn merge_value(aggregator: &TelemetryAggregator, characteristic: uuid::Uuid, value: &[u8]) {
    match protocol::decode(characteristic, value) {
        Ok(measurement) => {
            aggregator.merge(measurement);
        }
        Err(err) => debug!(%characteristic, error = %err, "Dropping undecodable value"),
    }
}
