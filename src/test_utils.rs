use crate::link::{LinkError, LinkFuture, LinkHandle, Notification, RadioLink};
use crate::mac_address::MacAddress;
use crate::measurement::{HeartRateMeasurement, Measurement};
use crate::sink::{Publication, Sink, SinkError, SinkFuture};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Heart rate measurement with the given fields.
pub fn heart_rate(bpm: u16, energy_expended: Option<u16>, rr_intervals: &[f64]) -> Measurement {
    Measurement::HeartRate(HeartRateMeasurement {
        bpm,
        energy_expended,
        rr_intervals: rr_intervals.to_vec(),
    })
}

/// A fixed UTC timestamp `secs` seconds into 2024-01-01.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

#[derive(Default)]
struct FakeScript {
    connect_results: VecDeque<Result<(), LinkError>>,
    read_results: VecDeque<Result<Vec<u8>, LinkError>>,
    read_delays: VecDeque<Duration>,
    subscribe_error: Option<LinkError>,
    disconnect_error: Option<LinkError>,
    connect_delay: Duration,
    connect_times: Vec<Instant>,
    read_times: Vec<Instant>,
    disconnects: usize,
    live_handles: usize,
    subscribers: Vec<(Uuid, mpsc::Sender<Notification>)>,
}

/// Scripted [`RadioLink`] for unit tests.
///
/// Connects and reads pop results from their scripts and fall back to success
/// (battery 80%) once a script runs dry. Every call is recorded.
#[derive(Clone, Default)]
pub struct FakeLink {
    script: Arc<Mutex<FakeScript>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_connect(&self, result: Result<(), LinkError>) -> &Self {
        self.script.lock().unwrap().connect_results.push_back(result);
        self
    }

    pub fn push_read(&self, result: Result<Vec<u8>, LinkError>) -> &Self {
        self.script.lock().unwrap().read_results.push_back(result);
        self
    }

    /// Delay the next read by `delay`. Each call queues one delay.
    pub fn delay_next_read(&self, delay: Duration) -> &Self {
        self.script.lock().unwrap().read_delays.push_back(delay);
        self
    }

    pub fn fail_subscribe(&self, error: LinkError) {
        self.script.lock().unwrap().subscribe_error = Some(error);
    }

    pub fn fail_disconnect(&self, error: LinkError) {
        self.script.lock().unwrap().disconnect_error = Some(error);
    }

    /// Delay every connect handshake by `delay`.
    pub fn slow_connect(&self, delay: Duration) {
        self.script.lock().unwrap().connect_delay = delay;
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.script.lock().unwrap().connect_times.clone()
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connect_times.len()
    }

    pub fn reads(&self) -> usize {
        self.script.lock().unwrap().read_times.len()
    }

    pub fn disconnects(&self) -> usize {
        self.script.lock().unwrap().disconnects
    }

    /// Handles handed out and not yet dropped.
    pub fn live_handles(&self) -> usize {
        self.script.lock().unwrap().live_handles
    }

    /// Push a raw notification to every subscriber of `characteristic`.
    pub async fn notify(&self, characteristic: Uuid, value: &[u8]) {
        let senders: Vec<_> = self
            .script
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|(id, _)| *id == characteristic)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx
                .send(Notification {
                    characteristic,
                    value: value.to_vec(),
                })
                .await;
        }
    }

    /// Drop every subscriber, ending the notification stream.
    pub fn close_notifications(&self) {
        self.script.lock().unwrap().subscribers.clear();
    }
}

impl RadioLink for FakeLink {
    fn connect(&self, _device: MacAddress) -> LinkFuture<'_, Box<dyn LinkHandle>> {
        Box::pin(async move {
            let delay = {
                let mut script = self.script.lock().unwrap();
                script.connect_times.push(Instant::now());
                script.connect_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut script = self.script.lock().unwrap();
            script.connect_results.pop_front().unwrap_or(Ok(()))?;
            script.live_handles += 1;
            Ok(Box::new(FakeHandle {
                script: Arc::clone(&self.script),
            }) as Box<dyn LinkHandle>)
        })
    }
}

struct FakeHandle {
    script: Arc<Mutex<FakeScript>>,
}

impl LinkHandle for FakeHandle {
    fn read_characteristic(&self, _id: Uuid) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let delay = {
                let mut script = self.script.lock().unwrap();
                script.read_times.push(Instant::now());
                script.read_delays.pop_front()
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            script.read_results.pop_front().unwrap_or(Ok(vec![80]))
        })
    }

    fn subscribe(&self, id: Uuid, tx: mpsc::Sender<Notification>) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap();
            if let Some(err) = script.subscribe_error.clone() {
                return Err(err);
            }
            script.subscribers.push((id, tx));
            Ok(())
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap();
            script.disconnects += 1;
            script.subscribers.clear();
            match script.disconnect_error.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        if let Ok(mut script) = self.script.lock() {
            script.live_handles -= 1;
        }
    }
}

/// [`Sink`] that records publications with the instant they were made.
#[derive(Clone, Default)]
pub struct FakeSink {
    published: Arc<Mutex<Vec<(Instant, Publication)>>>,
    failures: Arc<Mutex<VecDeque<SinkError>>>,
    delay: Arc<Mutex<Duration>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: SinkError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Make every publish take `delay` before completing.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn published(&self) -> Vec<Publication> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn publish_times(&self) -> Vec<Instant> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl Sink for FakeSink {
    fn publish<'a>(&'a self, publication: &'a Publication) -> SinkFuture<'a> {
        Box::pin(async move {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.published
                .lock()
                .unwrap()
                .push((Instant::now(), publication.clone()));
            Ok(())
        })
    }
}
