//! Periodic relay of the latest telemetry to a [`Sink`].
//!
//! The scheduler wakes on a fixed tick and whenever the link comes up. It
//! publishes only while the link may relay, never more than once per interval,
//! and never retries a failed send.

use crate::aggregator::TelemetryAggregator;
use crate::connection::LinkStatus;
use crate::shutdown::Shutdown;
use crate::sink::{Publication, Sink, SinkError};
use crate::throttle::Throttle;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Relay timing.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Minimum time between publications
    pub interval: Duration,
    /// Upper bound for one send
    pub send_timeout: Duration,
    /// How long an in-flight send may finish after shutdown
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Counters reported when the relay stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub failed: u64,
    /// Wakeups skipped because the link was down
    pub link_down: u64,
    /// Wakeups skipped because nothing had been observed yet
    pub empty: u64,
    pub throttled: u64,
}

enum Wake {
    Shutdown,
    Tick,
    LinkUp,
    Idle,
}

pub struct RelayScheduler {
    config: RelayConfig,
    throttle: Throttle,
    stats: RelayStats,
}

impl RelayScheduler {
    pub fn new(config: RelayConfig) -> Self {
        let throttle = Throttle::new(config.interval);
        Self {
            config,
            throttle,
            stats: RelayStats::default(),
        }
    }

    /// Run until `shutdown` fires and return the final counters.
    pub async fn run(
        mut self,
        sink: Arc<dyn Sink>,
        aggregator: Arc<TelemetryAggregator>,
        mut status: LinkStatus,
        mut shutdown: Shutdown,
    ) -> RelayStats {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watching = true;

        loop {
            let wake = tokio::select! {
                _ = shutdown.wait() => Wake::Shutdown,
                _ = ticker.tick() => Wake::Tick,
                changed = status.changed(), if watching => match changed {
                    Some(state) if state.may_relay() => Wake::LinkUp,
                    Some(_) => Wake::Idle,
                    None => {
                        watching = false;
                        Wake::Idle
                    }
                },
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Idle => continue,
                Wake::Tick | Wake::LinkUp => {}
            }

            if !status.may_relay() {
                self.stats.link_down += 1;
                debug!(state = %status.state(), "Link down, skipping relay");
                continue;
            }

            let snapshot = aggregator.snapshot();
            if snapshot.is_empty() {
                self.stats.empty += 1;
                continue;
            }

            if !self.throttle.should_emit() {
                self.stats.throttled += 1;
                continue;
            }

            let publication = Publication::from_snapshot(&snapshot, Utc::now());
            let stop = self.send(sink.as_ref(), &publication, &mut shutdown).await;
            if stop {
                break;
            }
        }

        info!(
            published = self.stats.published,
            failed = self.stats.failed,
            "Relay stopped"
        );
        self.stats
    }

    /// Send once. Returns `true` if shutdown fired during the send.
    async fn send(
        &mut self,
        sink: &dyn Sink,
        publication: &Publication,
        shutdown: &mut Shutdown,
    ) -> bool {
        let send_timeout = self.config.send_timeout;
        let send = tokio::time::timeout(send_timeout, sink.publish(publication));
        tokio::pin!(send);

        let (result, stop) = tokio::select! {
            result = &mut send => (result, false),
            _ = shutdown.wait() => {
                match tokio::time::timeout(self.config.shutdown_grace, &mut send).await {
                    Ok(result) => (result, true),
                    Err(_) => {
                        let grace = self.config.shutdown_grace;
                        warn!(?grace, "Dropping in-flight publication");
                        self.stats.failed += 1;
                        return true;
                    }
                }
            }
        };

        match result.unwrap_or_else(|_| Err(SinkError::Timeout(send_timeout))) {
            Ok(()) => {
                self.stats.published += 1;
                debug!(hr = ?publication.hr, battery = ?publication.battery, "Published");
            }
            Err(err) => {
                self.stats.failed += 1;
                warn!(error = %err, "Publish failed");
            }
        }
        stop
    }
}
