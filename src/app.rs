//! Core application runner for `hrm-relay`.
//!
//! This module is decoupled from CLI parsing, signal handling and process exit
//! codes so it can be tested deterministically with an injected link and sink.

use crate::aggregator::TelemetryAggregator;
use crate::backoff::BackoffConfig;
use crate::connection::{ConnectionError, ConnectionManager, ManagerConfig};
use crate::link::simulated::SimulatedConfig;
use crate::link::{Backend, LinkError, NOTIFICATION_CHANNEL_BUFFER_SIZE, RadioLink};
use crate::mac_address::MacAddress;
use crate::measurement::{Channel, ChannelSet};
use crate::relay::{RelayConfig, RelayScheduler, RelayStats};
use crate::shutdown::Shutdown;
use crate::sink::http::HttpSink;
use crate::sink::{DEFAULT_ENDPOINT, Sink};
use crate::throttle::{parse_duration, parse_interval};
use clap::Parser;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Address reported by the simulated backend when no device is given.
pub const SIMULATED_DEVICE: MacAddress = MacAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]);

/// Relay heart rate monitor telemetry to an HTTP endpoint.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Device address, e.g. AA:BB:CC:DD:EE:FF (optional with --backend simulated)
    #[arg(long, value_name = "ADDRESS")]
    pub device: Option<MacAddress>,

    /// Bluetooth link backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Telemetry channel to collect; repeat for several. Defaults to all.
    #[arg(long = "channel", value_enum, value_name = "CHANNEL")]
    pub channels: Vec<Channel>,

    /// HTTP endpoint receiving JSON publications
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Write JSON lines to stdout instead of posting to the endpoint
    #[arg(long)]
    pub stdout: bool,

    /// Publish at most once per interval.
    /// Accepts duration with suffix: 500ms, 3s, 1m, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "500ms", value_parser = parse_interval)]
    pub relay_interval: Duration,

    /// Upper bound for one publication
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub send_timeout: Duration,

    /// Time between liveness probes
    #[arg(long, default_value = "10s", value_parser = parse_interval)]
    pub probe_interval: Duration,

    /// Upper bound for one liveness probe
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub probe_timeout: Duration,

    /// Upper bound for one connect handshake
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Reconnect delay after the first failure
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub initial_delay: Duration,

    /// Reconnect delay cap
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub max_delay: Duration,

    /// Reconnect delay growth factor
    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Consecutive failed connects before giving up
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Simulated backend: resting heart rate
    #[arg(long, default_value_t = 68)]
    pub simulate_bpm: u16,

    /// Simulated backend: drop the link after this many notifications
    #[arg(long, value_name = "COUNT")]
    pub simulate_drop_after: Option<u32>,

    /// Verbose output, log decode errors and skipped relay ticks
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the application runner.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Relay task failed: {0}")]
    Relay(#[from] tokio::task::JoinError),
    #[error("--device is required with the {0} backend")]
    MissingDevice(Backend),
}

impl Options {
    /// The device to connect to.
    pub fn device_address(&self) -> Result<MacAddress, RunError> {
        match (self.device, self.backend) {
            (Some(device), _) => Ok(device),
            (None, Backend::Simulated) => Ok(SIMULATED_DEVICE),
            #[allow(unreachable_patterns)]
            (None, backend) => Err(RunError::MissingDevice(backend)),
        }
    }

    pub fn channel_set(&self) -> ChannelSet {
        if self.channels.is_empty() {
            ChannelSet::all()
        } else {
            self.channels.iter().copied().collect()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            probe_interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
            connect_timeout: self.connect_timeout,
            backoff: BackoffConfig {
                initial_delay: self.initial_delay,
                multiplier: self.backoff_multiplier,
                max_delay: self.max_delay,
                max_attempts: self.max_attempts,
            },
            notification_buffer: NOTIFICATION_CHANNEL_BUFFER_SIZE,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            interval: self.relay_interval,
            send_timeout: self.send_timeout,
            ..RelayConfig::default()
        }
    }

    pub fn simulated_config(&self) -> SimulatedConfig {
        SimulatedConfig {
            bpm: self.simulate_bpm,
            drop_after: self.simulate_drop_after,
            ..SimulatedConfig::default()
        }
    }
}

/// Build the sink selected by the options.
pub fn open_sink(options: &Options) -> Result<Arc<dyn Sink>, RunError> {
    if options.stdout {
        return Ok(Arc::new(crate::sink::stdout::stdout()));
    }
    Ok(Arc::new(HttpSink::new(
        options.endpoint.clone(),
        options.send_timeout,
    )?))
}

/// Run the connection manager and the relay until `shutdown` fires.
///
/// Returns the relay counters on a clean shutdown, or the persistent fault that
/// stopped the manager.
pub async fn run_with(
    options: Options,
    link: Box<dyn RadioLink>,
    sink: Arc<dyn Sink>,
    mut shutdown: Shutdown,
) -> Result<RelayStats, RunError> {
    let device = options.device_address()?;
    let channels = options.channel_set();
    info!(%device, backend = %options.backend, ?channels, "Starting relay");

    let aggregator = Arc::new(TelemetryAggregator::new(channels));
    let mut manager = ConnectionManager::new(
        link,
        device,
        options.manager_config(),
        Arc::clone(&aggregator),
    );

    let (relay_stop, relay_shutdown) = crate::shutdown::channel();
    let relay = tokio::spawn(RelayScheduler::new(options.relay_config()).run(
        sink,
        aggregator,
        manager.status(),
        relay_shutdown,
    ));

    let connected = manager.connect(&mut shutdown).await;
    relay_stop.trigger();
    let stats = relay.await?;

    connected?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::link::simulated::SimulatedLink;
    use crate::protocol::HEART_RATE_MEASUREMENT;
    use crate::shutdown;
    use crate::test_utils::{FakeLink, FakeSink, TEST_MAC};

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["hrm-relay"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = options(&["--device", "AA:BB:CC:DD:EE:FF"]);
        assert_eq!(options.device_address().unwrap(), TEST_MAC);
        assert_eq!(options.endpoint, DEFAULT_ENDPOINT);
        assert!(!options.stdout);
        assert_eq!(options.channel_set(), ChannelSet::all());
        assert_eq!(options.relay_config(), RelayConfig::default());
        assert_eq!(options.manager_config(), ManagerConfig::default());
    }

    #[test]
    fn test_parse_channels_and_durations() {
        let options = options(&[
            "--device",
            "aa-bb-cc-dd-ee-ff",
            "--channel",
            "heart-rate",
            "--channel",
            "rr-intervals",
            "--relay-interval",
            "2s",
            "--initial-delay",
            "250ms",
            "--max-attempts",
            "9",
        ]);
        let channels = options.channel_set();
        assert!(channels.contains(Channel::HeartRate));
        assert!(channels.contains(Channel::RrIntervals));
        assert!(!channels.contains(Channel::Battery));
        assert_eq!(options.relay_config().interval, Duration::from_secs(2));

        let manager = options.manager_config();
        assert_eq!(manager.backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(manager.backoff.max_attempts, 9);
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        assert!(Options::try_parse_from(["hrm-relay", "--device", "nope"]).is_err());
        assert!(Options::try_parse_from(["hrm-relay", "--relay-interval", "fast"]).is_err());
        assert!(Options::try_parse_from(["hrm-relay", "--channel", "steps"]).is_err());
        assert!(Options::try_parse_from(["hrm-relay", "--relay-interval", "0"]).is_err());
        assert!(Options::try_parse_from(["hrm-relay", "--probe-interval", "0ms"]).is_err());
    }

    #[test]
    fn test_simulated_backend_needs_no_device() {
        let options = options(&["--backend", "simulated", "--simulate-drop-after", "5"]);
        assert_eq!(options.device_address().unwrap(), SIMULATED_DEVICE);
        assert_eq!(options.simulated_config().drop_after, Some(5));
    }

    #[cfg(feature = "bluer")]
    #[test]
    fn test_bluer_backend_needs_device() {
        let options = options(&["--backend", "bluer"]);
        assert!(matches!(
            options.device_address(),
            Err(RunError::MissingDevice(Backend::Bluer))
        ));
    }

    #[test]
    fn test_open_stdout_sink() {
        let options = options(&["--stdout"]);
        assert!(open_sink(&options).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_relays_until_shutdown() {
        let link = FakeLink::new();
        let sink = FakeSink::new();
        let (trigger, shutdown) = shutdown::channel();
        let options = options(&["--device", "AA:BB:CC:DD:EE:FF", "--probe-interval", "1s"]);

        let task = tokio::spawn(run_with(
            options,
            Box::new(link.clone()),
            Arc::new(sink.clone()),
            shutdown,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let encoded = crate::measurement::HeartRateMeasurement {
            bpm: 72,
            energy_expended: None,
            rr_intervals: vec![0.8125],
        }
        .encode();
        link.notify(HEART_RATE_MEASUREMENT, &encoded).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        trigger.trigger();
        let stats = task.await.unwrap().unwrap();
        assert!(stats.published >= 1);
        assert_eq!(stats.failed, 0);

        let last = sink.published().pop().unwrap();
        assert_eq!(last.hr, Some(72));
        assert_eq!(last.rr_intervals, Some(vec![0.8125]));
        assert_eq!(last.battery, Some(80));
        assert_eq!(link.live_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_persistent_fault() {
        let link = FakeLink::new();
        for _ in 0..3 {
            link.push_connect(Err(LinkError::Connect("not found".into())));
        }
        let sink = FakeSink::new();
        let (_trigger, shutdown) = shutdown::channel();
        let options = options(&[
            "--device",
            "AA:BB:CC:DD:EE:FF",
            "--max-attempts",
            "3",
            "--initial-delay",
            "100ms",
        ]);

        let result = run_with(
            options,
            Box::new(link.clone()),
            Arc::new(sink.clone()),
            shutdown,
        )
        .await;
        assert!(matches!(
            result,
            Err(RunError::Connection(ConnectionError::PersistentFault { attempts: 3, .. }))
        ));
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_simulated_device_reconnects() {
        let options = options(&[
            "--backend",
            "simulated",
            "--simulate-drop-after",
            "3",
            "--probe-interval",
            "2s",
            "--initial-delay",
            "100ms",
        ]);
        let link = SimulatedLink::new(SimulatedConfig {
            notify_interval: Duration::from_millis(200),
            outage_attempts: 1,
            ..options.simulated_config()
        });
        let sink = FakeSink::new();
        let (trigger, shutdown) = shutdown::channel();

        let task = tokio::spawn(run_with(
            options,
            Box::new(link.clone()),
            Arc::new(sink.clone()),
            shutdown,
        ));

        // Three notifications, probe failure, one refused connect, then back up
        while link.notifications_sent() < 5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        trigger.trigger();
        let stats = task.await.unwrap().unwrap();
        assert!(stats.published >= 2);

        let published = sink.published();
        let rates: Vec<u16> = published.iter().filter_map(|p| p.hr).collect();
        assert!(!rates.is_empty());
        assert!(rates.iter().all(|hr| (65..=71).contains(hr)), "{rates:?}");
        assert!(published.iter().all(|p| p.battery == Some(90)));
    }

    #[test]
    fn test_connection_state_gates_relay() {
        // Only the two link-up states may publish
        let relayable: Vec<_> = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Monitoring,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ]
        .into_iter()
        .filter(|s| s.may_relay())
        .collect();
        assert_eq!(
            relayable,
            [ConnectionState::Connected, ConnectionState::Monitoring]
        );
    }
}
