//! Publish rate limiting and duration parsing for command line options.

use std::time::Duration;
use tokio::time::Instant;

/// Allows at most one event per `interval`.
///
/// The first event is always allowed. Blocked events do not restart the timer.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl Throttle {
    /// Create a new throttle with the specified minimum interval between events.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use hrm_relay::throttle::Throttle;
    ///
    /// let throttle = Throttle::new(Duration::from_millis(500));
    /// ```
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_emit: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` and restarts the timer if an event may be emitted now.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// Time left until the next event would be allowed.
    pub fn remaining(&self) -> Duration {
        match self.last_emit {
            Some(last) => self.interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes, with whole or fractional numbers:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use hrm_relay::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let split = src
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(src.len());
    let (number, unit) = src.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{other}' in '{src}'")),
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("duration out of range: {src}"))
}

/// Parse a duration that drives a periodic timer. Zero is rejected.
pub fn parse_interval(src: &str) -> Result<Duration, String> {
    let interval = parse_duration(src)?;
    if interval.is_zero() {
        return Err(format!("interval must be greater than zero: {}", src.trim()));
    }
    Ok(interval)
}
