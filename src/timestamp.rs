//! Wall-clock timestamps and elapsed-time helpers

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A point in time as shown in events and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Local>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Local::now())
    }

    pub fn from_datetime(datetime: DateTime<Local>) -> Self {
        Self(datetime)
    }

    /// `YYYYMMDD`
    pub fn date_string(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// `HH:MM:SS`
    pub fn time_string(&self) -> String {
        self.0.format("%H:%M:%S").to_string()
    }

    /// `YYYYMMDD-HH:MM:SS`
    pub fn timestamp_string(&self) -> String {
        format!("{}-{}", self.date_string(), self.time_string())
    }

    /// Time elapsed between this timestamp and `later`, zero if `later` is earlier
    pub fn elapsed_until(&self, later: &Timestamp) -> Duration {
        (later.0 - self.0).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_until(&Timestamp::now())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.timestamp_string())
    }
}

impl AsRef<DateTime<Local>> for Timestamp {
    fn as_ref(&self) -> &DateTime<Local> {
        &self.0
    }
}

/// Render a duration as `hh:mm:ss`; hours keep growing past 99
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Parse a timer value such as `500`, `500ms`, `30s`, `5m`, `2h` or `1d`.
///
/// A bare number is milliseconds.
pub fn parse_timer_value(value: &str) -> Result<Duration> {
    let value = value.trim();

    let (digits, multiplier_ms) = if let Some(rest) = value.strip_suffix("ms") {
        (rest, 1)
    } else if let Some(rest) = value.strip_suffix('s') {
        (rest, 1_000)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = value.strip_suffix('h') {
        (rest, 3_600_000)
    } else if let Some(rest) = value.strip_suffix('d') {
        (rest, 86_400_000)
    } else {
        (value, 1)
    };

    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid timer value: {}", value))?;

    amount
        .checked_mul(multiplier_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| anyhow!("Timer value too large: {}", value))
}
