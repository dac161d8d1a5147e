//! Aggregation period lengths and window alignment
//!
//! Periods are written as ISO-8601 durations (`PT1S`, `PT1M`, `PT1H`, `P1D`)
//! in configuration and on the wire. Windows are aligned to the Unix epoch:
//! the window containing `t` starts at `t - (t mod period)`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const MILLIS_PER_SECOND: u64 = 1_000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: u64 = 7 * MILLIS_PER_DAY;

/// Upper bound for the default late-arrival grace
const MAX_DEFAULT_GRACE: Duration = Duration::from_secs(10 * 60);

/// Fixed length of an aggregation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    millis: u64,
}

impl Period {
    /// Create a period from milliseconds
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` for a zero length or one that does not fit in
    /// a signed millisecond timestamp.
    pub fn from_millis(millis: u64) -> Result<Self> {
        if millis == 0 || millis > i64::MAX as u64 {
            return Err(Error::InvalidPeriod(format!("{} ms", millis)));
        }
        Ok(Self { millis })
    }

    /// Create a period from whole seconds
    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::from_millis(secs.saturating_mul(MILLIS_PER_SECOND))
    }

    /// Parse an ISO-8601 duration such as `PT1M` or `P1DT12H`
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_millis(parse_iso8601_millis(text)?)
    }

    /// Length in milliseconds
    pub fn as_millis(&self) -> i64 {
        self.millis as i64
    }

    /// Length as a `Duration`
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// Start of the window containing `ts`
    pub fn start_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let millis = ts.timestamp_millis();
        let start = millis - millis.rem_euclid(self.as_millis());
        Utc.timestamp_millis_opt(start).single().unwrap_or(ts)
    }

    /// Default late-arrival grace: half the period, capped at ten minutes
    pub fn default_grace(&self) -> Duration {
        (self.duration() / 2).min(MAX_DEFAULT_GRACE)
    }
}

fn parse_iso8601_millis(text: &str) -> Result<u64> {
    let invalid = || Error::InvalidPeriod(text.to_string());
    let upper = text.trim().to_ascii_uppercase();
    let body = upper.strip_prefix('P').ok_or_else(invalid)?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (body, None),
    };
    if date_part.is_empty() && time_part.is_none() {
        return Err(invalid());
    }

    let mut total = 0.0_f64;
    total += sum_components(date_part, |d| match d {
        'W' => Some(MILLIS_PER_WEEK),
        'D' => Some(MILLIS_PER_DAY),
        _ => None,
    })
    .ok_or_else(invalid)?;
    if let Some(time) = time_part {
        total += sum_components(time, |d| match d {
            'H' => Some(MILLIS_PER_HOUR),
            'M' => Some(MILLIS_PER_MINUTE),
            'S' => Some(MILLIS_PER_SECOND),
            _ => None,
        })
        .ok_or_else(invalid)?;
    }

    if !total.is_finite() || total < 1.0 {
        return Err(invalid());
    }
    Ok(total.round() as u64)
}

// Sum `<number><designator>` pairs; None on any malformed component
fn sum_components(part: &str, factor: impl Fn(char) -> Option<u64>) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let scale = factor(c)?;
        let value: f64 = number.parse().ok()?;
        total += value * scale as f64;
        number.clear();
    }
    if number.is_empty() {
        Some(total)
    } else {
        None
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.millis;
        f.write_str("P")?;
        let days = rest / MILLIS_PER_DAY;
        rest %= MILLIS_PER_DAY;
        if days > 0 {
            write!(f, "{}D", days)?;
        }
        if rest == 0 {
            return Ok(());
        }
        f.write_str("T")?;
        let hours = rest / MILLIS_PER_HOUR;
        rest %= MILLIS_PER_HOUR;
        let minutes = rest / MILLIS_PER_MINUTE;
        rest %= MILLIS_PER_MINUTE;
        if hours > 0 {
            write!(f, "{}H", hours)?;
        }
        if minutes > 0 {
            write!(f, "{}M", minutes)?;
        }
        if rest > 0 {
            let secs = rest / MILLIS_PER_SECOND;
            let millis = rest % MILLIS_PER_SECOND;
            if millis == 0 {
                write!(f, "{}S", secs)?;
            } else {
                write!(f, "{}.{:03}S", secs, millis)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Period::parse(&text).map_err(serde::de::Error::custom)
    }
}
