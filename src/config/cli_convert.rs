//! Size and duration strings
//!
//! Both the command line and the run file accept human-readable values such
//! as `4k`, `1M`, `500ms` or `5m`. [`ByteSize`] and [`HumanDuration`] carry
//! them through serde so run files may use either a string or a bare number.

use crate::config::cli::PriorityArg;
use crate::volume::Priority;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Parse a size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with('k') || s.ends_with("kb") {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('m') || s.ends_with("mb") {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with('g') || s.ends_with("gb") {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", s))
}

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h")
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, unit_nanos): (&str, u64) = if let Some(n) = s.strip_suffix("us") {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix("ms") {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (n, 60 * 1_000_000_000)
    } else if let Some(n) = s.strip_suffix("hr").or_else(|| s.strip_suffix('h')) {
        (n, 3_600 * 1_000_000_000)
    } else {
        (s.as_str(), 1_000_000_000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    num.checked_mul(unit_nanos)
        .map(Duration::from_nanos)
        .with_context(|| format!("Duration out of range: {}", s))
}

/// Convert CLI priority to volume priority
pub fn convert_priority(priority: PriorityArg) -> Priority {
    match priority {
        PriorityArg::Low => Priority::Low,
        PriorityArg::Normal => Priority::Normal,
        PriorityArg::High => Priority::High,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(u64),
    Text(String),
}

/// Byte count written as `4096` or `"4k"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "String")]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn kib(n: u64) -> Self {
        Self(n * 1024)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl TryFrom<RawValue> for ByteSize {
    type Error = String;

    fn try_from(raw: RawValue) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawValue::Number(n) => Ok(Self(n)),
            RawValue::Text(s) => parse_size(&s).map(Self).map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 3] = [(1024 * 1024 * 1024, "G"), (1024 * 1024, "M"), (1024, "k")];
        for (unit, suffix) in UNITS {
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

/// Duration written as `30` (seconds) or `"500ms"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "String")]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const fn secs(n: u64) -> Self {
        Self(Duration::from_secs(n))
    }

    pub fn duration(self) -> Duration {
        self.0
    }
}

impl TryFrom<RawValue> for HumanDuration {
    type Error = String;

    fn try_from(raw: RawValue) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawValue::Number(n) => Ok(Self(Duration::from_secs(n))),
            RawValue::Text(s) => parse_duration(&s).map(Self).map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            write!(f, "0s")
        } else if nanos % 3_600_000_000_000 == 0 {
            write!(f, "{}h", nanos / 3_600_000_000_000)
        } else if nanos % 60_000_000_000 == 0 {
            write!(f, "{}m", nanos / 60_000_000_000)
        } else if nanos % 1_000_000_000 == 0 {
            write!(f, "{}s", nanos / 1_000_000_000)
        } else if nanos % 1_000_000 == 0 {
            write!(f, "{}ms", nanos / 1_000_000)
        } else {
            write!(f, "{}us", nanos / 1_000)
        }
    }
}

impl From<HumanDuration> for String {
    fn from(duration: HumanDuration) -> Self {
        duration.to_string()
    }
}
