//! Clock frequencies and their femtosecond periods.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FS_PER_SECOND: f64 = 1e15;

/// A clock frequency stored in Hertz.
///
/// Parses `"500MHz"`, `"100KHz"`, `"1GHz"`, `"48000Hz"` and bare numbers
/// (Hertz). Used to derive the clock period the driver loop advances by.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frequency(f64);

/// Error type for parsing frequency strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid frequency: '{input}'")]
pub struct ParseFrequencyError {
    /// The input string that failed to parse.
    pub input: String,
}

impl Frequency {
    /// Creates a new frequency from a value in Hertz.
    pub fn new(hz: f64) -> Self {
        Self(hz)
    }

    /// Returns the frequency in Hertz.
    pub fn hz(&self) -> f64 {
        self.0
    }

    /// Returns the frequency in megahertz.
    pub fn mhz(&self) -> f64 {
        self.0 / 1_000_000.0
    }

    /// Returns the full clock period in femtoseconds, rounded to the
    /// nearest femtosecond.
    ///
    /// Returns `None` for non-positive or non-finite frequencies and for
    /// frequencies above 1 PHz, whose period rounds to zero.
    pub fn period_fs(&self) -> Option<u64> {
        if !self.0.is_finite() || self.0 <= 0.0 {
            return None;
        }
        let period = (FS_PER_SECOND / self.0).round();
        if period < 1.0 || period > u64::MAX as f64 {
            return None;
        }
        Some(period as u64)
    }

    /// Returns half the clock period in femtoseconds.
    ///
    /// This is the spacing between clock edges. Odd periods round down.
    pub fn half_period_fs(&self) -> Option<u64> {
        self.period_fs().map(|p| p / 2).filter(|p| *p > 0)
    }
}

impl fmt::Debug for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frequency({self})")
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hz = self.0;
        if hz >= 1e9 {
            write!(f, "{}GHz", hz / 1e9)
        } else if hz >= 1e6 {
            write!(f, "{}MHz", hz / 1e6)
        } else if hz >= 1e3 {
            write!(f, "{}KHz", hz / 1e3)
        } else {
            write!(f, "{hz}Hz")
        }
    }
}

impl FromStr for Frequency {
    type Err = ParseFrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ParseFrequencyError {
            input: s.to_string(),
        };
        let lower = s.to_ascii_lowercase();
        let (number, scale) = [("ghz", 1e9), ("mhz", 1e6), ("khz", 1e3), ("hz", 1.0)]
            .iter()
            .find_map(|(suffix, scale)| lower.strip_suffix(suffix).map(|n| (n, *scale)))
            .unwrap_or((lower.as_str(), 1.0));
        let value: f64 = number.trim().parse().map_err(|_| err())?;
        Ok(Frequency(value * scale))
    }
}
