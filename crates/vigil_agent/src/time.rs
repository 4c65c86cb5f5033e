//! Simulated time with femtosecond resolution.
//!
//! [`SimTime`] is a point on the simulation timeline and only ever moves
//! forward. [`SimDuration`] is a signed span so that callers can express, and
//! the clock can reject, zero or negative advances.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Femtoseconds per picosecond.
pub const FS_PER_PS: u64 = 1_000;
/// Femtoseconds per nanosecond.
pub const FS_PER_NS: u64 = 1_000_000;
/// Femtoseconds per microsecond.
pub const FS_PER_US: u64 = 1_000_000_000;
/// Femtoseconds per millisecond.
pub const FS_PER_MS: u64 = 1_000_000_000_000;
/// Femtoseconds per second.
pub const FS_PER_S: u64 = 1_000_000_000_000_000;

/// Digits of the fractional part in the wire form of a time.
const WIRE_FRACTION_DIGITS: usize = 15;

/// Errors from parsing times and durations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    /// The input was empty.
    #[error("empty time value")]
    Empty,
    /// No numeric part could be read.
    #[error("invalid number in '{0}'")]
    InvalidNumber(String),
    /// The unit suffix is missing or not recognised.
    #[error("unknown time unit in '{0}' (expected fs, ps, ns, us, ms or s)")]
    InvalidUnit(String),
    /// The value does not fit the femtosecond counter.
    #[error("time value '{0}' is out of range")]
    OutOfRange(String),
    /// A negative value was given where a point in time was expected.
    #[error("time '{0}' must not be negative")]
    Negative(String),
}

/// A point in simulated time, counted in femtoseconds from the start of the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTime {
    fs: u64,
}

impl SimTime {
    /// Time zero.
    pub const ZERO: SimTime = SimTime { fs: 0 };

    /// The latest representable time.
    pub const MAX: SimTime = SimTime { fs: u64::MAX };

    /// Creates a time from femtoseconds.
    pub const fn from_fs(fs: u64) -> Self {
        Self { fs }
    }

    /// Creates a time from picoseconds.
    pub const fn from_ps(ps: u64) -> Self {
        Self { fs: ps * FS_PER_PS }
    }

    /// Creates a time from nanoseconds.
    pub const fn from_ns(ns: u64) -> Self {
        Self { fs: ns * FS_PER_NS }
    }

    /// Returns the time in femtoseconds.
    pub const fn as_fs(self) -> u64 {
        self.fs
    }

    /// Returns `self + duration`, or `None` if the duration is negative
    /// enough to go before zero or the sum overflows.
    pub fn checked_add(self, duration: SimDuration) -> Option<SimTime> {
        let fs = if duration.fs >= 0 {
            self.fs.checked_add(duration.fs as u64)?
        } else {
            self.fs.checked_sub(duration.fs.unsigned_abs())?
        };
        Some(SimTime { fs })
    }

    /// Returns the span from `earlier` to `self`, saturating at zero.
    pub fn since(self, earlier: SimTime) -> SimDuration {
        let fs = self.fs.saturating_sub(earlier.fs).min(i64::MAX as u64);
        SimDuration { fs: fs as i64 }
    }

    /// Formats the time as `<seconds>.<femtoseconds>` with fifteen
    /// fractional digits, the form used on the debug wire.
    pub fn to_wire(self) -> String {
        format!(
            "{}.{:0width$}",
            self.fs / FS_PER_S,
            self.fs % FS_PER_S,
            width = WIRE_FRACTION_DIGITS
        )
    }

    /// Parses the `<seconds>.<femtoseconds>` wire form.
    ///
    /// A fraction shorter than fifteen digits is read as a decimal fraction
    /// (`"1.5"` is 1.5 s). A bare integer is read as whole seconds.
    pub fn from_wire(s: &str) -> Result<SimTime, TimeParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TimeParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(TimeParseError::Negative(s.to_string()));
        }
        let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(secs) || (!frac.is_empty() && !digits(frac)) || frac.len() > WIRE_FRACTION_DIGITS
        {
            return Err(TimeParseError::InvalidNumber(s.to_string()));
        }
        let out_of_range = || TimeParseError::OutOfRange(s.to_string());
        let secs: u64 = secs.parse().map_err(|_| out_of_range())?;
        let femtos: u64 = if frac.is_empty() {
            0
        } else {
            let scale = 10u64.pow((WIRE_FRACTION_DIGITS - frac.len()) as u32);
            frac.parse::<u64>()
                .map_err(|_| TimeParseError::InvalidNumber(s.to_string()))?
                * scale
        };
        secs.checked_mul(FS_PER_S)
            .and_then(|fs| fs.checked_add(femtos))
            .map(SimTime::from_fs)
            .ok_or_else(out_of_range)
    }
}

impl FromStr for SimTime {
    type Err = TimeParseError;

    /// Accepts either a unit suffix (`"6ns"`, `"1.5 us"`) or the wire form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.bytes().all(|b| b.is_ascii_digit() || b == b'.') && !trimmed.is_empty() {
            return SimTime::from_wire(trimmed);
        }
        let duration: SimDuration = trimmed.parse()?;
        if duration.fs < 0 {
            return Err(TimeParseError::Negative(trimmed.to_string()));
        }
        Ok(SimTime::from_fs(duration.fs as u64))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.fs)
    }
}

/// A signed span of simulated time in femtoseconds.
///
/// Only strictly positive durations may advance the clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimDuration {
    fs: i64,
}

impl SimDuration {
    /// The empty duration.
    pub const ZERO: SimDuration = SimDuration { fs: 0 };

    /// Creates a duration from signed femtoseconds.
    pub const fn from_fs(fs: i64) -> Self {
        Self { fs }
    }

    /// Creates a duration from signed picoseconds.
    pub const fn from_ps(ps: i64) -> Self {
        Self {
            fs: ps * FS_PER_PS as i64,
        }
    }

    /// Creates a duration from signed nanoseconds.
    pub const fn from_ns(ns: i64) -> Self {
        Self {
            fs: ns * FS_PER_NS as i64,
        }
    }

    /// Returns the span in femtoseconds.
    pub const fn as_fs(self) -> i64 {
        self.fs
    }

    /// Returns `true` if the duration is strictly greater than zero.
    pub const fn is_positive(self) -> bool {
        self.fs > 0
    }
}

impl FromStr for SimDuration {
    type Err = TimeParseError;

    /// Parses `"<number><unit>"` with an optional sign, optional space, and
    /// an optional fractional part: `"1ns"`, `"-3 us"`, `"2.5ps"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TimeParseError::Empty);
        }
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let number_end = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let number = &body[..number_end];
        if number.is_empty() || number.starts_with('.') {
            return Err(TimeParseError::InvalidNumber(s.to_string()));
        }
        let multiplier = match body[number_end..].trim() {
            "fs" => 1,
            "ps" => FS_PER_PS,
            "ns" => FS_PER_NS,
            "us" => FS_PER_US,
            "ms" => FS_PER_MS,
            "s" => FS_PER_S,
            _ => return Err(TimeParseError::InvalidUnit(s.to_string())),
        };
        let fs = scale_decimal(number, multiplier)
            .ok_or_else(|| TimeParseError::InvalidNumber(s.to_string()))?;
        let fs = i64::try_from(fs).map_err(|_| TimeParseError::OutOfRange(s.to_string()))?;
        Ok(SimDuration {
            fs: if negative { -fs } else { fs },
        })
    }
}

impl fmt::Display for SimDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fs < 0 {
            write!(f, "-")?;
        }
        write_scaled(f, self.fs.unsigned_abs())
    }
}

/// Multiplies a decimal string by an integer unit, rejecting fractions that
/// do not land on a whole femtosecond.
fn scale_decimal(number: &str, multiplier: u64) -> Option<u64> {
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if frac.contains('.') {
        return None;
    }
    let whole: u64 = whole.parse().ok()?;
    let mut fs = whole.checked_mul(multiplier)?;
    let mut place = multiplier;
    for digit in frac.bytes() {
        if place % 10 != 0 {
            if digit != b'0' {
                return None;
            }
            continue;
        }
        place /= 10;
        fs = fs.checked_add(u64::from(digit - b'0') * place)?;
    }
    Some(fs)
}

fn write_scaled(f: &mut fmt::Formatter<'_>, fs: u64) -> fmt::Result {
    const UNITS: [(u64, &str); 5] = [
        (FS_PER_S, "s"),
        (FS_PER_MS, "ms"),
        (FS_PER_US, "us"),
        (FS_PER_NS, "ns"),
        (FS_PER_PS, "ps"),
    ];
    if fs != 0 {
        for (scale, unit) in UNITS {
            if fs >= scale && fs % scale == 0 {
                return write!(f, "{} {unit}", fs / scale);
            }
        }
    }
    write!(f, "{fs} fs")
}
