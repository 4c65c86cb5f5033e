//! Configuration types deserialized from `vigil.toml`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use vigil_common::Frequency;

/// The top-level harness configuration parsed from `vigil.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Debug link listener settings.
    pub link: LinkConfig,
    /// Waveform spool settings.
    pub spool: SpoolConfig,
    /// Clock driver settings.
    pub clock: ClockConfig,
    /// Debug session limits.
    pub session: SessionConfig,
}

/// Settings for the TCP listener that debug clients attach to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Socket address to bind, e.g. `"127.0.0.1:6618"`. Port 0 picks a free port.
    pub bind: String,
    /// Number of worker threads in the link's I/O runtime.
    pub worker_threads: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:6618".to_string(),
            worker_threads: 2,
        }
    }
}

impl LinkConfig {
    /// Returns a link configuration bound to `addr` with default settings otherwise.
    pub fn bind(addr: impl Into<String>) -> Self {
        Self {
            bind: addr.into(),
            ..Self::default()
        }
    }
}

/// Settings for the append-only waveform spool file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpoolConfig {
    /// Path of the spool file.
    pub path: PathBuf,
    /// When written records are pushed to the operating system or disk.
    pub sync: SyncPolicy,
    /// Whether an existing spool is replaced or extended.
    pub mode: SpoolMode,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spool.bin"),
            sync: SyncPolicy::default(),
            mode: SpoolMode::default(),
        }
    }
}

/// Durability policy for spool writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Records stay in the process buffer until it fills or the spool closes.
    Buffered,
    /// Records are flushed to the operating system at the end of every step.
    #[default]
    Step,
    /// Records are flushed and fsynced at the end of every step.
    Durable,
}

/// How an existing spool file is treated when the harness starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolMode {
    /// Truncate and start a fresh spool.
    #[default]
    Create,
    /// Recover the existing spool and keep appending to it.
    Append,
}

/// Settings for the clock driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockConfig {
    /// Hierarchical name of the clock input port.
    pub port: String,
    /// Clock frequency as a string, e.g. `"500MHz"`.
    pub frequency: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            port: "top.clk".to_string(),
            frequency: "500MHz".to_string(),
        }
    }
}

impl ClockConfig {
    /// Parses the configured frequency.
    pub fn frequency(&self) -> Result<Frequency, ConfigError> {
        self.frequency
            .parse()
            .map_err(|e: vigil_common::ParseFrequencyError| {
                ConfigError::invalid("clock.frequency", e.to_string())
            })
    }

    /// Returns the spacing between clock edges in femtoseconds.
    pub fn half_period_fs(&self) -> Result<u64, ConfigError> {
        let frequency = self.frequency()?;
        frequency.half_period_fs().ok_or_else(|| {
            ConfigError::invalid(
                "clock.frequency",
                format!("{frequency} has no representable half period"),
            )
        })
    }
}

/// Limits applied to attached debug sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Maximum number of concurrently attached network sessions.
    pub max_sessions: usize,
    /// Capacity of the per-session event buffers before a slow client lags.
    pub event_capacity: usize,
    /// Maximum number of transitions returned by one spool query.
    pub max_query_samples: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            event_capacity: 1024,
            max_query_samples: 65_536,
        }
    }
}
