//! Simulated time and the clock that drives it.

use crate::agent::Agent;
use crate::design::{PortId, SimulatedDesign};
use crate::error::AgentError;
use crate::time::{SimDuration, SimTime};
use vigil_common::{Frequency, LogicVec};

/// The single source of simulated time. Time only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAuthority {
    now: SimTime,
}

impl TimeAuthority {
    /// Starts the clock at `start`.
    pub fn new(start: SimTime) -> Self {
        Self { now: start }
    }

    /// Returns the current time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Moves time forward by exactly `duration` and returns the new time.
    pub fn advance(&mut self, duration: SimDuration) -> Result<SimTime, AgentError> {
        if !duration.is_positive() {
            return Err(AgentError::InvalidDuration { duration });
        }
        self.now = self
            .now
            .checked_add(duration)
            .ok_or(AgentError::TimeOverflow {
                now: self.now,
                duration,
            })?;
        Ok(self.now)
    }
}

impl Default for TimeAuthority {
    fn default() -> Self {
        Self::new(SimTime::ZERO)
    }
}

/// Toggles a one-bit clock port every half period.
///
/// Each half cycle advances time, writes the new clock level and steps the
/// agent. The first half cycle drives the clock low.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockDriver {
    port: PortId,
    half_period: SimDuration,
    level: bool,
}

impl ClockDriver {
    /// Creates a driver for `port` with the given half period.
    pub fn new(port: PortId, half_period: SimDuration) -> Result<Self, AgentError> {
        if !half_period.is_positive() {
            return Err(AgentError::InvalidDuration {
                duration: half_period,
            });
        }
        Ok(Self {
            port,
            half_period,
            level: true,
        })
    }

    /// Creates a driver whose half period matches `frequency`.
    pub fn from_frequency(port: PortId, frequency: Frequency) -> Result<Self, AgentError> {
        let half = frequency
            .half_period_fs()
            .and_then(|fs| i64::try_from(fs).ok())
            .ok_or_else(|| AgentError::InvalidValue {
                reason: format!("clock frequency {frequency} has no usable half period"),
            })?;
        Self::new(port, SimDuration::from_fs(half))
    }

    /// Returns the driven port.
    pub fn port(&self) -> PortId {
        self.port
    }

    /// Returns the half period.
    pub fn half_period(&self) -> SimDuration {
        self.half_period
    }

    /// Returns the level written by the last half cycle.
    pub fn level(&self) -> bool {
        self.level
    }

    /// Advances half a period, toggles the clock and steps the agent.
    pub fn half_cycle<D: SimulatedDesign>(&mut self, agent: &mut Agent<D>) -> Result<(), AgentError> {
        self.drive(agent, !self.level)
    }

    /// Runs one full period: clock low, then clock high.
    pub fn cycle<D: SimulatedDesign>(&mut self, agent: &mut Agent<D>) -> Result<(), AgentError> {
        self.drive(agent, false)?;
        self.drive(agent, true)
    }

    fn drive<D: SimulatedDesign>(
        &mut self,
        agent: &mut Agent<D>,
        level: bool,
    ) -> Result<(), AgentError> {
        agent.advance(self.half_period)?;
        agent.set(self.port, LogicVec::from_bool(level))?;
        self.level = level;
        agent.step()
    }

    /// Runs `n` full periods.
    pub fn cycles<D: SimulatedDesign>(
        &mut self,
        agent: &mut Agent<D>,
        n: u64,
    ) -> Result<(), AgentError> {
        for _ in 0..n {
            self.cycle(agent)?;
        }
        Ok(())
    }
}
