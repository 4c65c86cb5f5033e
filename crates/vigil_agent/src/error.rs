//! Errors raised by the agent and reported to debug sessions.

use crate::breakpoint::BreakpointId;
use crate::design::DesignFault;
use crate::session::SessionId;
use crate::spool::SpoolError;
use crate::time::{SimDuration, SimTime};
use std::io;

/// Errors from agent operations and session commands.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Time may only advance by a strictly positive duration.
    #[error("invalid duration {duration}: time only advances by a positive amount")]
    InvalidDuration {
        /// The rejected duration.
        duration: SimDuration,
    },

    /// Advancing would overflow the femtosecond counter.
    #[error("advancing {now} by {duration} overflows simulated time")]
    TimeOverflow {
        /// Current time.
        now: SimTime,
        /// The rejected duration.
        duration: SimDuration,
    },

    /// The command mutates simulation state and the simulation is paused.
    #[error("simulation is paused")]
    SimulationPaused,

    /// The command needs a paused simulation.
    #[error("simulation is not paused")]
    NotPaused,

    /// The session's connection is gone.
    #[error("{session} disconnected")]
    LinkDisconnected {
        /// The lost session.
        session: SessionId,
    },

    /// No port has the given name or id.
    #[error("unknown port '{port}'")]
    UnknownPort {
        /// The name or id that did not resolve.
        port: String,
    },

    /// A value's width does not match its port.
    #[error("port '{port}' is {expected} bits wide, value has {actual}")]
    WidthMismatch {
        /// Port name.
        port: String,
        /// Port width.
        expected: u32,
        /// Value width.
        actual: u32,
    },

    /// The port is an output and cannot be written.
    #[error("port '{port}' is not writable")]
    PortNotWritable {
        /// Port name.
        port: String,
    },

    /// A value or time in a command could not be parsed.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// What was wrong.
        reason: String,
    },

    /// No breakpoint has the given id.
    #[error("unknown breakpoint {id}")]
    UnknownBreakpoint {
        /// The id that did not resolve.
        id: BreakpointId,
    },

    /// The design's ports are not usable by the agent.
    #[error("invalid design: {reason}")]
    InvalidDesign {
        /// What was wrong.
        reason: String,
    },

    /// The session limit is reached.
    #[error("too many sessions: limit is {limit}")]
    TooManySessions {
        /// Configured maximum.
        limit: usize,
    },

    /// The debug link is already running.
    #[error("debugging already started")]
    AlreadyDebugging,

    /// The debug link could not be started.
    #[error("debug link error: {0}")]
    Link(#[from] io::Error),

    /// The design reported a fault.
    #[error(transparent)]
    Design(#[from] DesignFault),

    /// The spool could not be written or read.
    #[error(transparent)]
    Spool(#[from] SpoolError),

    /// An earlier fatal error stopped the agent.
    #[error("agent faulted: {reason}")]
    Faulted {
        /// The underlying error.
        reason: String,
    },

    /// The simulation has finished.
    #[error("simulation finished")]
    Finished,
}

impl AgentError {
    /// Stable error code sent to debug clients.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidDuration { .. } => "invalid_duration",
            AgentError::TimeOverflow { .. } => "time_overflow",
            AgentError::SimulationPaused => "simulation_paused",
            AgentError::NotPaused => "not_paused",
            AgentError::LinkDisconnected { .. } => "link_disconnected",
            AgentError::UnknownPort { .. } => "unknown_port",
            AgentError::WidthMismatch { .. } => "width_mismatch",
            AgentError::PortNotWritable { .. } => "port_not_writable",
            AgentError::InvalidValue { .. } => "invalid_value",
            AgentError::UnknownBreakpoint { .. } => "unknown_breakpoint",
            AgentError::InvalidDesign { .. } => "invalid_design",
            AgentError::TooManySessions { .. } => "too_many_sessions",
            AgentError::AlreadyDebugging => "already_debugging",
            AgentError::Link(_) => "link_error",
            AgentError::Design(_) => "design_fault",
            AgentError::Spool(SpoolError::OutOfOrderWrite { .. }) => "out_of_order_write",
            AgentError::Spool(SpoolError::CorruptTrailingRecord { .. }) => {
                "corrupt_trailing_record"
            }
            AgentError::Spool(_) => "spool_error",
            AgentError::Faulted { .. } => "agent_faulted",
            AgentError::Finished => "simulation_finished",
        }
    }

    /// Returns `true` for errors that stop the stepping loop for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Design(_) | AgentError::Spool(_) | AgentError::Faulted { .. }
        )
    }
}
