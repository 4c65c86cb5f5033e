//! Live debugging and trace capture for cycle-driven hardware simulation.
//!
//! An [`Agent`] owns one [`SimulatedDesign`], the simulated clock and a
//! waveform spool. The caller's driver loop advances time, writes inputs and
//! steps the agent; every step commits changed ports to the spool and gives
//! attached debuggers a chance to act. Debuggers connect over TCP
//! ([`Agent::start_debugging`]) or in process ([`Agent::connector`]), inspect
//! committed state, force inputs, set breakpoints and pause, step or resume
//! the simulation.
//!
//! # Modules
//!
//! - `time`: Femtosecond time points, durations and their text forms
//! - `design`: The design boundary and the reference `Counter`
//! - `clock`: Time authority and clock driver
//! - `spool`: Append-only transition log, reader and replay
//! - `waveform`: VCD export of spools
//! - `breakpoint`: Breakpoint conditions and lifecycle
//! - `snapshot`: Immutable views of committed state
//! - `protocol`: JSON debug wire protocol
//! - `session`: Debug sessions and in-process connections
//! - `link`: TCP debug link
//! - `agent`: The orchestrator

#![warn(missing_docs)]

pub mod agent;
pub mod breakpoint;
pub mod clock;
pub mod design;
pub mod error;
pub mod link;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod spool;
pub mod time;
pub mod waveform;

pub use agent::Agent;
pub use breakpoint::{
    BreakCondition, Breakpoint, BreakpointController, BreakpointId, BreakpointState,
    PortPredicate,
};
pub use clock::{ClockDriver, TimeAuthority};
pub use design::{Counter, DesignFault, Location, Port, PortDirection, PortId, SimulatedDesign};
pub use error::AgentError;
pub use link::DebugLink;
pub use protocol::{ClientPacket, Command, Event, ProtocolError, Response, ServerPacket};
pub use session::{LocalSession, SessionConnector, SessionId, SessionInfo};
pub use snapshot::{PauseCause, SimulationStatus, Snapshot};
pub use spool::{replay, Replay, SpoolError, SpoolReader, SpoolRecord, SpoolWriter, Transition};
pub use time::{SimDuration, SimTime, TimeParseError};
pub use waveform::{export_vcd, ExportSummary, VcdWriter, WaveformError, WaveformSink};
