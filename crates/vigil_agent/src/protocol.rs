//! The debug wire protocol.
//!
//! Every packet is one JSON document followed by a NUL byte. A client opens
//! with a greeting, then sends commands and receives one response (or error)
//! per command, in order. Events such as pauses and subscribed transitions
//! arrive unsolicited between responses.
//!
//! ```text
//! -> {"type":"greeting","version":0}
//! <- {"type":"greeting","version":0,"commands":[...],"events":[...]}
//! -> {"type":"command","command":"inspect_ports","ports":["top.count"]}
//! <- {"type":"response","command":"inspect_ports","time":"0.000000006000000","values":{"top.count":"00000011"}}
//! <- {"type":"event","event":"simulation_paused","time":"...","causes":[{"kind":"breakpoint","id":1}]}
//! ```

use crate::breakpoint::{BreakCondition, Breakpoint, BreakpointState, PortPredicate};
use crate::design::{Location, Port, PortDirection};
use crate::error::AgentError;
use crate::snapshot::{parse_port_value, resolve_port, PauseCause, SimulationStatus};
use crate::time::SimTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version exchanged in the greeting.
pub const PROTOCOL_VERSION: u32 = 0;

/// Byte that terminates every packet.
pub const FRAME_TERMINATOR: u8 = 0;

/// Upper bound on the size of a single incoming packet.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Errors in the framing or content of a packet.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The packet was empty.
    #[error("empty packet")]
    Empty,
    /// The packet exceeded [`MAX_FRAME_LEN`].
    #[error("packet of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge {
        /// Size of the rejected packet.
        len: usize,
    },
    /// The packet was not valid JSON or not a known packet shape.
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The client greeted with an unsupported version.
    #[error("unsupported protocol version {actual}, expected {expected}")]
    VersionMismatch {
        /// Version the server speaks.
        expected: u32,
        /// Version the client sent.
        actual: u32,
    },
    /// The first packet was not a greeting.
    #[error("expected a greeting before any command")]
    NotGreeted,
    /// A second greeting arrived on an open session.
    #[error("session is already greeted")]
    AlreadyGreeted,
}

impl ProtocolError {
    /// Stable error code sent to debug clients.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Empty | ProtocolError::Malformed(_) => "malformed_packet",
            ProtocolError::TooLarge { .. } => "packet_too_large",
            ProtocolError::VersionMismatch { .. } => "version_mismatch",
            ProtocolError::NotGreeted => "not_greeted",
            ProtocolError::AlreadyGreeted => "already_greeted",
        }
    }
}

/// A packet sent by a debug client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPacket {
    /// Opens the session.
    Greeting {
        /// Protocol version the client speaks.
        version: u32,
    },
    /// A command.
    Command(Command),
}

/// A command from a debug client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Lists every port.
    ListPorts,
    /// Reports status, time and pause causes.
    GetSimulationStatus,
    /// Reads committed port values. An empty list reads every port.
    InspectPorts {
        /// Port names.
        #[serde(default)]
        ports: Vec<String>,
    },
    /// Stages a port write, applied at the next step.
    ForcePort {
        /// Port name.
        port: String,
        /// Value, MSB first, using `0`, `1`, `x`, `z`.
        value: String,
    },
    /// Adds a breakpoint.
    AddBreakpoint {
        /// Optional label.
        #[serde(default)]
        label: Option<String>,
        /// Firing condition.
        condition: WireCondition,
    },
    /// Removes a breakpoint.
    RemoveBreakpoint {
        /// Breakpoint id.
        id: u32,
    },
    /// Lists every breakpoint.
    ListBreakpoints,
    /// Resumes a paused simulation, optionally pausing again at a time.
    Continue {
        /// Wire-form time at which to pause again.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until_time: Option<String>,
    },
    /// Pauses at the next step boundary.
    Pause,
    /// Runs exactly one step while paused, then pauses again.
    Step,
    /// Streams future transitions of the named ports.
    Subscribe {
        /// Port names.
        ports: Vec<String>,
    },
    /// Stops streaming the named ports. An empty list stops all.
    Unsubscribe {
        /// Port names.
        #[serde(default)]
        ports: Vec<String>,
    },
    /// Reads recorded transitions in `[begin, end)` from the spool.
    QueryInterval {
        /// Wire-form start time, inclusive.
        begin: String,
        /// Wire-form end time, exclusive.
        end: String,
        /// Port names. An empty list selects every port.
        #[serde(default)]
        ports: Vec<String>,
    },
    /// Ends the session.
    Detach,
}

/// Names of every command, as sent in the greeting.
pub const COMMAND_NAMES: &[&str] = &[
    "list_ports",
    "get_simulation_status",
    "inspect_ports",
    "force_port",
    "add_breakpoint",
    "remove_breakpoint",
    "list_breakpoints",
    "continue",
    "pause",
    "step",
    "subscribe",
    "unsubscribe",
    "query_interval",
    "detach",
];

/// Names of every event, as sent in the greeting.
pub const EVENT_NAMES: &[&str] = &[
    "simulation_paused",
    "simulation_resumed",
    "simulation_finished",
    "transition",
    "agent_fault",
];

/// A breakpoint condition on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireCondition {
    /// Pause when time reaches `time`.
    Time {
        /// Wire-form time.
        time: String,
    },
    /// Pause when the design reports the named location.
    Location {
        /// Location name.
        name: String,
    },
    /// Pause when a port equals a value.
    Equals {
        /// Port name.
        port: String,
        /// Value string.
        value: String,
    },
    /// Pause when a port changes.
    Changed {
        /// Port name.
        port: String,
    },
    /// Pause when a port has an X or Z bit.
    Unknown {
        /// Port name.
        port: String,
    },
}

/// A packet sent by the agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPacket {
    /// Answers the client greeting.
    Greeting {
        /// Protocol version.
        version: u32,
        /// Supported commands.
        commands: Vec<String>,
        /// Events the agent may send.
        events: Vec<String>,
    },
    /// Successful answer to a command.
    Response(Response),
    /// Failed answer to a command.
    Error {
        /// Stable error code.
        error: String,
        /// Human-readable message.
        message: String,
    },
    /// Unsolicited notification.
    Event(Event),
}

impl ServerPacket {
    /// Returns the server greeting.
    pub fn greeting() -> Self {
        ServerPacket::Greeting {
            version: PROTOCOL_VERSION,
            commands: COMMAND_NAMES.iter().map(|c| c.to_string()).collect(),
            events: EVENT_NAMES.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Builds an error packet from an agent error.
    pub fn error(err: &AgentError) -> Self {
        ServerPacket::Error {
            error: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Builds an error packet from a protocol error.
    pub fn protocol_error(err: &ProtocolError) -> Self {
        ServerPacket::Error {
            error: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Successful command results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Response {
    /// Every port.
    ListPorts {
        /// Port descriptions.
        ports: Vec<WirePort>,
    },
    /// Current status.
    GetSimulationStatus {
        /// Status.
        status: SimulationStatus,
        /// Wire-form time of the last commit.
        latest_time: String,
        /// Pause causes.
        causes: Vec<WireCause>,
        /// Completed steps.
        steps: u64,
    },
    /// Committed values.
    InspectPorts {
        /// Wire-form time the values hold at.
        time: String,
        /// Value of each requested port.
        values: BTreeMap<String, String>,
    },
    /// The write is staged.
    ForcePort {},
    /// The breakpoint is armed.
    AddBreakpoint {
        /// New breakpoint id.
        id: u32,
    },
    /// The breakpoint is cleared.
    RemoveBreakpoint {},
    /// Every breakpoint.
    ListBreakpoints {
        /// Breakpoint descriptions.
        breakpoints: Vec<WireBreakpoint>,
    },
    /// The simulation resumed.
    Continue {},
    /// A pause is requested.
    Pause {},
    /// The single step completed.
    Step {
        /// Wire-form time after the step.
        time: String,
    },
    /// Current subscription set.
    Subscribe {
        /// Subscribed port names.
        ports: Vec<String>,
    },
    /// Current subscription set.
    Unsubscribe {
        /// Subscribed port names.
        ports: Vec<String>,
    },
    /// Recorded transitions.
    QueryInterval {
        /// Transitions in time order.
        samples: Vec<WireSample>,
        /// More transitions matched than were returned.
        truncated: bool,
        /// The spool ended with a torn record.
        corrupt_tail: bool,
    },
    /// The session is closing.
    Detach {},
}

/// Unsolicited notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The simulation paused.
    SimulationPaused {
        /// Wire-form pause time.
        time: String,
        /// Why.
        causes: Vec<WireCause>,
    },
    /// The simulation resumed.
    SimulationResumed {
        /// Wire-form resume time.
        time: String,
    },
    /// The simulation finished.
    SimulationFinished {
        /// Wire-form final time.
        time: String,
    },
    /// A subscribed port changed.
    Transition(WireSample),
    /// The agent stopped on a fatal error.
    AgentFault {
        /// Error message.
        message: String,
    },
}

/// A port description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePort {
    /// Hierarchical name.
    pub name: String,
    /// Width in bits.
    pub width: u32,
    /// Direction.
    pub direction: PortDirection,
}

impl From<&Port> for WirePort {
    fn from(port: &Port) -> Self {
        Self {
            name: port.name.clone(),
            width: port.width,
            direction: port.direction,
        }
    }
}

/// One port value at one time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSample {
    /// Wire-form time.
    pub time: String,
    /// Port name.
    pub port: String,
    /// Value string.
    pub value: String,
}

/// A pause cause on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireCause {
    /// A breakpoint matched.
    Breakpoint {
        /// Breakpoint id.
        id: u32,
    },
    /// The driver loop reached a pause point.
    Location {
        /// Location name.
        name: String,
    },
    /// A session single-stepped.
    SingleStep {
        /// Session id.
        session: u64,
    },
    /// A session requested a pause.
    Request {
        /// Session id.
        session: u64,
    },
    /// A run-until time was reached.
    UntilTime {
        /// Session id.
        session: u64,
        /// Wire-form time.
        time: String,
    },
}

impl From<&PauseCause> for WireCause {
    fn from(cause: &PauseCause) -> Self {
        match cause {
            PauseCause::Breakpoint(id) => WireCause::Breakpoint { id: id.as_raw() },
            PauseCause::Location(l) => WireCause::Location {
                name: l.as_str().to_string(),
            },
            PauseCause::SingleStep(s) => WireCause::SingleStep {
                session: s.as_raw(),
            },
            PauseCause::Request(s) => WireCause::Request {
                session: s.as_raw(),
            },
            PauseCause::UntilTime { session, time } => WireCause::UntilTime {
                session: session.as_raw(),
                time: time.to_wire(),
            },
        }
    }
}

/// Converts a list of pause causes.
pub fn wire_causes(causes: &[PauseCause]) -> Vec<WireCause> {
    causes.iter().map(WireCause::from).collect()
}

/// A breakpoint description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBreakpoint {
    /// Breakpoint id.
    pub id: u32,
    /// Label.
    pub label: String,
    /// Condition.
    pub condition: WireCondition,
    /// Lifecycle state.
    pub state: BreakpointState,
    /// Times the condition matched.
    pub hit_count: u64,
}

impl WireBreakpoint {
    /// Describes a breakpoint using port names from `ports`.
    pub fn new(bp: &Breakpoint, ports: &[Port]) -> Self {
        Self {
            id: bp.id.as_raw(),
            label: bp.label.clone(),
            condition: condition_to_wire(&bp.condition, ports),
            state: bp.state,
            hit_count: bp.hit_count,
        }
    }
}

fn port_name(ports: &[Port], port: crate::design::PortId) -> String {
    ports
        .get(port.index())
        .map(|p| p.name.clone())
        .unwrap_or_else(|| port.to_string())
}

/// Converts a condition to its wire form.
pub fn condition_to_wire(condition: &BreakCondition, ports: &[Port]) -> WireCondition {
    match condition {
        BreakCondition::AtTime(t) => WireCondition::Time { time: t.to_wire() },
        BreakCondition::Location(l) => WireCondition::Location {
            name: l.as_str().to_string(),
        },
        BreakCondition::Predicate(PortPredicate::Equals { port, value }) => {
            WireCondition::Equals {
                port: port_name(ports, *port),
                value: value.to_string(),
            }
        }
        BreakCondition::Predicate(PortPredicate::Changed { port }) => WireCondition::Changed {
            port: port_name(ports, *port),
        },
        BreakCondition::Predicate(PortPredicate::Unknown { port }) => WireCondition::Unknown {
            port: port_name(ports, *port),
        },
    }
}

/// Resolves a wire condition against the design's ports.
pub fn condition_from_wire(
    condition: &WireCondition,
    ports: &[Port],
) -> Result<BreakCondition, AgentError> {
    Ok(match condition {
        WireCondition::Time { time } => BreakCondition::AtTime(parse_wire_time(time)?),
        WireCondition::Location { name } => BreakCondition::Location(Location::new(name.clone())),
        WireCondition::Equals { port, value } => {
            let port = resolve_port(ports, port)?;
            BreakCondition::Predicate(PortPredicate::Equals {
                port: port.id,
                value: parse_port_value(port, value)?,
            })
        }
        WireCondition::Changed { port } => BreakCondition::Predicate(PortPredicate::Changed {
            port: resolve_port(ports, port)?.id,
        }),
        WireCondition::Unknown { port } => BreakCondition::Predicate(PortPredicate::Unknown {
            port: resolve_port(ports, port)?.id,
        }),
    })
}

/// Parses a wire-form time, reporting failures as [`AgentError::InvalidValue`].
pub fn parse_wire_time(text: &str) -> Result<SimTime, AgentError> {
    SimTime::from_wire(text).map_err(|e| AgentError::InvalidValue {
        reason: e.to_string(),
    })
}

/// Serializes a packet and appends the terminator.
pub fn encode_frame<T: Serialize>(packet: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = serde_json::to_vec(packet)?;
    frame.push(FRAME_TERMINATOR);
    Ok(frame)
}

/// Parses one packet. A trailing terminator is ignored.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    let body = frame.strip_suffix(&[FRAME_TERMINATOR]).unwrap_or(frame);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::Empty);
    }
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge { len: body.len() });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Checks the first packet of a session.
pub fn check_greeting(packet: &ClientPacket) -> Result<(), ProtocolError> {
    match packet {
        ClientPacket::Greeting { version } if *version == PROTOCOL_VERSION => Ok(()),
        ClientPacket::Greeting { version } => Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: *version,
        }),
        ClientPacket::Command(_) => Err(ProtocolError::NotGreeted),
    }
}
