//! Read-only views of the committed simulation state.

use crate::breakpoint::{Breakpoint, BreakpointId};
use crate::design::{Location, Port, PortId};
use crate::error::AgentError;
use crate::session::SessionId;
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vigil_common::LogicVec;

/// Coarse state of the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    /// The driver loop is stepping.
    Running,
    /// The agent is holding the driver loop at a pause.
    Paused,
    /// The agent finished normally.
    Finished,
    /// A fatal error stopped the agent.
    Faulted,
}

/// Why the simulation is paused. A pause can have several causes at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PauseCause {
    /// A breakpoint matched.
    Breakpoint(BreakpointId),
    /// The driver loop reached a pause point.
    Location(Location),
    /// A session single-stepped.
    SingleStep(SessionId),
    /// A session asked for a pause.
    Request(SessionId),
    /// A session's run-until time was reached.
    UntilTime {
        /// The requesting session.
        session: SessionId,
        /// The requested time.
        time: SimTime,
    },
}

impl PauseCause {
    /// Returns the session that caused the pause, if a session did.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            PauseCause::SingleStep(s) | PauseCause::Request(s) => Some(*s),
            PauseCause::UntilTime { session, .. } => Some(*session),
            PauseCause::Breakpoint(_) | PauseCause::Location(_) => None,
        }
    }
}

/// The committed state after a step or control change.
///
/// Snapshots are immutable and shared. Every session that reads the same
/// snapshot sees the same values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Time of the last commit.
    pub time: SimTime,
    /// Simulation status.
    pub status: SimulationStatus,
    /// Pause causes, empty unless paused.
    pub causes: Vec<PauseCause>,
    /// All design ports.
    pub ports: Arc<[Port]>,
    /// Committed value of every port, indexed by port id.
    pub values: Vec<LogicVec>,
    /// Live breakpoints.
    pub breakpoints: Vec<Breakpoint>,
    /// Number of completed steps.
    pub steps: u64,
    /// Number of attached sessions.
    pub sessions: usize,
}

impl Snapshot {
    /// Returns the committed value of a port.
    pub fn value(&self, port: PortId) -> Option<&LogicVec> {
        self.values.get(port.index())
    }

    /// Looks up a port by name.
    pub fn port(&self, name: &str) -> Option<&Port> {
        find_port(&self.ports, name)
    }

    /// Returns `true` while the simulation is paused.
    pub fn is_paused(&self) -> bool {
        self.status == SimulationStatus::Paused
    }
}

pub(crate) fn find_port<'a>(ports: &'a [Port], name: &str) -> Option<&'a Port> {
    ports.iter().find(|p| p.name == name)
}

pub(crate) fn resolve_port<'a>(ports: &'a [Port], name: &str) -> Result<&'a Port, AgentError> {
    find_port(ports, name).ok_or_else(|| AgentError::UnknownPort {
        port: name.to_string(),
    })
}

/// Parses a port value string and checks it against the port width.
pub(crate) fn parse_port_value(port: &Port, text: &str) -> Result<LogicVec, AgentError> {
    let value: LogicVec = text.parse().map_err(|e| AgentError::InvalidValue {
        reason: format!("{}: {e}", port.name),
    })?;
    if value.width() != port.width {
        return Err(AgentError::WidthMismatch {
            port: port.name.clone(),
            expected: port.width,
            actual: value.width(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::PortDirection;

    fn ports() -> Arc<[Port]> {
        vec![Port {
            id: PortId::from_raw(0),
            name: "top.bus".into(),
            width: 4,
            direction: PortDirection::Input,
        }]
        .into()
    }

    #[test]
    fn cause_sessions() {
        let s = SessionId::from_raw(3);
        assert_eq!(PauseCause::SingleStep(s).session(), Some(s));
        assert_eq!(
            PauseCause::UntilTime {
                session: s,
                time: SimTime::ZERO
            }
            .session(),
            Some(s)
        );
        assert_eq!(
            PauseCause::Breakpoint(BreakpointId::from_raw(1)).session(),
            None
        );
    }

    #[test]
    fn lookup_by_name() {
        let snapshot = Snapshot {
            time: SimTime::ZERO,
            status: SimulationStatus::Running,
            causes: Vec::new(),
            ports: ports(),
            values: vec![LogicVec::from_u64(5, 4)],
            breakpoints: Vec::new(),
            steps: 0,
            sessions: 0,
        };
        let port = snapshot.port("top.bus").unwrap();
        assert_eq!(snapshot.value(port.id).unwrap().to_u64(), Some(5));
        assert!(snapshot.port("top.nope").is_none());
        assert!(!snapshot.is_paused());
    }

    #[test]
    fn value_parsing_checks_width() {
        let ports = ports();
        assert_eq!(
            parse_port_value(&ports[0], "10x1").unwrap().to_string(),
            "10X1"
        );
        assert!(matches!(
            parse_port_value(&ports[0], "1"),
            Err(AgentError::WidthMismatch { expected: 4, actual: 1, .. })
        ));
        assert!(matches!(
            parse_port_value(&ports[0], "12"),
            Err(AgentError::InvalidValue { .. })
        ));
        assert!(matches!(
            resolve_port(&ports, "top.x"),
            Err(AgentError::UnknownPort { .. })
        ));
    }
}
