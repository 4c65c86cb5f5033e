//! Breakpoints evaluated by the agent after every step.
//!
//! A breakpoint moves through `Armed -> Hit -> Paused -> Armed` each time it
//! fires, or to `Cleared` when removed. The controller only tracks state; the
//! agent decides when a hit turns into a pause and when the pause ends.

use crate::design::{Location, PortId};
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use vigil_common::LogicVec;

/// Identifier of a breakpoint, unique for the lifetime of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointId(u32);

impl BreakpointId {
    /// Creates an id from its raw value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp{}", self.0)
    }
}

/// What makes a breakpoint fire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakCondition {
    /// Fires on the step whose time first reaches the given time.
    AtTime(SimTime),
    /// Fires when the design reports this evaluation point.
    Location(Location),
    /// Fires when a port predicate holds after settle.
    Predicate(PortPredicate),
}

/// A condition on one port's settled value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortPredicate {
    /// The port equals the value exactly, including X and Z bits.
    Equals {
        /// Port to watch.
        port: PortId,
        /// Value to compare against.
        value: LogicVec,
    },
    /// The port changed on this step.
    Changed {
        /// Port to watch.
        port: PortId,
    },
    /// The port has at least one X or Z bit.
    Unknown {
        /// Port to watch.
        port: PortId,
    },
}

impl PortPredicate {
    /// Returns the port the predicate watches.
    pub fn port(&self) -> PortId {
        match self {
            PortPredicate::Equals { port, .. }
            | PortPredicate::Changed { port }
            | PortPredicate::Unknown { port } => *port,
        }
    }
}

impl fmt::Display for BreakCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakCondition::AtTime(t) => write!(f, "time >= {t}"),
            BreakCondition::Location(l) => write!(f, "at {l}"),
            BreakCondition::Predicate(PortPredicate::Equals { port, value }) => {
                write!(f, "{port} == {value}")
            }
            BreakCondition::Predicate(PortPredicate::Changed { port }) => {
                write!(f, "{port} changed")
            }
            BreakCondition::Predicate(PortPredicate::Unknown { port }) => {
                write!(f, "{port} unknown")
            }
        }
    }
}

/// Lifecycle state of a breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointState {
    /// Waiting for its condition.
    Armed,
    /// Matched on the current step; a pause is about to start.
    Hit,
    /// Holding the simulation paused.
    Paused,
    /// Removed. Terminal.
    Cleared,
}

/// A breakpoint and its bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    /// Identifier.
    pub id: BreakpointId,
    /// Free-form label supplied by the creator.
    pub label: String,
    /// Firing condition.
    pub condition: BreakCondition,
    /// Current state.
    pub state: BreakpointState,
    /// Number of times the condition has matched.
    pub hit_count: u64,
}

/// The settled state a step produced, as seen by breakpoint evaluation.
#[derive(Debug, Clone, Copy)]
pub struct StepView<'a> {
    /// Time of the previous step, or `None` for the first step.
    pub previous_time: Option<SimTime>,
    /// Time of this step.
    pub time: SimTime,
    /// Location reported by the design after this settle.
    pub location: Option<&'a Location>,
    /// Committed value of every port, indexed by port id.
    pub values: &'a [LogicVec],
    /// Ports that changed on this step.
    pub changed: &'a [PortId],
}

impl BreakCondition {
    /// Returns `true` if the condition holds for the step.
    pub fn matches(&self, step: &StepView<'_>) -> bool {
        match self {
            BreakCondition::AtTime(t) => {
                step.previous_time.map_or(true, |prev| prev < *t) && *t <= step.time
            }
            BreakCondition::Location(location) => step.location == Some(location),
            BreakCondition::Predicate(PortPredicate::Equals { port, value }) => {
                step.values.get(port.index()) == Some(value)
            }
            BreakCondition::Predicate(PortPredicate::Changed { port }) => {
                step.changed.contains(port)
            }
            BreakCondition::Predicate(PortPredicate::Unknown { port }) => step
                .values
                .get(port.index())
                .is_some_and(|v| !v.is_known()),
        }
    }
}

/// Owns every breakpoint of an agent.
#[derive(Debug, Default)]
pub struct BreakpointController {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_id: u32,
}

impl BreakpointController {
    /// Creates an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an armed breakpoint and returns its id.
    pub fn add(&mut self, label: impl Into<String>, condition: BreakCondition) -> BreakpointId {
        self.next_id += 1;
        let id = BreakpointId(self.next_id);
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                label: label.into(),
                condition,
                state: BreakpointState::Armed,
                hit_count: 0,
            },
        );
        id
    }

    /// Removes a breakpoint, returning it in the `Cleared` state.
    pub fn clear(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        let mut bp = self.breakpoints.remove(&id)?;
        bp.state = BreakpointState::Cleared;
        Some(bp)
    }

    /// Looks up a breakpoint.
    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Iterates over all live breakpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Returns the number of live breakpoints.
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    /// Returns `true` when there are no breakpoints.
    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Evaluates every armed breakpoint against a step and moves the matching
    /// ones to `Hit`. Returns the ids that hit, in id order.
    pub fn evaluate(&mut self, step: &StepView<'_>) -> Vec<BreakpointId> {
        let mut hits = Vec::new();
        for bp in self.breakpoints.values_mut() {
            if bp.state == BreakpointState::Armed && bp.condition.matches(step) {
                bp.state = BreakpointState::Hit;
                bp.hit_count += 1;
                hits.push(bp.id);
            }
        }
        hits
    }

    /// Moves every hit breakpoint to `Paused`.
    pub fn enter_pause(&mut self) {
        for bp in self.breakpoints.values_mut() {
            if bp.state == BreakpointState::Hit {
                bp.state = BreakpointState::Paused;
            }
        }
    }

    /// Re-arms every hit or paused breakpoint. Called when a pause ends.
    pub fn rearm(&mut self) {
        for bp in self.breakpoints.values_mut() {
            if matches!(bp.state, BreakpointState::Hit | BreakpointState::Paused) {
                bp.state = BreakpointState::Armed;
            }
        }
    }
}
