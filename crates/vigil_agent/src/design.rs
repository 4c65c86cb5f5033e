//! The boundary between the harness and the simulated circuit.
//!
//! The harness treats a design as a black box that exposes ports, accepts
//! staged input writes, and settles to a new state on request. [`Counter`] is
//! a small reference design used by the CLI and the test suite.

use serde::{Deserialize, Serialize};
use std::fmt;
use vigil_common::{Logic, LogicVec};

/// Dense identifier of a design port.
///
/// Ids index the slice returned by [`SimulatedDesign::ports`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(u32);

impl PortId {
    /// Creates a port id from its raw index.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw index.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize` for slice access.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Direction of a port as seen from outside the design.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    /// Driven by the harness.
    Input,
    /// Driven by the design.
    Output,
    /// Bidirectional.
    Inout,
}

impl PortDirection {
    /// Returns `true` if the harness may write this port.
    pub fn is_writable(self) -> bool {
        !matches!(self, PortDirection::Output)
    }
}

/// A named signal port of the design. Immutable after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Dense identifier.
    pub id: PortId,
    /// Hierarchical name, dot separated (`"top.counter.clk"`).
    pub name: String,
    /// Width in bits.
    pub width: u32,
    /// Direction.
    pub direction: PortDirection,
}

/// A named evaluation point reported by a design or passed by the driver loop.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(String);

impl Location {
    /// Creates a location from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Expands to a [`Location`] naming the current source file and line.
#[macro_export]
macro_rules! location {
    () => {
        $crate::design::Location::new(concat!(file!(), ":", line!()))
    };
}

/// An error reported by the design itself, such as a failed settle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("design fault: {message}")]
pub struct DesignFault {
    /// Description of the fault.
    pub message: String,
}

impl DesignFault {
    /// Creates a fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A simulated circuit driven by the agent.
///
/// Writes are staged and only become visible through [`get`](Self::get) after
/// the next [`settle`](Self::settle). Settling twice without an intervening
/// write must not change any port.
pub trait SimulatedDesign {
    /// Returns every port. Ids must equal their position in the slice.
    fn ports(&self) -> &[Port];

    /// Stages a value for an input or inout port.
    fn set(&mut self, port: PortId, value: LogicVec) -> Result<(), DesignFault>;

    /// Returns the settled value of a port, or `None` for an unknown id.
    fn get(&self, port: PortId) -> Option<LogicVec>;

    /// Applies staged writes and evaluates the design to a stable state.
    fn settle(&mut self) -> Result<(), DesignFault>;

    /// Names the evaluation point reached by the last settle, if any.
    fn location_tag(&self) -> Option<Location> {
        None
    }
}

const CLK: usize = 0;
const RST: usize = 1;
const EN: usize = 2;
const COUNT: usize = 3;
const CARRY: usize = 4;

/// A synchronous up-counter with reset, enable and carry out.
///
/// On a `0 -> 1` clock edge the count clears while reset is high and
/// increments while enable is high. An unknown reset or enable makes the count
/// unknown. `carry` is enable AND count-all-ones. The settle on which the count
/// wraps to zero reports the location `"<instance>.wrap"`.
#[derive(Debug, Clone)]
pub struct Counter {
    ports: Vec<Port>,
    values: Vec<LogicVec>,
    staged: Vec<Option<LogicVec>>,
    last_clk: Logic,
    wrap: Location,
    location: Option<Location>,
}

impl Counter {
    /// Clock input.
    pub const CLK: PortId = PortId(CLK as u32);
    /// Synchronous reset input.
    pub const RST: PortId = PortId(RST as u32);
    /// Count enable input.
    pub const EN: PortId = PortId(EN as u32);
    /// Count output.
    pub const COUNT: PortId = PortId(COUNT as u32);
    /// Carry output.
    pub const CARRY: PortId = PortId(CARRY as u32);

    /// Creates a counter named `instance` with a `width`-bit count, clamped to 1..=64.
    pub fn new(instance: &str, width: u32) -> Self {
        let width = width.clamp(1, 64);
        let port = |id: usize, name: &str, width: u32, direction: PortDirection| Port {
            id: PortId(id as u32),
            name: format!("{instance}.{name}"),
            width,
            direction,
        };
        let ports = vec![
            port(CLK, "clk", 1, PortDirection::Input),
            port(RST, "rst", 1, PortDirection::Input),
            port(EN, "en", 1, PortDirection::Input),
            port(COUNT, "count", width, PortDirection::Output),
            port(CARRY, "carry", 1, PortDirection::Output),
        ];
        let values = vec![
            LogicVec::unknown(1),
            LogicVec::from_bool(false),
            LogicVec::from_bool(true),
            LogicVec::zeros(width),
            LogicVec::from_bool(false),
        ];
        Self {
            staged: vec![None; ports.len()],
            ports,
            values,
            last_clk: Logic::X,
            wrap: Location::new(format!("{instance}.wrap")),
            location: None,
        }
    }

    fn next_count(&mut self) -> LogicVec {
        let width = self.ports[COUNT].width;
        let current = &self.values[COUNT];
        match (self.values[RST].get(0), self.values[EN].get(0)) {
            (Logic::One, _) => LogicVec::zeros(width),
            (Logic::Zero, Logic::Zero) => current.clone(),
            (Logic::Zero, Logic::One) => match current.to_u64() {
                Some(n) => {
                    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
                    let next = n.wrapping_add(1) & mask;
                    if next == 0 {
                        self.location = Some(self.wrap.clone());
                    }
                    LogicVec::from_u64(next, width)
                }
                None => LogicVec::unknown(width),
            },
            _ => LogicVec::unknown(width),
        }
    }
}

impl SimulatedDesign for Counter {
    fn ports(&self) -> &[Port] {
        &self.ports
    }

    fn set(&mut self, port: PortId, value: LogicVec) -> Result<(), DesignFault> {
        let Some(decl) = self.ports.get(port.index()) else {
            return Err(DesignFault::new(format!("no such port {port}")));
        };
        if !decl.direction.is_writable() {
            return Err(DesignFault::new(format!("{} is an output", decl.name)));
        }
        if value.width() != decl.width {
            return Err(DesignFault::new(format!(
                "{} is {} bits wide, got {}",
                decl.name,
                decl.width,
                value.width()
            )));
        }
        self.staged[port.index()] = Some(value);
        Ok(())
    }

    fn get(&self, port: PortId) -> Option<LogicVec> {
        self.values.get(port.index()).cloned()
    }

    fn settle(&mut self) -> Result<(), DesignFault> {
        for (slot, staged) in self.values.iter_mut().zip(self.staged.iter_mut()) {
            if let Some(value) = staged.take() {
                *slot = value;
            }
        }
        self.location = None;
        let clk = self.values[CLK].get(0);
        if self.last_clk == Logic::Zero && clk == Logic::One {
            self.values[COUNT] = self.next_count();
        }
        self.last_clk = clk;

        let count = &self.values[COUNT];
        let full = if count.is_known() {
            Logic::from(count.is_all_one())
        } else {
            Logic::X
        };
        self.values[CARRY] = LogicVec::filled(1, self.values[EN].get(0) & full);
        Ok(())
    }

    fn location_tag(&self) -> Option<Location> {
        self.location.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(counter: &mut Counter) {
        counter.set(Counter::CLK, LogicVec::from_bool(false)).unwrap();
        counter.settle().unwrap();
        counter.set(Counter::CLK, LogicVec::from_bool(true)).unwrap();
        counter.settle().unwrap();
    }

    fn count(counter: &Counter) -> Option<u64> {
        counter.get(Counter::COUNT).unwrap().to_u64()
    }

    #[test]
    fn ports_are_dense_and_named() {
        let counter = Counter::new("top", 4);
        for (i, port) in counter.ports().iter().enumerate() {
            assert_eq!(port.id.index(), i);
            assert!(port.name.starts_with("top."));
        }
        assert_eq!(counter.ports()[COUNT].width, 4);
        assert_eq!(counter.get(Counter::CLK).unwrap().to_string(), "X");
    }

    #[test]
    fn counts_on_rising_edges() {
        let mut counter = Counter::new("top", 4);
        tick(&mut counter);
        tick(&mut counter);
        assert_eq!(count(&counter), Some(2));
    }

    #[test]
    fn writes_are_staged_until_settle() {
        let mut counter = Counter::new("top", 4);
        counter.set(Counter::EN, LogicVec::from_bool(false)).unwrap();
        assert_eq!(counter.get(Counter::EN).unwrap().to_u64(), Some(1));
        counter.settle().unwrap();
        assert_eq!(counter.get(Counter::EN).unwrap().to_u64(), Some(0));
        tick(&mut counter);
        assert_eq!(count(&counter), Some(0));
    }

    #[test]
    fn settle_is_idempotent() {
        let mut counter = Counter::new("top", 4);
        tick(&mut counter);
        let before: Vec<_> = (0..5).map(|i| counter.get(PortId(i)).unwrap()).collect();
        counter.settle().unwrap();
        let after: Vec<_> = (0..5).map(|i| counter.get(PortId(i)).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn reset_clears_count() {
        let mut counter = Counter::new("top", 4);
        tick(&mut counter);
        counter.set(Counter::RST, LogicVec::from_bool(true)).unwrap();
        tick(&mut counter);
        assert_eq!(count(&counter), Some(0));
    }

    #[test]
    fn unknown_enable_poisons_count() {
        let mut counter = Counter::new("top", 4);
        counter.set(Counter::EN, LogicVec::unknown(1)).unwrap();
        tick(&mut counter);
        assert_eq!(count(&counter), None);
        assert_eq!(counter.get(Counter::CARRY).unwrap().to_string(), "X");
    }

    #[test]
    fn wrap_reports_location_and_carry() {
        let mut counter = Counter::new("top", 2);
        for _ in 0..3 {
            tick(&mut counter);
        }
        assert_eq!(count(&counter), Some(3));
        assert_eq!(counter.get(Counter::CARRY).unwrap().to_u64(), Some(1));
        assert_eq!(counter.location_tag(), None);
        tick(&mut counter);
        assert_eq!(count(&counter), Some(0));
        assert_eq!(counter.location_tag(), Some(Location::new("top.wrap")));
        counter.settle().unwrap();
        assert_eq!(counter.location_tag(), None);
    }

    #[test]
    fn rejects_bad_writes() {
        let mut counter = Counter::new("top", 4);
        assert!(counter.set(Counter::COUNT, LogicVec::zeros(4)).is_err());
        assert!(counter.set(Counter::CLK, LogicVec::zeros(2)).is_err());
        assert!(counter.set(PortId(99), LogicVec::zeros(1)).is_err());
        assert_eq!(counter.get(PortId(99)), None);
    }

    #[test]
    fn location_macro_names_this_file() {
        let here = crate::location!();
        assert!(here.as_str().contains("design.rs:"));
    }
}
