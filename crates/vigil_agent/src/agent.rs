//! The agent: owns the design, the clock, the spool and the breakpoints, and
//! is the only writer of simulation state.
//!
//! The caller's driver loop calls [`Agent::advance`], [`Agent::set`] and
//! [`Agent::step`]. Every step is a yield point: queued session commands are
//! applied there, between settles, and the agent blocks the driver loop while
//! the simulation is paused.

use crate::breakpoint::{BreakCondition, BreakpointController, BreakpointId, StepView};
use crate::clock::TimeAuthority;
use crate::design::{Location, Port, PortId, SimulatedDesign};
use crate::error::AgentError;
use crate::link::DebugLink;
use crate::session::{
    AgentCommand, AgentReply, ControlEvent, ReplySender, Request, SessionConnector, SessionHub,
    SessionId, SessionInfo, TransitionBatch,
};
use crate::snapshot::{find_port, PauseCause, SimulationStatus, Snapshot};
use crate::spool::{SpoolWriter, Transition};
use crate::time::{SimDuration, SimTime};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use vigil_common::LogicVec;
use vigil_config::{LinkConfig, SessionConfig};

/// What a paused agent does after handling a request.
enum PauseFlow {
    Hold,
    Release,
}

/// Drives a [`SimulatedDesign`] and serves debug sessions.
///
/// The debug link runs on its own runtime and is started and stopped by
/// blocking on it. An agent with a running link must not be stepped,
/// finished or dropped from inside an async runtime; drive it from a plain
/// thread (or `spawn_blocking`).
///
/// # Example
///
/// ```no_run
/// use vigil_agent::{Agent, Counter, SimDuration, SpoolWriter};
/// use vigil_common::LogicVec;
/// use vigil_config::{LinkConfig, SyncPolicy};
///
/// # fn main() -> Result<(), vigil_agent::AgentError> {
/// let spool = SpoolWriter::create("run.spool", SyncPolicy::Step)?;
/// let mut agent = Agent::new(spool, Counter::new("top", 8))?;
/// let uri = agent.start_debugging(&LinkConfig::default())?;
/// eprintln!("Simulation started on {uri}");
///
/// agent.step()?;
/// for _ in 0..1000 {
///     agent.advance(SimDuration::from_ns(1))?;
///     agent.set(Counter::CLK, LogicVec::from_bool(false))?;
///     agent.step()?;
///     agent.advance(SimDuration::from_ns(1))?;
///     agent.set(Counter::CLK, LogicVec::from_bool(true))?;
///     agent.step()?;
/// }
/// agent.finish()
/// # }
/// ```
pub struct Agent<D: SimulatedDesign> {
    design: D,
    ports: Arc<[Port]>,
    values: Vec<LogicVec>,
    clock: TimeAuthority,
    committed_at: SimTime,
    last_step: Option<SimTime>,
    spool: SpoolWriter,
    breakpoints: BreakpointController,
    sessions: BTreeMap<SessionId, SessionInfo>,
    causes: Vec<PauseCause>,
    requested: Vec<PauseCause>,
    run_until: Option<(SessionId, SimTime)>,
    single_step: Option<(SessionId, ReplySender)>,
    requests: mpsc::UnboundedReceiver<Request>,
    deferred: VecDeque<Request>,
    hub: SessionHub,
    control: broadcast::Sender<ControlEvent>,
    transitions: broadcast::Sender<TransitionBatch>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    steps: u64,
    status: SimulationStatus,
    link: Option<DebugLink>,
    local_debugging: bool,
    fault: Option<String>,
}

impl<D: SimulatedDesign> Agent<D> {
    /// Creates an agent with default session limits.
    pub fn new(spool: SpoolWriter, design: D) -> Result<Self, AgentError> {
        Self::with_session_config(spool, design, &SessionConfig::default())
    }

    /// Creates an agent.
    ///
    /// Declares every port in the spool and records the design's initial
    /// values as transitions from all `X`. A resumed spool continues at its
    /// last recorded time, and from the values recorded up to then.
    pub fn with_session_config(
        mut spool: SpoolWriter,
        design: D,
        config: &SessionConfig,
    ) -> Result<Self, AgentError> {
        let ports: Arc<[Port]> = design.ports().to_vec().into();
        validate_ports(&ports)?;
        for port in ports.iter() {
            spool.declare_port(port)?;
        }
        let start = spool.last_time().unwrap_or(SimTime::ZERO);
        let values = spool.values().to_vec();

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let capacity = config.event_capacity.max(1);
        let (control, _) = broadcast::channel(capacity);
        let (transitions, _) = broadcast::channel(capacity);
        let (snapshots, snapshot_rx) = watch::channel(Arc::new(Snapshot {
            time: start,
            status: SimulationStatus::Running,
            causes: Vec::new(),
            ports: ports.clone(),
            values: Vec::new(),
            breakpoints: Vec::new(),
            steps: 0,
            sessions: 0,
        }));
        let hub = SessionHub::new(
            requests_tx,
            snapshot_rx,
            control.clone(),
            transitions.clone(),
            spool.path().to_path_buf(),
            config,
        );

        let mut agent = Self {
            design,
            ports,
            values,
            clock: TimeAuthority::new(start),
            committed_at: start,
            last_step: None,
            spool,
            breakpoints: BreakpointController::new(),
            sessions: BTreeMap::new(),
            causes: Vec::new(),
            requested: Vec::new(),
            run_until: None,
            single_step: None,
            requests,
            deferred: VecDeque::new(),
            hub,
            control,
            transitions,
            snapshots,
            steps: 0,
            status: SimulationStatus::Running,
            link: None,
            local_debugging: false,
            fault: None,
        };
        agent.commit(start)?;
        agent.spool.end_step()?;
        agent.publish();
        Ok(agent)
    }

    /// Starts the TCP debug link and returns its URI, `tcp://<ip>:<port>`.
    ///
    /// Blocks the current thread until the listener is bound, so it must not
    /// be called from inside an async runtime.
    pub fn start_debugging(&mut self, config: &LinkConfig) -> Result<String, AgentError> {
        self.check_live()?;
        if self.link.is_some() {
            return Err(AgentError::AlreadyDebugging);
        }
        let link = DebugLink::start(config, self.hub.clone())?;
        let uri = link.uri().to_string();
        self.link = Some(link);
        Ok(uri)
    }

    /// Returns a connector for in-process sessions. Enables pausing.
    pub fn connector(&mut self) -> SessionConnector {
        self.local_debugging = true;
        SessionConnector::new(self.hub.clone())
    }

    /// Returns `true` once a link was started or a connector handed out.
    pub fn is_debugging(&self) -> bool {
        self.link.is_some() || self.local_debugging
    }

    /// Returns the URI of the running debug link.
    pub fn link_uri(&self) -> Option<&str> {
        self.link.as_ref().map(DebugLink::uri)
    }

    /// Moves simulated time forward. The design is not touched.
    pub fn advance(&mut self, duration: SimDuration) -> Result<SimTime, AgentError> {
        self.check_live()?;
        self.clock.advance(duration)
    }

    /// Stages a write to an input or inout port for the next step.
    pub fn set(&mut self, port: PortId, value: LogicVec) -> Result<(), AgentError> {
        self.check_live()?;
        let result = self.stage(port, value);
        self.guard(result)
    }

    /// Settles the design, records its transitions and services debug
    /// sessions. Blocks while the simulation is paused.
    pub fn step(&mut self) -> Result<(), AgentError> {
        self.check_live()?;
        let result = self.step_inner();
        self.guard(result)
    }

    /// A pause point in the driver loop.
    ///
    /// While debugging, pauses with a [`PauseCause::Location`] until a session
    /// resumes. Otherwise does nothing.
    pub fn breakpoint(&mut self, location: Location) -> Result<(), AgentError> {
        self.check_live()?;
        let result = self.breakpoint_inner(location);
        self.guard(result)
    }

    /// Adds a breakpoint from the driver side.
    pub fn add_breakpoint(
        &mut self,
        label: impl Into<String>,
        condition: BreakCondition,
    ) -> Result<BreakpointId, AgentError> {
        self.check_live()?;
        let id = self.breakpoints.add(label, condition);
        self.publish();
        Ok(id)
    }

    /// Removes a breakpoint from the driver side.
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), AgentError> {
        self.check_live()?;
        self.breakpoints
            .clear(id)
            .ok_or(AgentError::UnknownBreakpoint { id })?;
        self.publish();
        Ok(())
    }

    /// Looks up a port by name.
    pub fn find_port(&self, name: &str) -> Option<PortId> {
        find_port(&self.ports, name).map(|p| p.id)
    }

    /// Returns every port.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Returns the committed value of a port.
    pub fn value(&self, port: PortId) -> Option<&LogicVec> {
        self.values.get(port.index())
    }

    /// Returns the current simulated time.
    pub fn time(&self) -> SimTime {
        self.clock.now()
    }

    /// Returns the simulation status.
    pub fn status(&self) -> SimulationStatus {
        self.status
    }

    /// Returns the number of completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Returns the latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Iterates over attached sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.sessions.values()
    }

    /// Returns the design.
    pub fn design(&self) -> &D {
        &self.design
    }

    /// Returns the spool writer.
    pub fn spool(&self) -> &SpoolWriter {
        &self.spool
    }

    /// Ends the simulation: notifies sessions, syncs the spool and stops the
    /// debug link.
    pub fn finish(&mut self) -> Result<(), AgentError> {
        self.check_live()?;
        self.status = SimulationStatus::Finished;
        self.causes.clear();
        self.publish();
        let _ = self.control.send(ControlEvent::Finished {
            time: self.committed_at,
        });
        info!(time = %self.committed_at, steps = self.steps, "simulation finished");
        self.close_requests();
        let closed = self.spool.close();
        self.stop_link();
        closed.map_err(AgentError::from)
    }

    fn check_live(&self) -> Result<(), AgentError> {
        if let Some(reason) = &self.fault {
            return Err(AgentError::Faulted {
                reason: reason.clone(),
            });
        }
        if self.status == SimulationStatus::Finished {
            return Err(AgentError::Finished);
        }
        Ok(())
    }

    fn guard<T>(&mut self, result: Result<T, AgentError>) -> Result<T, AgentError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.enter_fault(err);
            }
        }
        result
    }

    fn enter_fault(&mut self, err: &AgentError) {
        let message = err.to_string();
        error!(error = %message, time = %self.committed_at, "agent faulted");
        self.fault = Some(message.clone());
        self.status = SimulationStatus::Faulted;
        self.causes.clear();
        self.publish();
        let _ = self.control.send(ControlEvent::Fault { message });
        self.close_requests();
        self.stop_link();
    }

    /// Stops accepting requests and fails everything still queued.
    fn close_requests(&mut self) {
        self.requests.close();
        let mut rejected = std::mem::take(&mut self.deferred);
        while let Ok(request) = self.requests.try_recv() {
            rejected.push_back(request);
        }
        for request in rejected {
            if let Request::Command { reply, .. } = request {
                let _ = reply.send(Err(self.closed_error()));
            }
        }
        if let Some((_, reply)) = self.single_step.take() {
            let _ = reply.send(Err(self.closed_error()));
        }
    }

    fn closed_error(&self) -> AgentError {
        match &self.fault {
            Some(reason) => AgentError::Faulted {
                reason: reason.clone(),
            },
            None => AgentError::Finished,
        }
    }

    fn stop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }

    fn stage(&mut self, port: PortId, value: LogicVec) -> Result<(), AgentError> {
        let decl = self
            .ports
            .get(port.index())
            .ok_or_else(|| AgentError::UnknownPort {
                port: port.to_string(),
            })?;
        if !decl.direction.is_writable() {
            return Err(AgentError::PortNotWritable {
                port: decl.name.clone(),
            });
        }
        if value.width() != decl.width {
            return Err(AgentError::WidthMismatch {
                port: decl.name.clone(),
                expected: decl.width,
                actual: value.width(),
            });
        }
        self.design.set(port, value)?;
        Ok(())
    }

    /// Records every port whose value differs from the committed one.
    fn commit(&mut self, time: SimTime) -> Result<Vec<(PortId, LogicVec)>, AgentError> {
        let mut changes = Vec::new();
        for port in self.ports.iter() {
            let Some(after) = self.design.get(port.id) else {
                return Err(AgentError::InvalidDesign {
                    reason: format!("design has no value for '{}'", port.name),
                });
            };
            let before = &self.values[port.id.index()];
            if *before == after {
                continue;
            }
            self.spool.record(&Transition {
                time,
                port: port.id,
                before: before.clone(),
                after: after.clone(),
            })?;
            self.values[port.id.index()] = after.clone();
            changes.push((port.id, after));
        }
        self.committed_at = time;
        Ok(changes)
    }

    fn step_inner(&mut self) -> Result<(), AgentError> {
        self.design.settle()?;
        let time = self.clock.now();
        let changes = self.commit(time)?;
        self.spool.end_step()?;
        self.steps += 1;

        let location = self.design.location_tag();
        let changed: Vec<PortId> = changes.iter().map(|(port, _)| *port).collect();
        let hits = self.breakpoints.evaluate(&StepView {
            previous_time: self.last_step,
            time,
            location: location.as_ref(),
            values: &self.values,
            changed: &changed,
        });
        self.last_step = Some(time);

        if !changes.is_empty() && self.transitions.receiver_count() > 0 {
            let _ = self.transitions.send(TransitionBatch {
                time,
                changes: changes.into(),
            });
        }

        let mut causes: Vec<PauseCause> = hits.into_iter().map(PauseCause::Breakpoint).collect();
        if let Some((session, until)) = self.run_until {
            if time >= until {
                causes.push(PauseCause::UntilTime {
                    session,
                    time: until,
                });
                self.run_until = None;
            }
        }
        let stepped = self.single_step.take().map(|(session, reply)| {
            causes.push(PauseCause::SingleStep(session));
            reply
        });
        self.yield_point(causes, stepped)
    }

    fn breakpoint_inner(&mut self, location: Location) -> Result<(), AgentError> {
        if !self.is_debugging() {
            debug!(%location, "pause point reached without a debugger");
            return Ok(());
        }
        self.yield_point(vec![PauseCause::Location(location)], None)
    }

    /// Services queued commands, then pauses if anything asked for it.
    fn yield_point(
        &mut self,
        mut causes: Vec<PauseCause>,
        stepped: Option<ReplySender>,
    ) -> Result<(), AgentError> {
        self.service()?;
        causes.append(&mut self.requested);
        causes.retain(|cause| {
            cause
                .session()
                .map_or(true, |s| self.sessions.contains_key(&s))
        });
        if causes.is_empty() {
            self.breakpoints.rearm();
            self.publish();
            return Ok(());
        }
        if !self.is_debugging() {
            warn!(time = %self.committed_at, ?causes, "pause requested without a debugger, continuing");
            self.breakpoints.rearm();
            self.publish();
            return Ok(());
        }
        self.pause(causes, stepped)
    }

    /// Applies at most one command per session and defers the rest.
    fn service(&mut self) -> Result<(), AgentError> {
        let mut served = BTreeSet::new();
        let mut later = VecDeque::new();
        let mut queue = std::mem::take(&mut self.deferred);
        while let Ok(request) = self.requests.try_recv() {
            queue.push_back(request);
        }
        let mut changed = false;
        for request in queue {
            match request {
                Request::Attach { session, peer } => {
                    self.attach(session, peer);
                    changed = true;
                }
                Request::Detach { session } => {
                    self.forget(session);
                    later.retain(|r| request_session(r) != Some(session));
                    changed = true;
                }
                Request::Command { session, .. } if !self.sessions.contains_key(&session) => {}
                Request::Command { session, .. } if served.contains(&session) => {
                    later.push_back(request);
                }
                Request::Command {
                    session,
                    command,
                    reply,
                } => {
                    served.insert(session);
                    changed |= self.run_command(session, command, reply)?;
                }
            }
        }
        self.deferred = later;
        if changed {
            self.publish();
        }
        Ok(())
    }

    /// Applies a command while running. Returns `true` if state changed.
    fn run_command(
        &mut self,
        session: SessionId,
        command: AgentCommand,
        reply: ReplySender,
    ) -> Result<bool, AgentError> {
        let (result, changed) = match command {
            AgentCommand::Force { port, value } => match self.stage(port, value) {
                Err(err) if err.is_fatal() => {
                    let _ = reply.send(Err(AgentError::Faulted {
                        reason: err.to_string(),
                    }));
                    return Err(err);
                }
                result => (result.map(|()| AgentReply::Done), false),
            },
            AgentCommand::AddBreakpoint { label, condition } => {
                let id = self.breakpoints.add(label, condition);
                debug!(%session, %id, "breakpoint added");
                (Ok(AgentReply::BreakpointAdded(id)), true)
            }
            AgentCommand::RemoveBreakpoint { id } => match self.breakpoints.clear(id) {
                Some(_) => (Ok(AgentReply::Done), true),
                None => (Err(AgentError::UnknownBreakpoint { id }), false),
            },
            AgentCommand::Continue { until } => {
                if let Some(until) = until {
                    self.run_until = Some((session, until));
                }
                (Ok(AgentReply::Done), false)
            }
            AgentCommand::Pause => {
                self.requested.push(PauseCause::Request(session));
                (Ok(AgentReply::Done), false)
            }
            AgentCommand::Step => (Err(AgentError::NotPaused), false),
        };
        let _ = reply.send(result);
        Ok(changed)
    }

    fn attach(&mut self, session: SessionId, peer: String) {
        info!(%session, %peer, "debug session attached");
        self.sessions.insert(
            session,
            SessionInfo {
                id: session,
                peer,
                attached_at: self.committed_at,
            },
        );
    }

    fn forget(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            info!(%session, "debug session detached");
        }
        self.deferred.retain(|r| request_session(r) != Some(session));
        self.requested.retain(|c| c.session() != Some(session));
        if self.run_until.is_some_and(|(owner, _)| owner == session) {
            self.run_until = None;
        }
        if self
            .single_step
            .as_ref()
            .is_some_and(|(owner, _)| *owner == session)
        {
            self.single_step = None;
        }
    }

    fn pause(
        &mut self,
        causes: Vec<PauseCause>,
        stepped: Option<ReplySender>,
    ) -> Result<(), AgentError> {
        let time = self.committed_at;
        self.causes = causes;
        self.status = SimulationStatus::Paused;
        self.breakpoints.enter_pause();
        self.publish();
        info!(%time, causes = ?self.causes, "simulation paused");
        let _ = self.control.send(ControlEvent::Paused {
            time,
            causes: self.causes.clone(),
        });
        if let Some(reply) = stepped {
            let _ = reply.send(Ok(AgentReply::Stepped(time)));
        }

        loop {
            let request = match self.deferred.pop_front() {
                Some(request) => request,
                None => match self.requests.blocking_recv() {
                    Some(request) => request,
                    None => break,
                },
            };
            if let PauseFlow::Release = self.handle_paused(request) {
                break;
            }
        }
        self.resume();
        Ok(())
    }

    fn handle_paused(&mut self, request: Request) -> PauseFlow {
        match request {
            Request::Attach { session, peer } => {
                self.attach(session, peer);
                self.publish();
                PauseFlow::Hold
            }
            Request::Detach { session } => {
                self.forget(session);
                let owned = !self.causes.is_empty()
                    && self.causes.iter().all(|c| c.session() == Some(session));
                if owned && self.sessions.is_empty() {
                    info!(%session, "pause released by detach");
                    return PauseFlow::Release;
                }
                self.publish();
                PauseFlow::Hold
            }
            Request::Command { session, .. } if !self.sessions.contains_key(&session) => {
                PauseFlow::Hold
            }
            Request::Command {
                session,
                command,
                reply,
            } => match command {
                AgentCommand::Force { .. } => {
                    let _ = reply.send(Err(AgentError::SimulationPaused));
                    PauseFlow::Hold
                }
                AgentCommand::AddBreakpoint { label, condition } => {
                    let id = self.breakpoints.add(label, condition);
                    self.publish();
                    let _ = reply.send(Ok(AgentReply::BreakpointAdded(id)));
                    PauseFlow::Hold
                }
                AgentCommand::RemoveBreakpoint { id } => {
                    if self.breakpoints.clear(id).is_none() {
                        let _ = reply.send(Err(AgentError::UnknownBreakpoint { id }));
                        return PauseFlow::Hold;
                    }
                    self.causes.retain(|c| *c != PauseCause::Breakpoint(id));
                    if self.causes.is_empty() {
                        let _ = reply.send(Ok(AgentReply::Done));
                        return PauseFlow::Release;
                    }
                    self.publish();
                    let _ = reply.send(Ok(AgentReply::Done));
                    PauseFlow::Hold
                }
                AgentCommand::Continue { until } => {
                    self.run_until = until.map(|t| (session, t));
                    let _ = reply.send(Ok(AgentReply::Done));
                    PauseFlow::Release
                }
                AgentCommand::Pause => {
                    let _ = reply.send(Ok(AgentReply::Done));
                    PauseFlow::Hold
                }
                AgentCommand::Step => {
                    self.single_step = Some((session, reply));
                    PauseFlow::Release
                }
            },
        }
    }

    fn resume(&mut self) {
        self.causes.clear();
        self.status = SimulationStatus::Running;
        self.breakpoints.rearm();
        self.publish();
        debug!(time = %self.committed_at, "simulation resumed");
        let _ = self.control.send(ControlEvent::Resumed {
            time: self.committed_at,
        });
    }

    fn publish(&self) {
        let snapshot = Snapshot {
            time: self.committed_at,
            status: self.status,
            causes: self.causes.clone(),
            ports: self.ports.clone(),
            values: self.values.clone(),
            breakpoints: self.breakpoints.iter().cloned().collect(),
            steps: self.steps,
            sessions: self.sessions.len(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}

// Stopping the link blocks on its runtime; see the note on `Agent`.
impl<D: SimulatedDesign> Drop for Agent<D> {
    fn drop(&mut self) {
        self.stop_link();
    }
}

fn request_session(request: &Request) -> Option<SessionId> {
    match request {
        Request::Command { session, .. } => Some(*session),
        Request::Attach { .. } | Request::Detach { .. } => None,
    }
}

fn validate_ports(ports: &[Port]) -> Result<(), AgentError> {
    let mut names = BTreeSet::new();
    for (index, port) in ports.iter().enumerate() {
        if port.id.index() != index {
            return Err(AgentError::InvalidDesign {
                reason: format!("port '{}' has id {} at position {index}", port.name, port.id),
            });
        }
        if port.width == 0 {
            return Err(AgentError::InvalidDesign {
                reason: format!("port '{}' has zero width", port.name),
            });
        }
        if !names.insert(port.name.as_str()) {
            return Err(AgentError::InvalidDesign {
                reason: format!("duplicate port name '{}'", port.name),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::PortPredicate;
    use crate::design::{Counter, DesignFault, PortDirection};
    use crate::spool::{replay, SpoolReader};
    use vigil_config::SyncPolicy;

    fn counter_agent(dir: &tempfile::TempDir) -> Agent<Counter> {
        let spool = SpoolWriter::create(dir.path().join("run.spool"), SyncPolicy::Step).unwrap();
        Agent::new(spool, Counter::new("top", 4)).unwrap()
    }

    fn edge(agent: &mut Agent<Counter>, level: bool) {
        agent.advance(SimDuration::from_ns(1)).unwrap();
        agent.set(Counter::CLK, LogicVec::from_bool(level)).unwrap();
        agent.step().unwrap();
    }

    #[test]
    fn initial_values_recorded_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let agent = counter_agent(&dir);
        let path = agent.spool().path().to_path_buf();
        drop(agent);
        let transitions: Vec<_> = SpoolReader::open(&path)
            .unwrap()
            .transitions()
            .collect::<Result<_, _>>()
            .unwrap();
        // clk starts unknown and is not recorded.
        assert_eq!(transitions.len(), 4);
        assert!(transitions.iter().all(|t| t.time == SimTime::ZERO));
        assert!(transitions.iter().all(|t| !t.before.is_known()));
    }

    #[test]
    fn step_without_change_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        agent.step().unwrap();
        let records = agent.spool().records();
        agent.step().unwrap();
        agent.step().unwrap();
        assert_eq!(agent.spool().records(), records);
        assert_eq!(agent.steps(), 3);
    }

    #[test]
    fn steps_commit_counter_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        agent.step().unwrap();
        for _ in 0..3 {
            edge(&mut agent, false);
            edge(&mut agent, true);
        }
        assert_eq!(agent.time(), SimTime::from_ns(6));
        assert_eq!(agent.value(Counter::COUNT).unwrap().to_u64(), Some(3));
        let snapshot = agent.snapshot();
        assert_eq!(snapshot.time, SimTime::from_ns(6));
        assert_eq!(snapshot.value(Counter::COUNT).unwrap().to_u64(), Some(3));

        let path = agent.spool().path().to_path_buf();
        let values = replay(path, SimTime::ZERO, SimTime::from_ns(6))
            .values_at(SimTime::from_ns(4))
            .unwrap();
        assert_eq!(values.by_name("top.count").unwrap().to_u64(), Some(2));
    }

    #[test]
    fn set_validates_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        assert!(matches!(
            agent.set(Counter::COUNT, LogicVec::zeros(4)),
            Err(AgentError::PortNotWritable { .. })
        ));
        assert!(matches!(
            agent.set(Counter::EN, LogicVec::zeros(2)),
            Err(AgentError::WidthMismatch { .. })
        ));
        assert!(matches!(
            agent.set(PortId::from_raw(42), LogicVec::zeros(1)),
            Err(AgentError::UnknownPort { .. })
        ));
        assert_eq!(agent.status(), SimulationStatus::Running);
        assert_eq!(agent.find_port("top.en"), Some(Counter::EN));
    }

    #[test]
    fn advance_rejects_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        assert!(matches!(
            agent.advance(SimDuration::ZERO),
            Err(AgentError::InvalidDuration { .. })
        ));
        assert_eq!(agent.status(), SimulationStatus::Running);
    }

    #[test]
    fn breakpoints_without_debugger_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        let id = agent
            .add_breakpoint(
                "changes",
                BreakCondition::Predicate(PortPredicate::Changed {
                    port: Counter::COUNT,
                }),
            )
            .unwrap();
        agent.step().unwrap();
        edge(&mut agent, false);
        edge(&mut agent, true);
        let bp = agent.snapshot().breakpoints[0].clone();
        assert_eq!(bp.id, id);
        assert_eq!(bp.hit_count, 1);
        assert_eq!(bp.state, crate::breakpoint::BreakpointState::Armed);
        agent.breakpoint(crate::location!()).unwrap();
        assert_eq!(agent.status(), SimulationStatus::Running);
    }

    #[test]
    fn finish_rejects_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = counter_agent(&dir);
        agent.step().unwrap();
        agent.finish().unwrap();
        assert_eq!(agent.status(), SimulationStatus::Finished);
        assert!(matches!(agent.step(), Err(AgentError::Finished)));
        assert!(matches!(agent.finish(), Err(AgentError::Finished)));
    }

    struct Faulty {
        ports: Vec<Port>,
        fail: bool,
    }

    impl SimulatedDesign for Faulty {
        fn ports(&self) -> &[Port] {
            &self.ports
        }
        fn set(&mut self, _: PortId, _: LogicVec) -> Result<(), DesignFault> {
            self.fail = true;
            Ok(())
        }
        fn get(&self, _: PortId) -> Option<LogicVec> {
            Some(LogicVec::zeros(1))
        }
        fn settle(&mut self) -> Result<(), DesignFault> {
            if self.fail {
                Err(DesignFault::new("settle diverged"))
            } else {
                Ok(())
            }
        }
    }

    fn faulty() -> Faulty {
        Faulty {
            ports: vec![Port {
                id: PortId::from_raw(0),
                name: "top.a".into(),
                width: 1,
                direction: PortDirection::Input,
            }],
            fail: false,
        }
    }

    #[test]
    fn design_fault_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolWriter::create(dir.path().join("f.spool"), SyncPolicy::Step).unwrap();
        let mut agent = Agent::new(spool, faulty()).unwrap();
        agent.step().unwrap();
        agent.set(PortId::from_raw(0), LogicVec::from_bool(true)).unwrap();
        let err = agent.step().unwrap_err();
        assert!(matches!(err, AgentError::Design(_)));
        assert_eq!(agent.status(), SimulationStatus::Faulted);
        assert!(matches!(
            agent.advance(SimDuration::from_ns(1)),
            Err(AgentError::Faulted { .. })
        ));
        assert_eq!(agent.snapshot().status, SimulationStatus::Faulted);
    }

    #[test]
    fn rejects_sparse_port_ids() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolWriter::create(dir.path().join("s.spool"), SyncPolicy::Step).unwrap();
        let mut design = faulty();
        design.ports[0].id = PortId::from_raw(3);
        assert!(matches!(
            Agent::new(spool, design),
            Err(AgentError::InvalidDesign { .. })
        ));
    }

    #[test]
    fn resumed_spool_continues_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.spool");
        {
            let spool = SpoolWriter::create(&path, SyncPolicy::Step).unwrap();
            let mut agent = Agent::new(spool, Counter::new("top", 4)).unwrap();
            agent.step().unwrap();
            edge(&mut agent, false);
            edge(&mut agent, true);
            agent.finish().unwrap();
        }
        let spool = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
        let agent = Agent::new(spool, Counter::new("top", 4)).unwrap();
        assert_eq!(agent.time(), SimTime::from_ns(2));
    }
}
