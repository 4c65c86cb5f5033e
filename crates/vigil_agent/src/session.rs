//! Debug sessions and the channels that connect them to the agent.
//!
//! A session never touches simulation state. Read-only commands are answered
//! from the latest published [`Snapshot`]; everything else becomes a
//! [`Request`] on the agent's queue and is applied by the stepping context at
//! the next step boundary. The same [`SessionCore`] backs both TCP sessions and
//! in-process [`LocalSession`]s.

use crate::breakpoint::{BreakCondition, BreakpointId};
use crate::design::{Port, PortId};
use crate::error::AgentError;
use crate::protocol::{
    condition_from_wire, parse_wire_time, wire_causes, Command, Event, Response, ServerPacket,
    WireBreakpoint, WirePort, WireSample,
};
use crate::snapshot::{parse_port_value, resolve_port, PauseCause, SimulationStatus, Snapshot};
use crate::spool::{replay, Replay, SpoolError};
use crate::time::SimTime;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use vigil_common::LogicVec;
use vigil_config::SessionConfig;

/// Identifier of a debug session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates an id from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// An attached session as the agent sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id.
    pub id: SessionId,
    /// Remote address, or `"local"`.
    pub peer: String,
    /// Simulated time at which the session attached.
    pub attached_at: SimTime,
}

pub(crate) type ReplySender = oneshot::Sender<Result<AgentReply, AgentError>>;

/// A message from a session to the stepping context.
#[derive(Debug)]
pub(crate) enum Request {
    Attach {
        session: SessionId,
        peer: String,
    },
    Detach {
        session: SessionId,
    },
    Command {
        session: SessionId,
        command: AgentCommand,
        reply: ReplySender,
    },
}

/// A command that must run in the stepping context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AgentCommand {
    Force { port: PortId, value: LogicVec },
    AddBreakpoint { label: String, condition: BreakCondition },
    RemoveBreakpoint { id: BreakpointId },
    Continue { until: Option<SimTime> },
    Pause,
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AgentReply {
    Done,
    BreakpointAdded(BreakpointId),
    Stepped(SimTime),
}

/// Broadcast to every session when the control state changes.
#[derive(Debug, Clone)]
pub(crate) enum ControlEvent {
    Paused {
        time: SimTime,
        causes: Vec<PauseCause>,
    },
    Resumed {
        time: SimTime,
    },
    Finished {
        time: SimTime,
    },
    Fault {
        message: String,
    },
}

/// The port changes committed by one step.
#[derive(Debug, Clone)]
pub(crate) struct TransitionBatch {
    pub(crate) time: SimTime,
    pub(crate) changes: Arc<[(PortId, LogicVec)]>,
}

/// Everything a session needs to reach the agent. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct SessionHub {
    requests: mpsc::UnboundedSender<Request>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    control: broadcast::Sender<ControlEvent>,
    transitions: broadcast::Sender<TransitionBatch>,
    spool_path: PathBuf,
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    max_sessions: usize,
    max_query_samples: usize,
}

impl SessionHub {
    pub(crate) fn new(
        requests: mpsc::UnboundedSender<Request>,
        snapshots: watch::Receiver<Arc<Snapshot>>,
        control: broadcast::Sender<ControlEvent>,
        transitions: broadcast::Sender<TransitionBatch>,
        spool_path: PathBuf,
        config: &SessionConfig,
    ) -> Self {
        Self {
            requests,
            snapshots,
            control,
            transitions,
            spool_path,
            next_id: Arc::new(AtomicU64::new(1)),
            active: Arc::new(AtomicUsize::new(0)),
            max_sessions: config.max_sessions,
            max_query_samples: config.max_query_samples,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Reserves a session slot and announces the session to the agent.
    pub(crate) fn attach(&self, peer: impl Into<String>) -> Result<SessionCore, AgentError> {
        let limit = self.max_sessions;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| AgentError::TooManySessions { limit })?;

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // Subscribe before attaching so no event after the attach is missed.
        let control = self.control.subscribe();
        let peer = peer.into();
        if self
            .requests
            .send(Request::Attach {
                session: id,
                peer: peer.clone(),
            })
            .is_err()
        {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(closed_error(&self.snapshot()));
        }
        debug!(session = %id, %peer, "session attached");
        let ports = self.snapshot().ports.clone();
        Ok(SessionCore {
            id,
            hub: self.clone(),
            control,
            transitions: None,
            subscriptions: BTreeSet::new(),
            ports,
            detached: false,
        })
    }
}

/// The error reported once the agent stopped accepting requests.
fn closed_error(snapshot: &Snapshot) -> AgentError {
    match snapshot.status {
        SimulationStatus::Faulted => AgentError::Faulted {
            reason: "agent stopped after a fatal error".to_string(),
        },
        _ => AgentError::Finished,
    }
}

/// The next step for a session after dispatching a command.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Send this packet now.
    Ready(ServerPacket),
    /// Wait for the agent's reply, then call [`SessionCore::complete`].
    Pending {
        reply: oneshot::Receiver<Result<AgentReply, AgentError>>,
        kind: PendingKind,
    },
    /// Run the spool query off the I/O path.
    Query(QueryJob),
    /// Send this packet, then close the session.
    Detach(ServerPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Force,
    AddBreakpoint,
    RemoveBreakpoint,
    Continue,
    Pause,
    Step,
}

/// Per-session state shared by every transport.
#[derive(Debug)]
pub(crate) struct SessionCore {
    id: SessionId,
    hub: SessionHub,
    control: broadcast::Receiver<ControlEvent>,
    transitions: Option<broadcast::Receiver<TransitionBatch>>,
    subscriptions: BTreeSet<PortId>,
    ports: Arc<[Port]>,
    detached: bool,
}

impl SessionCore {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.hub.snapshot()
    }

    pub(crate) fn snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.hub.snapshots.clone()
    }

    /// Handles one command.
    pub(crate) fn dispatch(&mut self, command: Command) -> Dispatch {
        match self.try_dispatch(command) {
            Ok(dispatch) => dispatch,
            Err(err) => Dispatch::Ready(ServerPacket::error(&err)),
        }
    }

    fn try_dispatch(&mut self, command: Command) -> Result<Dispatch, AgentError> {
        let ready = |r: Response| Ok(Dispatch::Ready(ServerPacket::Response(r)));
        match command {
            Command::ListPorts => ready(Response::ListPorts {
                ports: self.ports.iter().map(WirePort::from).collect(),
            }),
            Command::GetSimulationStatus => {
                let snapshot = self.snapshot();
                ready(Response::GetSimulationStatus {
                    status: snapshot.status,
                    latest_time: snapshot.time.to_wire(),
                    causes: wire_causes(&snapshot.causes),
                    steps: snapshot.steps,
                })
            }
            Command::InspectPorts { ports } => ready(self.inspect(&ports)?),
            Command::ListBreakpoints => {
                let snapshot = self.snapshot();
                ready(Response::ListBreakpoints {
                    breakpoints: snapshot
                        .breakpoints
                        .iter()
                        .map(|bp| WireBreakpoint::new(bp, &snapshot.ports))
                        .collect(),
                })
            }
            Command::ForcePort { port, value } => {
                let port = resolve_port(&self.ports, &port)?;
                if !port.direction.is_writable() {
                    return Err(AgentError::PortNotWritable {
                        port: port.name.clone(),
                    });
                }
                let value = parse_port_value(port, &value)?;
                let port = port.id;
                self.send(AgentCommand::Force { port, value }, PendingKind::Force)
            }
            Command::AddBreakpoint { label, condition } => {
                let resolved = condition_from_wire(&condition, &self.ports)?;
                let label = label.unwrap_or_else(|| resolved.to_string());
                self.send(
                    AgentCommand::AddBreakpoint {
                        label,
                        condition: resolved,
                    },
                    PendingKind::AddBreakpoint,
                )
            }
            Command::RemoveBreakpoint { id } => self.send(
                AgentCommand::RemoveBreakpoint {
                    id: BreakpointId::from_raw(id),
                },
                PendingKind::RemoveBreakpoint,
            ),
            Command::Continue { until_time } => {
                let until = until_time.as_deref().map(parse_wire_time).transpose()?;
                self.send(AgentCommand::Continue { until }, PendingKind::Continue)
            }
            Command::Pause => self.send(AgentCommand::Pause, PendingKind::Pause),
            Command::Step => self.send(AgentCommand::Step, PendingKind::Step),
            Command::Subscribe { ports } => {
                for name in &ports {
                    let id = resolve_port(&self.ports, name)?.id;
                    self.subscriptions.insert(id);
                }
                if !self.subscriptions.is_empty() && self.transitions.is_none() {
                    self.transitions = Some(self.hub.transitions.subscribe());
                }
                ready(Response::Subscribe {
                    ports: self.subscribed_names(),
                })
            }
            Command::Unsubscribe { ports } => {
                if ports.is_empty() {
                    self.subscriptions.clear();
                } else {
                    for name in &ports {
                        let id = resolve_port(&self.ports, name)?.id;
                        self.subscriptions.remove(&id);
                    }
                }
                if self.subscriptions.is_empty() {
                    self.transitions = None;
                }
                ready(Response::Unsubscribe {
                    ports: self.subscribed_names(),
                })
            }
            Command::QueryInterval { begin, end, ports } => {
                let begin = parse_wire_time(&begin)?;
                let end = parse_wire_time(&end)?;
                if end < begin {
                    return Err(AgentError::InvalidValue {
                        reason: format!("interval end {end} is before its begin {begin}"),
                    });
                }
                let filter = if ports.is_empty() {
                    None
                } else {
                    let mut ids = BTreeSet::new();
                    for name in &ports {
                        ids.insert(resolve_port(&self.ports, name)?.id);
                    }
                    Some(ids)
                };
                Ok(Dispatch::Query(QueryJob {
                    replay: replay(self.hub.spool_path.clone(), begin, end),
                    ports: self.ports.clone(),
                    filter,
                    limit: self.hub.max_query_samples,
                }))
            }
            Command::Detach => {
                self.detach();
                Ok(Dispatch::Detach(ServerPacket::Response(Response::Detach {})))
            }
        }
    }

    fn inspect(&self, names: &[String]) -> Result<Response, AgentError> {
        let snapshot = self.snapshot();
        let mut values = BTreeMap::new();
        let mut put = |port: &Port| {
            let value = snapshot
                .value(port.id)
                .map(LogicVec::to_string)
                .unwrap_or_default();
            values.insert(port.name.clone(), value);
        };
        if names.is_empty() {
            snapshot.ports.iter().for_each(&mut put);
        } else {
            for name in names {
                put(resolve_port(&snapshot.ports, name)?);
            }
        }
        Ok(Response::InspectPorts {
            time: snapshot.time.to_wire(),
            values,
        })
    }

    fn subscribed_names(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter_map(|id| self.ports.get(id.index()))
            .map(|p| p.name.clone())
            .collect()
    }

    fn send(&mut self, command: AgentCommand, kind: PendingKind) -> Result<Dispatch, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.hub
            .requests
            .send(Request::Command {
                session: self.id,
                command,
                reply: tx,
            })
            .map_err(|_| closed_error(&self.snapshot()))?;
        Ok(Dispatch::Pending { reply: rx, kind })
    }

    /// Builds the response to a command once the agent replied.
    pub(crate) fn complete(
        &self,
        kind: PendingKind,
        result: Result<Result<AgentReply, AgentError>, oneshot::error::RecvError>,
    ) -> ServerPacket {
        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return ServerPacket::error(&err),
            Err(_) => return ServerPacket::error(&closed_error(&self.snapshot())),
        };
        let response = match (kind, reply) {
            (PendingKind::AddBreakpoint, AgentReply::BreakpointAdded(id)) => {
                Response::AddBreakpoint { id: id.as_raw() }
            }
            (PendingKind::Step, AgentReply::Stepped(time)) => Response::Step {
                time: time.to_wire(),
            },
            (PendingKind::Force, _) => Response::ForcePort {},
            (PendingKind::RemoveBreakpoint, _) => Response::RemoveBreakpoint {},
            (PendingKind::Continue, _) => Response::Continue {},
            (PendingKind::Pause, _) => Response::Pause {},
            (PendingKind::AddBreakpoint | PendingKind::Step, other) => {
                warn!(session = %self.id, ?kind, ?other, "unexpected agent reply");
                return ServerPacket::error(&AgentError::InvalidValue {
                    reason: format!("unexpected reply to {kind:?}"),
                });
            }
        };
        ServerPacket::Response(response)
    }

    /// Waits for the next control event or subscribed transitions.
    ///
    /// Returns `None` once the agent has gone away. Cancel safe.
    pub(crate) async fn next_events(&mut self) -> Option<Vec<ServerPacket>> {
        loop {
            let received = tokio::select! {
                event = self.control.recv() => Received::Control(event),
                batch = recv_batch(&mut self.transitions) => Received::Batch(batch),
            };
            match received {
                Received::Control(Ok(event)) => return Some(vec![control_packet(&event)]),
                Received::Control(Err(RecvError::Lagged(missed))) => {
                    warn!(session = %self.id, missed, "session lagged behind control events");
                }
                Received::Control(Err(RecvError::Closed)) => return None,
                Received::Batch(Ok(batch)) => {
                    let packets = self.transition_packets(&batch);
                    if !packets.is_empty() {
                        return Some(packets);
                    }
                }
                Received::Batch(Err(RecvError::Lagged(missed))) => {
                    warn!(session = %self.id, missed, "session dropped transition batches");
                }
                Received::Batch(Err(RecvError::Closed)) => self.transitions = None,
            }
        }
    }

    /// Collects events that are already queued, without waiting.
    pub(crate) fn try_events(&mut self) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        loop {
            match self.control.try_recv() {
                Ok(event) => packets.push(control_packet(&event)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        while let Some(rx) = self.transitions.as_mut() {
            match rx.try_recv() {
                Ok(batch) => {
                    let more = self.transition_packets(&batch);
                    packets.extend(more);
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => self.transitions = None,
            }
        }
        packets
    }

    fn transition_packets(&self, batch: &TransitionBatch) -> Vec<ServerPacket> {
        let time = batch.time.to_wire();
        batch
            .changes
            .iter()
            .filter(|(port, _)| self.subscriptions.contains(port))
            .filter_map(|(port, value)| {
                let name = self.ports.get(port.index())?.name.clone();
                Some(ServerPacket::Event(Event::Transition(WireSample {
                    time: time.clone(),
                    port: name,
                    value: value.to_string(),
                })))
            })
            .collect()
    }

    /// Tells the agent the session is gone. Idempotent.
    pub(crate) fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.subscriptions.clear();
        self.transitions = None;
        self.hub.active.fetch_sub(1, Ordering::AcqRel);
        // The agent may already be gone; nothing is waiting on this.
        let _ = self.hub.requests.send(Request::Detach { session: self.id });
        debug!(session = %self.id, "session detached");
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.detach();
    }
}

enum Received {
    Control(Result<ControlEvent, RecvError>),
    Batch(Result<TransitionBatch, RecvError>),
}

async fn recv_batch(
    rx: &mut Option<broadcast::Receiver<TransitionBatch>>,
) -> Result<TransitionBatch, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn control_packet(event: &ControlEvent) -> ServerPacket {
    let event = match event {
        ControlEvent::Paused { time, causes } => Event::SimulationPaused {
            time: time.to_wire(),
            causes: wire_causes(causes),
        },
        ControlEvent::Resumed { time } => Event::SimulationResumed {
            time: time.to_wire(),
        },
        ControlEvent::Finished { time } => Event::SimulationFinished {
            time: time.to_wire(),
        },
        ControlEvent::Fault { message } => Event::AgentFault {
            message: message.clone(),
        },
    };
    ServerPacket::Event(event)
}

/// A `query_interval` command, run against the spool file.
#[derive(Debug)]
pub(crate) struct QueryJob {
    replay: Replay,
    ports: Arc<[Port]>,
    filter: Option<BTreeSet<PortId>>,
    limit: usize,
}

impl QueryJob {
    pub(crate) fn run(self) -> ServerPacket {
        match self.collect() {
            Ok(response) => ServerPacket::Response(response),
            Err(err) => ServerPacket::error(&AgentError::Spool(err)),
        }
    }

    fn collect(&self) -> Result<Response, SpoolError> {
        let mut samples = Vec::new();
        let mut truncated = false;
        let mut corrupt_tail = false;
        for transition in self.replay.iter()? {
            let transition = match transition {
                Ok(t) => t,
                Err(SpoolError::CorruptTrailingRecord { .. }) => {
                    corrupt_tail = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            if self
                .filter
                .as_ref()
                .is_some_and(|f| !f.contains(&transition.port))
            {
                continue;
            }
            if samples.len() == self.limit {
                truncated = true;
                break;
            }
            let Some(port) = self.ports.get(transition.port.index()) else {
                continue;
            };
            samples.push(WireSample {
                time: transition.time.to_wire(),
                port: port.name.clone(),
                value: transition.after.to_string(),
            });
        }
        Ok(Response::QueryInterval {
            samples,
            truncated,
            corrupt_tail,
        })
    }
}

/// Opens in-process sessions on an agent.
///
/// Obtained from [`Agent::connector`](crate::Agent::connector). The connector
/// is `Send` and can be moved to other threads.
#[derive(Debug, Clone)]
pub struct SessionConnector {
    hub: SessionHub,
}

impl SessionConnector {
    pub(crate) fn new(hub: SessionHub) -> Self {
        Self { hub }
    }

    /// Attaches a new session.
    pub fn connect(&self) -> Result<LocalSession, AgentError> {
        Ok(LocalSession {
            core: self.hub.attach("local")?,
            events: VecDeque::new(),
        })
    }

    /// Returns the latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.hub.snapshot()
    }
}

/// An in-process debug session speaking the wire command set.
///
/// Calls block the current thread and must not be made from inside an async
/// runtime. Commands that reach the agent are answered at its next step
/// boundary, or immediately while it is paused.
#[derive(Debug)]
pub struct LocalSession {
    core: SessionCore,
    events: VecDeque<Event>,
}

impl LocalSession {
    /// Returns the session id.
    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    /// Runs a command and waits for its response.
    pub fn request(&mut self, command: Command) -> ServerPacket {
        match self.core.dispatch(command) {
            Dispatch::Ready(packet) | Dispatch::Detach(packet) => packet,
            Dispatch::Query(job) => job.run(),
            Dispatch::Pending { reply, kind } => {
                let result = reply.blocking_recv();
                self.core.complete(kind, result)
            }
        }
    }

    /// Returns the latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.core.snapshot()
    }

    /// Returns the next event, waiting up to `timeout`.
    pub fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_events();
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drains every event that is already queued.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.poll_events();
        self.events.drain(..).collect()
    }

    fn poll_events(&mut self) {
        for packet in self.core.try_events() {
            if let ServerPacket::Event(event) = packet {
                self.events.push_back(event);
            }
        }
    }

    /// Waits until a published snapshot satisfies `pred`, up to `timeout`.
    pub fn wait_until(
        &self,
        pred: impl Fn(&Snapshot) -> bool,
        timeout: Duration,
    ) -> Option<Arc<Snapshot>> {
        let snapshots = self.core.snapshots();
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = snapshots.borrow().clone();
            if pred(&snapshot) {
                return Some(snapshot);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Detaches the session.
    pub fn detach(mut self) {
        self.core.detach();
    }
}
