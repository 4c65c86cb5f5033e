//! The TCP debug link.
//!
//! The link runs on its own multi-threaded runtime so the stepping thread
//! never enters async code. Each accepted connection gets a reader task that
//! splits NUL-terminated packets and a session task that multiplexes client
//! packets, control events and subscribed transitions.

use crate::error::AgentError;
use crate::protocol::{
    check_greeting, decode_frame, encode_frame, ClientPacket, ProtocolError, ServerPacket,
    FRAME_TERMINATOR, MAX_FRAME_LEN,
};
use crate::session::{AgentReply, Dispatch, SessionCore, SessionHub};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use vigil_config::LinkConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const FRAME_QUEUE: usize = 16;

/// A running debug link. Dropping it without [`shutdown`](Self::shutdown)
/// stops the runtime abruptly.
#[derive(Debug)]
pub struct DebugLink {
    runtime: Runtime,
    local_addr: SocketAddr,
    uri: String,
    shutdown: watch::Sender<bool>,
    sessions_done: mpsc::Receiver<()>,
}

impl DebugLink {
    /// Binds the listener and starts accepting sessions.
    pub(crate) fn start(config: &LinkConfig, hub: SessionHub) -> Result<Self, AgentError> {
        let addr: SocketAddr = config.bind.parse().map_err(|e| AgentError::InvalidValue {
            reason: format!("link bind address '{}': {e}", config.bind),
        })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("vigil-link")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        let uri = format!("tcp://{local_addr}");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (done_tx, sessions_done) = mpsc::channel(1);
        runtime.spawn(accept_loop(listener, hub, shutdown_rx, done_tx));
        info!(%uri, "debug link listening");
        Ok(Self {
            runtime,
            local_addr,
            uri,
            shutdown,
            sessions_done,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `tcp://<ip>:<port>`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Closes every session, letting each flush its pending events first.
    ///
    /// Blocks on the link runtime; panics if called from inside another one.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let done = &mut self.sessions_done;
        let drained = self
            .runtime
            .block_on(async { tokio::time::timeout(SHUTDOWN_GRACE, done.recv()).await });
        if drained.is_err() {
            warn!(uri = %self.uri, "debug sessions did not close in time");
        }
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!(uri = %self.uri, "debug link stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: SessionHub,
    mut shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "debug connection accepted");
                let hub = hub.clone();
                let shutdown = shutdown.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    match serve(stream, peer, hub, shutdown).await {
                        Ok(()) => {}
                        Err(e @ AgentError::LinkDisconnected { .. }) => {
                            warn!(%peer, error = %e, "debug connection lost")
                        }
                        Err(e) => warn!(%peer, error = %e, "debug connection failed"),
                    }
                    drop(done);
                });
            }
            Err(e) => {
                warn!(error = %e, "failed to accept debug connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// A unit read from the socket.
#[derive(Debug)]
enum Frame {
    Packet(Vec<u8>),
    Oversized(usize),
    Failed(io::Error),
}

/// Splits the byte stream into packets. Runs as its own task so that the
/// session loop only ever awaits a cancel-safe channel receive.
async fn read_frames(read_half: OwnedReadHalf, frames: mpsc::Sender<Frame>) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut buf = Vec::new();
        let limit = MAX_FRAME_LEN as u64 + 1;
        let frame = match (&mut reader).take(limit).read_until(FRAME_TERMINATOR, &mut buf).await {
            Ok(0) => break,
            Ok(_) if buf.last() == Some(&FRAME_TERMINATOR) => Frame::Packet(buf),
            Ok(n) if n as u64 >= limit => Frame::Oversized(n),
            // Connection closed in the middle of a packet.
            Ok(_) => break,
            Err(e) => Frame::Failed(e),
        };
        let last = !matches!(frame, Frame::Packet(_));
        if frames.send(frame).await.is_err() || last {
            break;
        }
    }
}

async fn write_packet(writer: &mut OwnedWriteHalf, packet: &ServerPacket) -> io::Result<()> {
    let frame = encode_frame(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    hub: SessionHub,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let _ = stream.set_nodelay(true);
    let (read_half, mut writer) = stream.into_split();
    let (frames_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
    let reader = tokio::spawn(read_frames(read_half, frames_tx));
    let result = run_session(&mut frames, &mut writer, peer, hub, shutdown).await;
    reader.abort();
    let _ = writer.shutdown().await;
    result
}

enum Next {
    Frame(Option<Frame>),
    Events(Option<Vec<ServerPacket>>),
    Shutdown,
}

/// How a greeted session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The client detached, or the server closed the session.
    Closed,
    /// The client went away without detaching.
    Lost,
}

async fn run_session(
    frames: &mut mpsc::Receiver<Frame>,
    writer: &mut OwnedWriteHalf,
    peer: SocketAddr,
    hub: SessionHub,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let first = tokio::select! {
        frame = frames.recv() => frame,
        _ = shutdown.changed() => return Ok(()),
    };
    let greeting = match first {
        None => return Ok(()),
        Some(Frame::Failed(e)) => return Err(e.into()),
        Some(Frame::Oversized(len)) => Err(ProtocolError::TooLarge { len }),
        Some(Frame::Packet(bytes)) => {
            decode_frame::<ClientPacket>(&bytes).and_then(|packet| check_greeting(&packet))
        }
    };
    if let Err(err) = greeting {
        warn!(%peer, error = %err, "debug handshake failed");
        write_packet(writer, &ServerPacket::protocol_error(&err)).await?;
        return Ok(());
    }
    let mut core = match hub.attach(peer.to_string()) {
        Ok(core) => core,
        Err(err) => {
            warn!(%peer, error = %err, "debug session refused");
            write_packet(writer, &ServerPacket::error(&err)).await?;
            return Ok(());
        }
    };
    let session = core.id();
    info!(%session, %peer, "debug client greeted");

    let end = drive_session(&mut core, frames, writer, &mut shutdown).await;
    core.detach();
    match end {
        Ok(SessionEnd::Closed) => Ok(()),
        Ok(SessionEnd::Lost) => Err(AgentError::LinkDisconnected { session }),
        Err(e) => {
            debug!(%session, error = %e, "debug transport failed");
            Err(AgentError::LinkDisconnected { session })
        }
    }
}

/// Serves commands and forwards events until the session ends.
async fn drive_session(
    core: &mut SessionCore,
    frames: &mut mpsc::Receiver<Frame>,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<SessionEnd> {
    write_packet(writer, &ServerPacket::greeting()).await?;
    loop {
        let next = tokio::select! {
            frame = frames.recv() => Next::Frame(frame),
            events = core.next_events() => Next::Events(events),
            _ = shutdown.changed() => Next::Shutdown,
        };
        let bytes = match next {
            Next::Frame(Some(Frame::Packet(bytes))) => bytes,
            Next::Frame(None) => return Ok(SessionEnd::Lost),
            Next::Frame(Some(Frame::Failed(e))) => return Err(e),
            Next::Frame(Some(Frame::Oversized(len))) => {
                let err = ProtocolError::TooLarge { len };
                write_packet(writer, &ServerPacket::protocol_error(&err)).await?;
                return Ok(SessionEnd::Closed);
            }
            Next::Events(Some(packets)) => {
                for packet in &packets {
                    write_packet(writer, packet).await?;
                }
                continue;
            }
            Next::Events(None) => return Ok(SessionEnd::Closed),
            Next::Shutdown => {
                for packet in &core.try_events() {
                    write_packet(writer, packet).await?;
                }
                return Ok(SessionEnd::Closed);
            }
        };

        let command = match decode_frame::<ClientPacket>(&bytes) {
            Ok(ClientPacket::Command(command)) => command,
            Ok(ClientPacket::Greeting { .. }) => {
                let err = ProtocolError::AlreadyGreeted;
                write_packet(writer, &ServerPacket::protocol_error(&err)).await?;
                continue;
            }
            Err(err) => {
                debug!(session = %core.id(), error = %err, "rejected packet");
                write_packet(writer, &ServerPacket::protocol_error(&err)).await?;
                continue;
            }
        };

        match core.dispatch(command) {
            Dispatch::Ready(packet) => write_packet(writer, &packet).await?,
            Dispatch::Detach(packet) => {
                write_packet(writer, &packet).await?;
                return Ok(SessionEnd::Closed);
            }
            Dispatch::Query(job) => {
                let packet = tokio::task::spawn_blocking(move || job.run())
                    .await
                    .map_err(io::Error::other)?;
                write_packet(writer, &packet).await?;
            }
            Dispatch::Pending { reply, kind } => {
                match await_reply(core, reply, writer, shutdown).await? {
                    Some(result) => write_packet(writer, &core.complete(kind, result)).await?,
                    None => return Ok(SessionEnd::Closed),
                }
            }
        }
    }
}

type ReplyResult = Result<Result<AgentReply, AgentError>, oneshot::error::RecvError>;

/// Waits for the agent's reply while still forwarding events.
///
/// Returns `None` if the link shuts down first.
async fn await_reply(
    core: &mut SessionCore,
    mut reply: oneshot::Receiver<Result<AgentReply, AgentError>>,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<Option<ReplyResult>> {
    loop {
        let events = tokio::select! {
            result = &mut reply => return Ok(Some(result)),
            events = core.next_events() => events,
            _ = shutdown.changed() => return Ok(None),
        };
        for packet in events.iter().flatten() {
            write_packet(writer, packet).await?;
        }
    }
}
