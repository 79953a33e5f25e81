//! Direct-connection agent.
//!
//! An agent owns one client connection (raw TCP or a WebSocket binary
//! channel) and splits it between two workers:
//!
//! * the **reader** (driven by the dispatcher's serve loop) feeds the
//!   packet decoder and walks the handshake state machine;
//! * the **writer** drains a bounded queue of pending messages, emits
//!   heartbeats on the server's clock, and tears the session down when the
//!   peer goes quiet for more than twice the heartbeat interval.
//!
//! `push`/`response` enqueue onto the writer and fail fast with
//! `BufferExceeded` when the queue is full — callers decide whether to
//! drop the message or the session. `notify` never touches the socket; it
//! re-enters the dispatcher as an internal RPC.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use estuary_protocol::{packet, Message, MessageType, PacketType};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::handler::ForwardFn;
use crate::env::NodeEnv;
use crate::error::ServerError;
use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;
use crate::session::{unix_now, NetworkEntity, Session};

/// Capacity of the per-agent pending-message queue.
pub(crate) const WRITE_BACKLOG: usize = 16;

/// Read buffer size for raw TCP connections.
const READ_BUF_SIZE: usize = 2048;

pub(crate) const STATUS_START: i32 = 0;
pub(crate) const STATUS_HANDSHAKE: i32 = 1;
pub(crate) const STATUS_WORKING: i32 = 2;
pub(crate) const STATUS_CLOSED: i32 = 3;

/// A message queued for the writer.
#[derive(Debug)]
pub(crate) struct PendingMessage {
    pub kind: MessageType,
    pub route: Option<String>,
    pub mid: u64,
    pub payload: Vec<u8>,
}

/// What the writer worker consumes.
#[derive(Debug)]
pub(crate) enum WriterCmd {
    /// Pre-encoded packet bytes, written as-is (handshake reply).
    Raw(Vec<u8>),
    /// A message still needing header encode and the outbound pipeline.
    Message(PendingMessage),
}

/// An accepted client connection, before splitting.
pub(crate) enum GateStream {
    Tcp(TcpStream),
    Ws(Box<WebSocketStream<TcpStream>>),
}

impl GateStream {
    pub(crate) fn remote_addr(&self) -> String {
        let peer = match self {
            GateStream::Tcp(s) => s.peer_addr(),
            GateStream::Ws(s) => s.get_ref().peer_addr(),
        };
        peer.map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string())
    }

    fn split(self) -> (GateReader, GateWriter) {
        match self {
            GateStream::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (
                    GateReader::Tcp {
                        half: read,
                        buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
                    },
                    GateWriter::Tcp(write),
                )
            }
            GateStream::Ws(stream) => {
                let (sink, stream) = (*stream).split();
                (GateReader::Ws(stream), GateWriter::Ws(sink))
            }
        }
    }
}

/// Inbound half: raw byte chunks for the packet decoder.
pub(crate) enum GateReader {
    Tcp { half: OwnedReadHalf, buf: Box<[u8]> },
    Ws(SplitStream<WebSocketStream<TcpStream>>),
}

impl GateReader {
    /// Next chunk of stream bytes; `None` on a clean end of stream.
    pub(crate) async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            GateReader::Tcp { half, buf } => {
                let n = half.read(buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    Ok(Some(buf[..n].to_vec()))
                }
            }
            GateReader::Ws(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => {
                        return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                    }
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    // Pings are answered by the protocol layer; pongs and
                    // raw frames carry nothing for us.
                    Some(Ok(_)) => continue,
                }
            },
        }
    }
}

/// Outbound half: gather-writes of `[packet header, message bytes...]`.
pub(crate) enum GateWriter {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WebSocketStream<TcpStream>, WsMessage>),
}

impl GateWriter {
    async fn write_frame(&mut self, parts: &[&[u8]]) -> std::io::Result<()> {
        match self {
            GateWriter::Tcp(half) => {
                for part in parts {
                    half.write_all(part).await?;
                }
                Ok(())
            }
            GateWriter::Ws(sink) => {
                let total: usize = parts.iter().map(|p| p.len()).sum();
                let mut frame = Vec::with_capacity(total);
                for part in parts {
                    frame.extend_from_slice(part);
                }
                sink.send(WsMessage::Binary(frame.into()))
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
            }
        }
    }
}

/// Server-side owner of one live client connection.
pub(crate) struct Agent {
    env: Arc<NodeEnv>,
    scheduler: Scheduler,
    forward: ForwardFn,
    state: AtomicI32,
    last_at: AtomicI64,
    last_mid: AtomicU64,
    chan: mpsc::Sender<WriterCmd>,
    die: watch::Sender<bool>,
    remote_addr: String,
    session: OnceLock<Weak<Session>>,
}

impl Agent {
    /// Build an agent without a transport. The writer queue receiver is
    /// returned for the caller to drive (the real writer task, or a test).
    pub(crate) fn new_detached(
        env: Arc<NodeEnv>,
        scheduler: Scheduler,
        forward: ForwardFn,
        remote_addr: String,
    ) -> (Arc<Self>, mpsc::Receiver<WriterCmd>, watch::Receiver<bool>) {
        let (chan, rx) = mpsc::channel(WRITE_BACKLOG);
        let (die, die_rx) = watch::channel(false);
        let agent = Arc::new(Self {
            env,
            scheduler,
            forward,
            state: AtomicI32::new(STATUS_START),
            last_at: AtomicI64::new(unix_now()),
            last_mid: AtomicU64::new(0),
            chan,
            die,
            remote_addr,
            session: OnceLock::new(),
        });
        (agent, rx, die_rx)
    }

    /// Accept a connection: create the agent and its session, then spawn
    /// the writer. The reader half goes back to the caller's serve loop.
    pub(crate) fn spawn(
        env: Arc<NodeEnv>,
        scheduler: Scheduler,
        pipeline: Option<Pipeline>,
        forward: ForwardFn,
        stream: GateStream,
    ) -> (Arc<Self>, Arc<Session>, GateReader) {
        let remote_addr = stream.remote_addr();
        let (reader, writer) = stream.split();
        let (agent, rx, die_rx) = Self::new_detached(env.clone(), scheduler, forward, remote_addr);
        let session = Session::new(agent.clone() as Arc<dyn NetworkEntity>, env);
        agent.attach_session(&session);
        tokio::spawn(write_loop(writer, rx, die_rx, agent.clone(), session.clone(), pipeline));
        (agent, session, reader)
    }

    pub(crate) fn attach_session(&self, session: &Arc<Session>) {
        let _ = self.session.set(Arc::downgrade(session));
    }

    pub(crate) fn status(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: i32) -> i32 {
        self.state.swap(status, Ordering::AcqRel)
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_at.store(now, Ordering::Release);
    }

    pub(crate) fn last_at(&self) -> i64 {
        self.last_at.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_die(&self) -> watch::Receiver<bool> {
        self.die.subscribe()
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    fn send(&self, cmd: WriterCmd) -> Result<(), ServerError> {
        match self.chan.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::BufferExceeded),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ServerError::BrokenPipe),
        }
    }

    /// Queue pre-encoded packet bytes (the cached handshake reply).
    pub(crate) fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ServerError> {
        if self.status() == STATUS_CLOSED {
            return Err(ServerError::BrokenPipe);
        }
        self.send(WriterCmd::Raw(bytes))
    }
}

impl NetworkEntity for Agent {
    fn push(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
        if self.status() == STATUS_CLOSED {
            return Err(ServerError::BrokenPipe);
        }
        if self.env.debug {
            let sid = self.session().map(|s| s.id()).unwrap_or(0);
            debug!("Type=Push, ID={sid}, Route={route}, Data={}bytes", data.len());
        }
        self.send(WriterCmd::Message(PendingMessage {
            kind: MessageType::Push,
            route: Some(route.to_string()),
            mid: 0,
            payload: data,
        }))
    }

    fn notify(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
        if self.status() == STATUS_CLOSED {
            return Err(ServerError::BrokenPipe);
        }
        let session = self.session().ok_or(ServerError::BrokenPipe)?;
        (self.forward)(&session, Message::notify(route, data));
        Ok(())
    }

    fn response_mid(&self, mid: u64, data: Vec<u8>) -> Result<(), ServerError> {
        if self.status() == STATUS_CLOSED {
            return Err(ServerError::BrokenPipe);
        }
        if mid == 0 {
            return Err(ServerError::SessionOnNotify);
        }
        if self.env.debug {
            let sid = self.session().map(|s| s.id()).unwrap_or(0);
            debug!("Type=Response, ID={sid}, MID={mid}, Data={}bytes", data.len());
        }
        self.send(WriterCmd::Message(PendingMessage {
            kind: MessageType::Response,
            route: None,
            mid,
            payload: data,
        }))
    }

    fn close(&self) -> Result<(), ServerError> {
        if self.set_status(STATUS_CLOSED) == STATUS_CLOSED {
            return Err(ServerError::CloseClosedSession);
        }
        if self.env.debug {
            debug!("session closed, Remote={}", self.remote_addr);
        }
        // First close wins: stop both workers, then run the lifetime
        // hooks on the scheduler thread.
        let _ = self.die.send(true);
        if let Some(session) = self.session() {
            let env = self.env.clone();
            self.scheduler.run(Box::new(move || env.lifetime.close(&session)));
        }
        Ok(())
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::Acquire)
    }

    fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::Release);
    }
}

/// The peer is dead once it has been silent for two heartbeat intervals.
pub(crate) fn heartbeat_expired(last_at: i64, now: i64, heartbeat: Duration) -> bool {
    now - last_at > 2 * heartbeat.as_secs() as i64
}

async fn write_loop(
    mut writer: GateWriter,
    mut rx: mpsc::Receiver<WriterCmd>,
    mut agent_die: watch::Receiver<bool>,
    agent: Arc<Agent>,
    session: Arc<Session>,
    pipeline: Option<Pipeline>,
) {
    let env = agent.env.clone();
    let mut process_die = env.subscribe_die();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + env.heartbeat,
        env.heartbeat,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = unix_now();
                if heartbeat_expired(agent.last_at(), now, env.heartbeat) {
                    warn!(
                        session = session.id(),
                        last_at = agent.last_at(),
                        "session heartbeat timeout"
                    );
                    break;
                }
                if let Err(e) = writer.write_frame(&[env.heartbeat_packet()]).await {
                    debug!(session = session.id(), "heartbeat write failed: {e}");
                    break;
                }
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                let pending = match cmd {
                    WriterCmd::Raw(bytes) => {
                        if let Err(e) = writer.write_frame(&[&bytes]).await {
                            debug!(session = session.id(), "socket write failed: {e}");
                            break;
                        }
                        continue;
                    }
                    WriterCmd::Message(pending) => pending,
                };
                let mut message = match pending.kind {
                    MessageType::Push => {
                        let Some(route) = pending.route else { continue };
                        Message::push(route, pending.payload)
                    }
                    MessageType::Response => Message::response(pending.mid, pending.payload),
                    // Request/Notify never enter the writer queue.
                    _ => continue,
                };
                if let Some(pipeline) = &pipeline {
                    if let Err(e) = pipeline.outbound().process(&session, &mut message) {
                        warn!(session = session.id(), "outbound pipeline failed: {e}");
                        continue;
                    }
                }
                let body = match message.encode(&env.dictionary) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(session = session.id(), "message encode failed: {e}");
                        continue;
                    }
                };
                let header = match packet::encode_header(PacketType::Data, body.len()) {
                    Ok(header) => header,
                    Err(e) => {
                        warn!(session = session.id(), "packet encode failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = writer.write_frame(&[&header, &body]).await {
                    debug!(session = session.id(), "socket write failed: {e}");
                    break;
                }
            }
            _ = agent_die.changed() => break,
            _ = process_die.recv() => break,
        }
    }

    // Whatever ended the loop, the connection is done.
    let _ = agent.close();
    if env.debug {
        debug!(session = session.id(), "session writer exited");
    }
}
