//! The cluster RPC bus.
//!
//! Nodes talk to each other over plain TCP carrying length-prefixed JSON
//! frames: a `u32` big-endian byte count followed by the serialized frame.
//! Each connection is driven by one task that writes a request and reads
//! its reply before taking the next, so correlation is a simple sequence
//! check. A small per-address pool gives concurrency across in-flight
//! calls without head-of-line blocking everything behind one socket.
//!
//! `call` awaits the reply; `cast` is fire-and-forget with failures
//! logged, which is what the data plane wants (the original client never
//! sees forwarding errors directly).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ServerError;

/// Upper bound for a single RPC frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Concurrent connections kept per remote address.
const POOL_SIZE: usize = 4;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered node as the cluster sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub label: String,
    pub service_addr: String,
    pub services: Vec<String>,
    pub is_master: bool,
}

/// Every operation on the cluster bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    // Master surface.
    Register { member: MemberInfo },
    Unregister { service_addr: String },
    Heartbeat { service_addr: String },

    // Master to member.
    NewMember { member: MemberInfo },
    DelMember { service_addr: String },

    // Gate to backend.
    HandleRequest {
        gate_addr: String,
        session_id: i64,
        id: u64,
        route: String,
        data: Vec<u8>,
    },
    HandleNotify {
        gate_addr: String,
        session_id: i64,
        route: String,
        data: Vec<u8>,
    },
    SessionClosed { session_id: i64 },

    // Backend to gate.
    HandlePush {
        session_id: i64,
        route: String,
        data: Vec<u8>,
    },
    HandleResponse {
        session_id: i64,
        id: u64,
        data: Vec<u8>,
    },
    CloseSession { session_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    Ok,
    Members(Vec<MemberInfo>),
    Error(String),
}

#[derive(Serialize)]
struct RequestFrameRef<'a> {
    seq: u64,
    request: &'a RpcRequest,
}

#[derive(Debug, Deserialize)]
struct RequestFrame {
    seq: u64,
    request: RpcRequest,
}

#[derive(Serialize, Deserialize)]
struct ReplyFrame {
    seq: u64,
    reply: RpcReply,
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ServerError> {
    let body = serde_json::to_vec(frame).map_err(|e| ServerError::Serialize(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ServerError::Rpc(format!("frame of {} bytes exceeds limit", body.len())));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read one frame; `None` means the peer closed cleanly between frames.
async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, ServerError>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(ServerError::Rpc(format!("incoming frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body).map_err(|e| ServerError::Deserialize(e.to_string()))?;
    Ok(Some(frame))
}

type Outbound = (RpcRequest, Option<oneshot::Sender<RpcReply>>);

/// Per-address connection pool, round-robin over its drivers.
struct RpcPool {
    conns: Vec<mpsc::UnboundedSender<Outbound>>,
    next: AtomicUsize,
}

impl RpcPool {
    fn new(addr: &str) -> Self {
        let conns = (0..POOL_SIZE)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(drive(addr.to_string(), rx));
                tx
            })
            .collect();
        Self {
            conns,
            next: AtomicUsize::new(0),
        }
    }

    fn send(&self, request: RpcRequest, reply: Option<oneshot::Sender<RpcReply>>) -> Result<(), ServerError> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[i]
            .send((request, reply))
            .map_err(|_| ServerError::Rpc("connection pool is closed".to_string()))
    }
}

/// One pooled connection: dial lazily, then strict write-reply cycles.
async fn drive(addr: String, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    let mut stream: Option<TcpStream> = None;
    let mut seq = 0u64;

    while let Some((request, reply_tx)) = rx.recv().await {
        seq += 1;
        let reused = stream.is_some();
        let mut result = roundtrip(&addr, &mut stream, seq, &request).await;
        if result.is_err() && reused {
            // The pooled socket may have died since its last use; one
            // fresh dial before giving up on this call.
            stream = None;
            result = roundtrip(&addr, &mut stream, seq, &request).await;
        }
        match result {
            Ok(reply) => {
                if let Some(tx) = reply_tx {
                    let _ = tx.send(reply);
                } else if let RpcReply::Error(message) = reply {
                    warn!(%addr, "rpc cast rejected by peer: {message}");
                }
            }
            Err(e) => {
                stream = None;
                warn!(%addr, "rpc failed: {e}");
                if let Some(tx) = reply_tx {
                    let _ = tx.send(RpcReply::Error(e.to_string()));
                }
            }
        }
    }
}

async fn roundtrip(
    addr: &str,
    stream: &mut Option<TcpStream>,
    seq: u64,
    request: &RpcRequest,
) -> Result<RpcReply, ServerError> {
    if stream.is_none() {
        let conn = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ServerError::Rpc(format!("connect to {addr} timed out")))??;
        conn.set_nodelay(true)?;
        *stream = Some(conn);
    }
    let conn = stream.as_mut().expect("stream populated above");

    let frame = encode_frame(&RequestFrameRef { seq, request })?;
    conn.write_all(&frame).await?;

    let reply: ReplyFrame = read_frame(conn)
        .await?
        .ok_or_else(|| ServerError::Rpc("connection closed mid-call".to_string()))?;
    if reply.seq != seq {
        return Err(ServerError::Rpc("reply sequence mismatch".to_string()));
    }
    Ok(reply.reply)
}

/// Client side of the bus: one pool per remote address.
pub(crate) struct RpcClient {
    pools: DashMap<String, Arc<RpcPool>>,
}

impl RpcClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
        })
    }

    fn pool(&self, addr: &str) -> Arc<RpcPool> {
        self.pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(RpcPool::new(addr)))
            .clone()
    }

    /// Send and await the reply. A peer-side `Error` reply becomes
    /// `ServerError::Rpc`.
    pub async fn call(&self, addr: &str, request: RpcRequest) -> Result<RpcReply, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.pool(addr).send(request, Some(tx))?;
        match rx.await {
            Ok(RpcReply::Error(message)) => Err(ServerError::Rpc(message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(ServerError::Rpc("connection dropped".to_string())),
        }
    }

    /// Fire-and-forget; delivery failures are logged by the driver.
    pub fn cast(&self, addr: &str, request: RpcRequest) {
        if let Err(e) = self.pool(addr).send(request, None) {
            warn!(%addr, "rpc cast not queued: {e}");
        }
    }

    /// Drop pools whose address is no longer a live member, bounding
    /// growth as the cluster churns.
    pub fn shrink_to(&self, live: &HashSet<String>) {
        self.pools.retain(|addr, _| live.contains(addr));
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

/// Server-side dispatch seam; the node implements this.
#[async_trait]
pub(crate) trait RpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, request: RpcRequest) -> RpcReply;
}

/// Accept loop for the bus listener. Stops on the process die signal.
pub(crate) async fn serve(
    listener: TcpListener,
    dispatch: Arc<dyn RpcDispatch>,
    mut die: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = die.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "cluster bus connection accepted");
                    let dispatch = dispatch.clone();
                    tokio::spawn(serve_conn(stream, dispatch));
                }
                Err(e) => {
                    warn!("cluster bus accept failed: {e}");
                }
            },
        }
    }
    debug!("cluster bus listener stopped");
}

async fn serve_conn(stream: TcpStream, dispatch: Arc<dyn RpcDispatch>) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame: RequestFrame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("cluster bus read failed: {e}");
                break;
            }
        };
        let reply = dispatch.dispatch(frame.request).await;
        let encoded = match encode_frame(&ReplyFrame { seq: frame.seq, reply }) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("cluster bus reply encode failed: {e}");
                break;
            }
        };
        if let Err(e) = writer.write_all(&encoded).await {
            debug!("cluster bus write failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_codec_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = RpcRequest::Heartbeat {
            service_addr: "127.0.0.1:4500".to_string(),
        };
        let encoded = encode_frame(&RequestFrameRef { seq: 9, request: &request }).unwrap();
        a.write_all(&encoded).await.unwrap();
        drop(a);

        let frame: RequestFrame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame.seq, 9);
        assert!(matches!(frame.request, RpcRequest::Heartbeat { .. }));
        // Clean close after the last frame reads as end-of-stream.
        assert!(read_frame::<RequestFrame, _>(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame::<RequestFrame, _>(&mut b).await.unwrap_err();
        assert!(matches!(err, ServerError::Rpc(_)));
    }

    struct Echo;

    #[async_trait]
    impl RpcDispatch for Echo {
        async fn dispatch(&self, request: RpcRequest) -> RpcReply {
            match request {
                RpcRequest::Heartbeat { .. } => RpcReply::Ok,
                RpcRequest::Register { member } => RpcReply::Members(vec![member]),
                _ => RpcReply::Error("unsupported".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn call_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (die_tx, _) = broadcast::channel(1);
        tokio::spawn(serve(listener, Arc::new(Echo), die_tx.subscribe()));

        let client = RpcClient::new();
        let reply = client
            .call(&addr, RpcRequest::Heartbeat { service_addr: "x".to_string() })
            .await
            .unwrap();
        assert_eq!(reply, RpcReply::Ok);

        let member = MemberInfo {
            label: "b1".to_string(),
            service_addr: "127.0.0.1:4501".to_string(),
            services: vec!["Topic".to_string()],
            is_master: false,
        };
        let reply = client
            .call(&addr, RpcRequest::Register { member: member.clone() })
            .await
            .unwrap();
        assert_eq!(reply, RpcReply::Members(vec![member]));

        // Peer-side errors surface as Rpc errors on call.
        let err = client
            .call(&addr, RpcRequest::SessionClosed { session_id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Rpc(_)));
    }

    #[tokio::test]
    async fn shrink_drops_departed_pools() {
        let client = RpcClient::new();
        client.cast("127.0.0.1:1", RpcRequest::SessionClosed { session_id: 1 });
        client.cast("127.0.0.1:2", RpcRequest::SessionClosed { session_id: 2 });
        assert_eq!(client.pool_count(), 2);
        let live: HashSet<String> = ["127.0.0.1:2".to_string()].into_iter().collect();
        client.shrink_to(&live);
        assert_eq!(client.pool_count(), 1);
    }
}
