//! Server error taxonomy.
//!
//! Errors fall into five families with different blast radii:
//!
//! * **Protocol** — fatal to the originating session: log and close.
//! * **Transport** — surfaced to the caller of `push`/`response`; the
//!   writer's own failures close the session.
//! * **Dispatch** — returned across RPC boundaries and logged; the
//!   originating client never sees them directly.
//! * **Application** — handler-returned errors are logged; user-visible
//!   failures are the handler's job to deliver.
//! * **Lifecycle** — programmer errors, returned to the caller.

use estuary_protocol::ProtocolError;
use thiserror::Error;

/// Errors produced by the server framework.
#[derive(Debug, Error)]
pub enum ServerError {
    // Protocol — fatal to the session.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A `Data` packet arrived before the handshake ack.
    #[error("data packet received before handshake ack")]
    DataBeforeAck,

    /// The route names no local or remote handler.
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    /// The configured handshake validator refused the client.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    // Transport.
    /// The low-level connection is gone.
    #[error("broken low-level pipe")]
    BrokenPipe,

    /// The session send queue is full; the caller decides whether to drop
    /// the message or the session.
    #[error("session send buffer exceeded")]
    BufferExceeded,

    // Dispatch.
    #[error("service not found in current node: {0}")]
    ServiceNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(i64),

    // Lifecycle — programmer errors.
    #[error("session is already closed")]
    CloseClosedSession,

    /// `response` was called while handling a notify (no request id).
    #[error("current session is handling a notify")]
    SessionOnNotify,

    /// A session must be bound to a uid before joining a group.
    #[error("session is not bound to a uid")]
    SessionNotBound,

    /// `bind` requires a positive uid.
    #[error("illegal uid: {0}")]
    IllegalUid(i64),

    #[error("group is closed")]
    GroupClosed,

    // Registration.
    #[error("service already defined: {0}")]
    DuplicateService(String),

    #[error("duplicate handler in service {service}: {method}")]
    DuplicateHandler { service: String, method: String },

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    // Serialization.
    #[error("serialize: {0}")]
    Serialize(String),

    #[error("deserialize: {0}")]
    Deserialize(String),

    // Cluster plane.
    #[error("rpc: {0}")]
    Rpc(String),

    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
