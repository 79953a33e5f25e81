//! Protocol-level error taxonomy.
//!
//! Every error in this crate is fatal to the originating session: the
//! caller logs it and closes the connection. Recovery happens by
//! reconnecting, never by resynchronizing a broken stream.

use thiserror::Error;

/// Errors that can arise when encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Packet payload exceeds the 24-bit length field.
    #[error("packet payload of {0} bytes exceeds the {limit} byte limit", limit = crate::packet::MAX_PACKET_SIZE)]
    PacketTooLarge(usize),

    /// The packet stream is not parseable: unknown type byte or an
    /// impossible declared length.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The message header or body is not parseable.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Routes are length-prefixed with a single byte on the wire.
    #[error("route of {0} bytes exceeds the 255 byte limit")]
    RouteTooLong(usize),

    /// Dictionary construction saw the same route string twice.
    #[error("duplicate route in dictionary: {0}")]
    DuplicateRoute(String),

    /// Dictionary construction saw the same route id twice.
    #[error("duplicate route id in dictionary: {0:#06x}")]
    DuplicateRouteId(u16),
}
