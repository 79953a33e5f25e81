//! Wire framing and message codec for the estuary framework.
//!
//! Everything a client and a server exchange rides on two nested layers:
//!
//! * **Packets** — the framed unit on the stream (TCP, or a WebSocket
//!   binary frame carrying the same bytes). A four-byte header gives the
//!   packet type and a 24-bit big-endian payload length.
//! * **Messages** — the payload of a `Data` packet. One flag byte encodes
//!   the message kind, whether a request id follows, and whether the route
//!   travels as a two-byte dictionary id or as a raw string.
//!
//! These types ARE the protocol. Every field, every bit, every reserved
//! value is part of the wire format; changing anything here is a breaking
//! change for deployed clients.

pub mod dictionary;
pub mod error;
pub mod message;
pub mod packet;

pub use dictionary::Dictionary;
pub use error::ProtocolError;
pub use message::{Message, MessageType};
pub use packet::{Packet, PacketDecoder, PacketType, MAX_PACKET_SIZE};
