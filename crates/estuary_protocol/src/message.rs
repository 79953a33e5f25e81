//! Message codec: the payload layer inside `Data` packets.
//!
//! Wire layout:
//!
//! ```text
//! | flag (u8) | request id (varint)? | route (u16 | u8 len + bytes)? | payload ... |
//! ```
//!
//! The flag byte, msb to lsb: two reserved bits (must be zero), three type
//! bits, the compressed-route bit, the gzip bit, and the id-present bit.
//! The gzip bit is defined by the protocol but never produced; a decoder
//! seeing it set rejects the message rather than guessing at semantics.
//!
//! The request id is a little-endian varint: seven payload bits per byte,
//! low groups first, bit 7 set on every byte except the last. Routed kinds
//! carry either a two-byte dictionary id (compressed bit set) or a
//! length-prefixed UTF-8 string.

use crate::dictionary::Dictionary;
use crate::error::ProtocolError;

const FLAG_ID_PRESENT: u8 = 0x01;
const FLAG_GZIP: u8 = 0x02;
const FLAG_COMPRESSED_ROUTE: u8 = 0x04;
const FLAG_RESERVED_MASK: u8 = 0xc0;
const TYPE_SHIFT: u8 = 3;
const TYPE_MASK: u8 = 0x07;

/// Maximum raw route length: the length prefix is one byte.
pub const MAX_ROUTE_LEN: usize = 255;

/// The four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client to server, expects a correlated `Response`.
    Request = 0,
    /// Client to server, fire-and-forget.
    Notify = 1,
    /// Server to client, correlated by request id.
    Response = 2,
    /// Server to client, unsolicited.
    Push = 3,
}

impl MessageType {
    /// Request and Notify and Push name a handler; Response does not.
    pub fn routed(self) -> bool {
        !matches!(self, MessageType::Response)
    }

    /// Request and Response carry a request id.
    pub fn has_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Notify),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Push),
            _ => Err(ProtocolError::InvalidMessage("unknown message type")),
        }
    }
}

/// A decoded message. `route` is always the resolved string form; whether
/// it travelled compressed is a property of the wire, not of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// Request id; zero when the kind carries none.
    pub id: u64,
    /// Handler route; `None` for `Response`.
    pub route: Option<String>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn request(id: u64, route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Request,
            id,
            route: Some(route.into()),
            data,
        }
    }

    pub fn notify(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Notify,
            id: 0,
            route: Some(route.into()),
            data,
        }
    }

    pub fn response(id: u64, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Response,
            id,
            route: None,
            data,
        }
    }

    pub fn push(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Push,
            id: 0,
            route: Some(route.into()),
            data,
        }
    }

    /// Encode the header followed by the payload verbatim. Routes present
    /// in `dict` travel as their two-byte id.
    pub fn encode(&self, dict: &Dictionary) -> Result<Vec<u8>, ProtocolError> {
        let route = match (&self.route, self.kind.routed()) {
            (Some(r), true) => Some(r.as_str()),
            (None, false) => None,
            (None, true) => return Err(ProtocolError::InvalidMessage("routed kind without route")),
            (Some(_), false) => return Err(ProtocolError::InvalidMessage("response carries no route")),
        };
        if let Some(r) = route {
            if r.len() > MAX_ROUTE_LEN {
                return Err(ProtocolError::RouteTooLong(r.len()));
            }
        }

        let compressed = route.and_then(|r| dict.id_of(r));
        let mut flag = (self.kind as u8) << TYPE_SHIFT;
        if self.kind.has_id() {
            flag |= FLAG_ID_PRESENT;
        }
        if compressed.is_some() {
            flag |= FLAG_COMPRESSED_ROUTE;
        }

        let mut out = Vec::with_capacity(1 + 10 + route.map_or(0, |r| r.len() + 1) + self.data.len());
        out.push(flag);

        if self.kind.has_id() {
            encode_varint(self.id, &mut out);
        }

        match (compressed, route) {
            (Some(id), _) => out.extend_from_slice(&id.to_be_bytes()),
            (None, Some(r)) => {
                out.push(r.len() as u8);
                out.extend_from_slice(r.as_bytes());
            }
            (None, None) => {}
        }

        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decode one message from a complete `Data` payload.
    pub fn decode(data: &[u8], dict: &Dictionary) -> Result<Self, ProtocolError> {
        let flag = *data.first().ok_or(ProtocolError::InvalidMessage("empty message"))?;
        if flag & FLAG_RESERVED_MASK != 0 {
            return Err(ProtocolError::InvalidMessage("reserved flag bits set"));
        }
        if flag & FLAG_GZIP != 0 {
            return Err(ProtocolError::InvalidMessage("gzip flag is not supported"));
        }
        let kind = MessageType::try_from((flag >> TYPE_SHIFT) & TYPE_MASK)?;
        if (flag & FLAG_ID_PRESENT != 0) != kind.has_id() {
            return Err(ProtocolError::InvalidMessage("id flag does not match message type"));
        }

        let mut offset = 1usize;
        let id = if kind.has_id() {
            let (id, read) = decode_varint(&data[offset..])?;
            offset += read;
            id
        } else {
            0
        };

        let route = if kind.routed() {
            if flag & FLAG_COMPRESSED_ROUTE != 0 {
                let bytes = data
                    .get(offset..offset + 2)
                    .ok_or(ProtocolError::InvalidMessage("truncated route id"))?;
                offset += 2;
                let code = u16::from_be_bytes([bytes[0], bytes[1]]);
                let route = dict
                    .route_of(code)
                    .ok_or(ProtocolError::InvalidMessage("route id not in dictionary"))?;
                Some(route.to_string())
            } else {
                let len = *data
                    .get(offset)
                    .ok_or(ProtocolError::InvalidMessage("truncated route length"))? as usize;
                offset += 1;
                let bytes = data
                    .get(offset..offset + len)
                    .ok_or(ProtocolError::InvalidMessage("truncated route"))?;
                offset += len;
                let route = std::str::from_utf8(bytes)
                    .map_err(|_| ProtocolError::InvalidMessage("route is not UTF-8"))?;
                Some(route.to_string())
            }
        } else {
            if flag & FLAG_COMPRESSED_ROUTE != 0 {
                return Err(ProtocolError::InvalidMessage("response carries no route"));
            }
            None
        };

        Ok(Self {
            kind,
            id,
            route,
            data: data[offset..].to_vec(),
        })
    }
}

/// Append `value` as a little-endian base-128 varint.
fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

/// Read a varint, returning the value and the bytes consumed.
fn decode_varint(data: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(ProtocolError::InvalidMessage("varint does not fit in 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::InvalidMessage("truncated varint"))
}
