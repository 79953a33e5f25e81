//! Packet framing: the outermost unit on the stream.
//!
//! Wire layout, 4-byte header followed by the payload:
//!
//! ```text
//! | type (u8) | length (u24, big-endian) | payload ... |
//! ```
//!
//! The length field caps payloads at 2^24 - 1 bytes. A receiver feeds raw
//! byte chunks into [`PacketDecoder`]; the decoder buffers partial frames
//! and yields zero or more complete packets per chunk, so chunk boundaries
//! never matter.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;

/// Packet header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload size representable in the 24-bit length field.
pub const MAX_PACKET_SIZE: usize = (1 << 24) - 1;

/// Packet type, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client opens the session; payload is UTF-8 JSON in both directions.
    Handshake = 0x01,
    /// Client acknowledges the server's handshake reply.
    HandshakeAck = 0x02,
    /// Keepalive in either direction; empty payload.
    Heartbeat = 0x03,
    /// Application data; payload is an encoded [`crate::Message`].
    Data = 0x04,
    /// Server evicts the client.
    Kick = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::HandshakeAck),
            0x03 => Ok(PacketType::Heartbeat),
            0x04 => Ok(PacketType::Data),
            0x05 => Ok(PacketType::Kick),
            _ => Err(ProtocolError::MalformedPacket("unknown packet type")),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub data: Vec<u8>,
}

/// Encode just the 4-byte header for a payload of `len` bytes. Writers
/// that gather-write header and body separately use this to avoid copying
/// the payload.
pub fn encode_header(kind: PacketType, len: usize) -> Result<[u8; HEADER_LEN], ProtocolError> {
    if len > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(len));
    }
    Ok([kind as u8, (len >> 16) as u8, (len >> 8) as u8, len as u8])
}

/// Encode one packet: header plus payload copied verbatim.
pub fn encode(kind: PacketType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header = encode_header(kind, payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Streaming packet decoder.
///
/// Holds an internal accumulator; [`PacketDecoder::feed`] appends a chunk
/// and pops every complete packet. A header is validated as soon as its
/// four bytes are present, even if the body is still in flight, so a bad
/// stream fails fast. After an error the decoder must be discarded along
/// with its connection.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(2048),
        }
    }

    /// Feed a chunk of stream bytes, returning all packets completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Packet>, ProtocolError> {
        self.buf.extend_from_slice(chunk);

        let mut packets = Vec::new();
        while self.buf.len() >= HEADER_LEN {
            let kind = PacketType::try_from(self.buf[0])?;
            let size = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if size > MAX_PACKET_SIZE {
                return Err(ProtocolError::MalformedPacket("declared length exceeds limit"));
            }
            if self.buf.len() < HEADER_LEN + size {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let data = self.buf.split_to(size).to_vec();
            packets.push(Packet { kind, data });
        }
        Ok(packets)
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let encoded = encode(PacketType::Data, &[0xaa, 0xbb]).unwrap();
        assert_eq!(encoded, vec![0x04, 0x00, 0x00, 0x02, 0xaa, 0xbb]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PACKET_SIZE + 1];
        assert_eq!(
            encode(PacketType::Data, &payload),
            Err(ProtocolError::PacketTooLarge(MAX_PACKET_SIZE + 1))
        );
    }

    #[test]
    fn round_trip_single() {
        let encoded = encode(PacketType::Handshake, b"{}").unwrap();
        let mut decoder = PacketDecoder::new();
        let packets = decoder.feed(&encoded).unwrap();
        assert_eq!(
            packets,
            vec![Packet {
                kind: PacketType::Handshake,
                data: b"{}".to_vec()
            }]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn round_trip_empty_payload() {
        let encoded = encode(PacketType::Heartbeat, &[]).unwrap();
        let mut decoder = PacketDecoder::new();
        let packets = decoder.feed(&encoded).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::Heartbeat);
        assert!(packets[0].data.is_empty());
    }

    // The streaming decoder must produce identical results no matter where
    // the chunk boundaries fall.
    #[test]
    fn resumption_safe_at_every_boundary() {
        let mut stream = Vec::new();
        stream.extend(encode(PacketType::Handshake, b"{\"a\":1}").unwrap());
        stream.extend(encode(PacketType::Heartbeat, &[]).unwrap());
        stream.extend(encode(PacketType::Data, &[1, 2, 3, 4, 5]).unwrap());

        let mut whole = PacketDecoder::new();
        let expected = whole.feed(&stream).unwrap();
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut decoder = PacketDecoder::new();
            let mut got = decoder.feed(&stream[..split]).unwrap();
            got.extend(decoder.feed(&stream[split..]).unwrap());
            assert_eq!(got, expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let encoded = encode(PacketType::Kick, b"bye").unwrap();
        let mut decoder = PacketDecoder::new();
        let mut got = Vec::new();
        for b in &encoded {
            got.extend(decoder.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, b"bye");
    }

    #[test]
    fn unknown_type_fails_before_body_arrives() {
        let mut decoder = PacketDecoder::new();
        // Type 0x09 does not exist; length claims 4 bytes that never come.
        let err = decoder.feed(&[0x09, 0x00, 0x00, 0x04]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn two_packets_in_one_chunk() {
        let mut stream = encode(PacketType::Data, b"one").unwrap();
        stream.extend(encode(PacketType::Data, b"two").unwrap());
        let mut decoder = PacketDecoder::new();
        let packets = decoder.feed(&stream).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data, b"one");
        assert_eq!(packets[1].data, b"two");
    }
}
