//! Custom packet protocol shared by client and server.
//!
//! Every datagram starts with a fixed 15-byte header, all fields big-endian:
//!
//! | Field          | Size | Meaning                                   |
//! |----------------|------|-------------------------------------------|
//! | Protocol ID    | 4    | Magic number `0x47414D45` ("GAME")        |
//! | Sequence       | 2    | Outgoing sequence number                  |
//! | Ack            | 2    | Latest received remote sequence           |
//! | Ack Bitfield   | 4    | Acks for the 32 sequences before `ack`    |
//! | Packet Type    | 1    | Type identifier                           |
//! | Payload Length | 2    | Length of the payload that follows        |
//!
//! The codec is pure: it performs no I/O and validates nothing beyond the
//! magic number, lengths, and (unless the caller opts into passthrough) the
//! type byte. Semantic validation belongs to the packet handlers.

use thiserror::Error;

/// Magic number identifying the protocol, "GAME" in ASCII.
pub const PROTOCOL_ID: u32 = 0x4741_4D45;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 15;

/// Wire size of one input frame: sequence u32, move_x f32, move_y f32,
/// actions u8.
pub const INPUT_FRAME_SIZE: usize = 13;

/// Wire size of a PING/PONG payload: one f64 timestamp.
pub const PING_PAYLOAD_SIZE: usize = 8;

/// Packet type identifiers, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    ConnectReq = 0x01,
    ConnectAck = 0x02,
    Disconnect = 0x03,
    Input = 0x04,
    Snapshot = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    ReliableEvent = 0x08,
    Heartbeat = 0x09,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ConnectReq),
            0x02 => Some(Self::ConnectAck),
            0x03 => Some(Self::Disconnect),
            0x04 => Some(Self::Input),
            0x05 => Some(Self::Snapshot),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::Pong),
            0x08 => Some(Self::ReliableEvent),
            0x09 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Decoding failures. All of these are peer-induced and must never crash a
/// receive loop; handlers log them at debug level and drop the datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("truncated header: {0} bytes")]
    TruncatedHeader(usize),
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
}

/// A single protocol datagram: header fields plus raw payload bytes.
///
/// The type is stored as the raw wire byte so that passthrough decoding can
/// preserve unknown types; [`Packet::kind`] resolves it to a [`PacketType`].
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: u8,
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, sequence: u16, ack: u16, ack_bits: u32, payload: Vec<u8>) -> Self {
        Self {
            packet_type: kind as u8,
            sequence,
            ack,
            ack_bits,
            payload,
        }
    }

    /// Resolves the raw type byte, if it names a known packet type.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    /// Serializes the packet for transmission.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.ack_bits.to_be_bytes());
        buf.push(self.packet_type);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserializes a datagram, rejecting unknown packet types.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let packet = Self::decode_passthrough(data)?;
        if packet.kind().is_none() {
            return Err(PacketError::UnknownType(packet.packet_type));
        }
        Ok(packet)
    }

    /// Deserializes a datagram, keeping unknown type bytes for callers that
    /// route them elsewhere.
    pub fn decode_passthrough(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TruncatedHeader(data.len()));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PROTOCOL_ID {
            return Err(PacketError::BadMagic(magic));
        }

        let sequence = u16::from_be_bytes([data[4], data[5]]);
        let ack = u16::from_be_bytes([data[6], data[7]]);
        let ack_bits = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let packet_type = data[12];
        let payload_len = u16::from_be_bytes([data[13], data[14]]) as usize;

        let remaining = data.len() - HEADER_SIZE;
        if remaining < payload_len {
            return Err(PacketError::TruncatedPayload {
                expected: payload_len,
                actual: remaining,
            });
        }

        Ok(Self {
            packet_type,
            sequence,
            ack,
            ack_bits,
            payload: data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        })
    }
}

/// Returns true when sequence `a` is newer than `b` under 16-bit wrap-around.
///
/// "Newer" means the wrapped distance `a - b` lies strictly in the lower half
/// of the sequence space, which makes the order total and antisymmetric; the
/// naive `a > b` breaks at the 65535 to 0 wrap.
#[inline]
pub fn sequence_newer_u16(a: u16, b: u16) -> bool {
    let d = a.wrapping_sub(b);
    d != 0 && d < 0x8000
}

/// 32-bit variant of [`sequence_newer_u16`], used for input sequences. Wrap
/// is irrelevant in practice at input rates but the order is defined anyway.
#[inline]
pub fn sequence_newer_u32(a: u32, b: u32) -> bool {
    let d = a.wrapping_sub(b);
    d != 0 && d < 0x8000_0000
}

/// One frame of player input as carried in an INPUT payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputFrame {
    /// Monotonically nondecreasing per client session.
    pub sequence: u32,
    pub move_x: f32,
    pub move_y: f32,
    /// Action bitfield, opaque to the netcode.
    pub actions: u8,
}

impl InputFrame {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.move_x.to_be_bytes());
        buf.extend_from_slice(&self.move_y.to_be_bytes());
        buf.push(self.actions);
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < INPUT_FRAME_SIZE {
            return Err(PacketError::TruncatedPayload {
                expected: INPUT_FRAME_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            sequence: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            move_x: f32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            move_y: f32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            actions: data[12],
        })
    }
}

/// Packs input frames into the redundant INPUT payload: a count byte followed
/// by the frames, oldest first.
pub fn encode_input_batch(frames: &[InputFrame]) -> Vec<u8> {
    debug_assert!(frames.len() <= u8::MAX as usize);
    let mut buf = Vec::with_capacity(1 + frames.len() * INPUT_FRAME_SIZE);
    buf.push(frames.len() as u8);
    for frame in frames {
        frame.encode_into(&mut buf);
    }
    buf
}

/// Unpacks an INPUT payload.
///
/// A payload of exactly one frame with no count byte is also accepted, so
/// minimal test clients can send a bare frame.
pub fn decode_input_batch(payload: &[u8]) -> Result<Vec<InputFrame>, PacketError> {
    if payload.len() == INPUT_FRAME_SIZE {
        return Ok(vec![InputFrame::decode(payload)?]);
    }
    if payload.is_empty() {
        return Err(PacketError::TruncatedPayload {
            expected: 1,
            actual: 0,
        });
    }

    let count = payload[0] as usize;
    let expected = 1 + count * INPUT_FRAME_SIZE;
    if payload.len() < expected {
        return Err(PacketError::TruncatedPayload {
            expected,
            actual: payload.len(),
        });
    }

    let mut frames = Vec::with_capacity(count);
    let mut offset = 1;
    for _ in 0..count {
        frames.push(InputFrame::decode(&payload[offset..offset + INPUT_FRAME_SIZE])?);
        offset += INPUT_FRAME_SIZE;
    }
    Ok(frames)
}

/// Encodes a PING/PONG timestamp payload. The server echoes these eight
/// bytes verbatim, so only the sender ever interprets them.
pub fn encode_ping_timestamp(seconds: f64) -> Vec<u8> {
    seconds.to_be_bytes().to_vec()
}

/// Decodes a PING/PONG timestamp payload.
pub fn decode_ping_timestamp(payload: &[u8]) -> Result<f64, PacketError> {
    if payload.len() < PING_PAYLOAD_SIZE {
        return Err(PacketError::TruncatedPayload {
            expected: PING_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    let mut raw = [0u8; PING_PAYLOAD_SIZE];
    raw.copy_from_slice(&payload[..PING_PAYLOAD_SIZE]);
    Ok(f64::from_be_bytes(raw))
}
