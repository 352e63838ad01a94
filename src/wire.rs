//! # Frame Codec
//!
//! Fixed 64-byte header, network byte order, borrowed-payload decode (no copy
//! beyond the `Bytes` refcount bump). One frame per UDP datagram.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        connection_id (64)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           data_id (64)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | frame_type(8)|                  sequence (32)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            total (32)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       fec_group_id (32)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         fec_index (16)       | priority(8) |   reserved...    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    frame_total_length (32)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         reserved (...)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Layout is chosen for simplicity of decode (all fixed offsets), not for
//! minimal wire overhead — the header is a flat 64 bytes regardless of
//! payload size, padded with reserved bytes kept zeroed for forward
//! compatibility.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header, in bytes.
pub const HEADER_SIZE: usize = 64;

/// Bytes consumed by the fields that precede the reserved padding.
const FIELDS_SIZE: usize = 8 + 8 + 1 + 4 + 4 + 4 + 2 + 1 + 4;

// ─── Frame Type ──────────────────────────────────────────────────────────────

/// The closed set of frame types the wire format can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    DataAck = 1,
    BatchAck = 2,
    AllAck = 3,
    Ping = 4,
    Pong = 5,
    ConnectRequest = 6,
    ConnectResponse = 7,
    Off = 8,
    PeerOff = 9,
    Fec = 10,
    Heartbeat = 11,
    StreamCreate = 12,
    StreamClose = 13,
    MtuDetect = 14,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => FrameType::Data,
            1 => FrameType::DataAck,
            2 => FrameType::BatchAck,
            3 => FrameType::AllAck,
            4 => FrameType::Ping,
            5 => FrameType::Pong,
            6 => FrameType::ConnectRequest,
            7 => FrameType::ConnectResponse,
            8 => FrameType::Off,
            9 => FrameType::PeerOff,
            10 => FrameType::Fec,
            11 => FrameType::Heartbeat,
            12 => FrameType::StreamCreate,
            13 => FrameType::StreamClose,
            14 => FrameType::MtuDetect,
            _ => return None,
        })
    }
}

// ─── Priority ────────────────────────────────────────────────────────────────

/// Relative send priority. Ordering matters: higher variants win scheduling
/// ties in the flow/congestion admission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Disposable = 0,
    Standard = 1,
    Reference = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Standard
    }
}

impl Priority {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Priority::Disposable,
            1 => Priority::Standard,
            2 => Priority::Reference,
            3 => Priority::Critical,
            _ => return None,
        })
    }
}

// ─── Frame Header ────────────────────────────────────────────────────────────

/// Decoded 64-byte frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub connection_id: u64,
    pub data_id: u64,
    pub frame_type: FrameType,
    pub sequence: u32,
    pub total: u32,
    /// 0 when FEC is not in use for this frame.
    pub fec_group_id: u32,
    /// 0 when FEC is not in use for this frame.
    pub fec_index: u16,
    pub priority: Priority,
    pub frame_total_length: u32,
}

impl FrameHeader {
    /// `sequence` must land in `[0, total)`, except `total == 1` control
    /// frames (handshake/keepalive) which always carry `sequence == 0`.
    fn validate(&self) -> Result<(), TransportError> {
        if self.total == 0 {
            return Err(TransportError::MalformedFrame {
                reason: "total must be >= 1",
            });
        }
        if self.sequence >= self.total {
            return Err(TransportError::MalformedFrame {
                reason: "sequence out of range for total",
            });
        }
        if (self.frame_total_length as usize) < HEADER_SIZE {
            return Err(TransportError::MalformedFrame {
                reason: "frame_total_length shorter than header",
            });
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.connection_id);
        buf.put_u64(self.data_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.sequence);
        buf.put_u32(self.total);
        buf.put_u32(self.fec_group_id);
        buf.put_u16(self.fec_index);
        buf.put_u8(self.priority as u8);
        buf.put_u32(self.frame_total_length);
        buf.put_bytes(0, HEADER_SIZE - FIELDS_SIZE);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, TransportError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(TransportError::MalformedFrame {
                reason: "buffer shorter than header",
            });
        }
        let connection_id = buf.get_u64();
        let data_id = buf.get_u64();
        let frame_type = FrameType::from_byte(buf.get_u8()).ok_or(TransportError::MalformedFrame {
            reason: "unknown frame_type",
        })?;
        let sequence = buf.get_u32();
        let total = buf.get_u32();
        let fec_group_id = buf.get_u32();
        let fec_index = buf.get_u16();
        let priority = Priority::from_byte(buf.get_u8()).ok_or(TransportError::MalformedFrame {
            reason: "unknown priority",
        })?;
        let frame_total_length = buf.get_u32();
        buf.advance(HEADER_SIZE - FIELDS_SIZE);

        let header = FrameHeader {
            connection_id,
            data_id,
            frame_type,
            sequence,
            total,
            fec_group_id,
            fec_index,
            priority,
            frame_total_length,
        };
        header.validate()?;
        Ok(header)
    }

    /// Build a header for a single-sequence control frame (`total == 1`).
    pub fn control(connection_id: u64, data_id: u64, frame_type: FrameType, payload_len: usize) -> Self {
        FrameHeader {
            connection_id,
            data_id,
            frame_type,
            sequence: 0,
            total: 1,
            fec_group_id: 0,
            fec_index: 0,
            priority: Priority::Standard,
            frame_total_length: (HEADER_SIZE + payload_len) as u32,
        }
    }

    /// Build a header for one fragment of a data message.
    #[allow(clippy::too_many_arguments)]
    pub fn data(
        connection_id: u64,
        data_id: u64,
        sequence: u32,
        total: u32,
        priority: Priority,
        payload_len: usize,
    ) -> Self {
        FrameHeader {
            connection_id,
            data_id,
            frame_type: FrameType::Data,
            sequence,
            total,
            fec_group_id: 0,
            fec_index: 0,
            priority,
            frame_total_length: (HEADER_SIZE + payload_len) as u32,
        }
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// A full wire frame: header plus borrowed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a complete frame. Borrows the payload out of `data` with no
    /// copy via `Buf::copy_to_bytes` on a `Bytes`-backed cursor (a ref-count
    /// bump, not a memcpy, when `data` is itself a `Bytes`).
    pub fn decode(data: &mut Bytes) -> Result<Self, TransportError> {
        if data.len() < HEADER_SIZE {
            return Err(TransportError::MalformedFrame {
                reason: "datagram shorter than header",
            });
        }
        let mut cursor = data.clone();
        let header = FrameHeader::decode(&mut cursor)?;
        let payload_len = header.frame_total_length as usize - HEADER_SIZE;
        if cursor.remaining() < payload_len {
            return Err(TransportError::MalformedFrame {
                reason: "payload shorter than frame_total_length",
            });
        }
        let payload = cursor.copy_to_bytes(payload_len);
        Ok(Frame { header, payload })
    }
}

// ─── Batch ACK bitmap ────────────────────────────────────────────────────────

/// Encode a set of acknowledged sequences `[0, total)` into a BATCH_ACK
/// bitmap: length `ceil(total/8)`, bit `i` (MSB-first within byte `i/8`)
/// corresponds to sequence `i`.
pub fn encode_batch_ack_bitmap(acked: &std::collections::BTreeSet<u32>, total: u32) -> Bytes {
    let len = ((total as usize) + 7) / 8;
    let mut bitmap = vec![0u8; len];
    for &seq in acked {
        if seq >= total {
            continue;
        }
        let byte_idx = (seq / 8) as usize;
        let bit_idx = 7 - (seq % 8);
        bitmap[byte_idx] |= 1 << bit_idx;
    }
    Bytes::from(bitmap)
}

/// Iterate the sequences set in a BATCH_ACK bitmap sized for `total`
/// sequences. Returns `None` if `bitmap.len() != ceil(total/8)`.
pub fn decode_batch_ack_bitmap(bitmap: &[u8], total: u32) -> Option<impl Iterator<Item = u32> + '_> {
    let expected_len = ((total as usize) + 7) / 8;
    if bitmap.len() != expected_len {
        return None;
    }
    Some((0..total).filter(move |&seq| {
        let byte_idx = (seq / 8) as usize;
        let bit_idx = 7 - (seq % 8);
        bitmap[byte_idx] & (1 << bit_idx) != 0
    }))
}
