//! # wsmux Wire Format
//!
//! Every multiplexer frame travels in exactly one message of the underlying
//! connection. A frame is never split across messages and a message never
//! carries more than one frame, so the codec works on whole messages.
//!
//! ## Frame layout (9-byte header + payload)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Frame Type   |              Stream ID (32, big endian)       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |              Length (32, big endian)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |              Payload (Length bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! SYN, FIN and RST carry no payload. WINDOW_UPDATE carries a 4-byte
//! big-endian credit delta.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header size: 1 (type) + 4 (stream id) + 4 (length).
pub const HEADER_SIZE: usize = 9;

/// Payload size of a WINDOW_UPDATE frame.
pub const WINDOW_UPDATE_LEN: usize = 4;

// ─── Frame Type ──────────────────────────────────────────────────────────────

/// Frame types understood by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a stream.
    Syn = 0,
    /// Carries stream bytes.
    Data = 1,
    /// Grants the peer additional send credit.
    WindowUpdate = 2,
    /// Ends the sender's write direction.
    Fin = 3,
    /// Aborts the stream in both directions.
    Rst = 4,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FrameType::Syn),
            1 => Some(FrameType::Data),
            2 => Some(FrameType::WindowUpdate),
            3 => Some(FrameType::Fin),
            4 => Some(FrameType::Rst),
            _ => None,
        }
    }

    /// Fixed payload length for control frames, `None` for DATA.
    fn fixed_len(self) -> Option<usize> {
        match self {
            FrameType::Syn | FrameType::Fin | FrameType::Rst => Some(0),
            FrameType::WindowUpdate => Some(WINDOW_UPDATE_LEN),
            FrameType::Data => None,
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Reasons an inbound message is not a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("message of {0} bytes is shorter than the frame header")]
    Truncated(usize),
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("stream {stream_id}: declared payload of {len} bytes exceeds the {max}-byte limit")]
    TooLarge { stream_id: u32, len: u32, max: u32 },
    #[error("stream {stream_id}: {frame_type:?} declares {declared} payload bytes but message carries {actual}")]
    LengthMismatch {
        frame_type: FrameType,
        stream_id: u32,
        declared: u32,
        actual: usize,
    },
    #[error("{frame_type:?} frame must carry {expected} payload bytes, got {actual}")]
    BadControlLength {
        frame_type: FrameType,
        expected: usize,
        actual: u32,
    },
}

impl FrameError {
    /// Whether the message could not even be read as a header. Everything else
    /// is confined to a single message and leaves the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Truncated(_))
    }

    /// The stream whose DATA was lost with this message, if the header named
    /// one. Dropping that frame would leave a hole in the stream, so the
    /// stream has to be reset.
    pub fn damaged_data_stream(&self) -> Option<u32> {
        match self {
            FrameError::TooLarge { stream_id, .. } => Some(*stream_id),
            FrameError::LengthMismatch {
                frame_type: FrameType::Data,
                stream_id,
                ..
            } => Some(*stream_id),
            _ => None,
        }
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// A single decoded multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32) -> Self {
        Self::control(FrameType::Syn, stream_id)
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Frame {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self::control(FrameType::Fin, stream_id)
    }

    pub fn rst(stream_id: u32) -> Self {
        Self::control(FrameType::Rst, stream_id)
    }

    fn control(frame_type: FrameType, stream_id: u32) -> Self {
        Frame {
            frame_type,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Credit carried by a WINDOW_UPDATE frame.
    pub fn credit(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate || self.payload.len() != WINDOW_UPDATE_LEN {
            return None;
        }
        Some((&self.payload[..]).get_u32())
    }

    /// Total size of the encoded message.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode the frame into one message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one message into a frame, rejecting DATA payloads larger than
    /// `max_payload`. The payload shares the message's allocation.
    pub fn decode(mut msg: Bytes, max_payload: u32) -> Result<Frame, FrameError> {
        if msg.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(msg.len()));
        }

        let type_byte = msg.get_u8();
        let stream_id = msg.get_u32();
        let declared = msg.get_u32();

        let frame_type = FrameType::from_byte(type_byte).ok_or(FrameError::UnknownType(type_byte))?;

        match frame_type.fixed_len() {
            Some(expected) if declared as usize != expected => {
                return Err(FrameError::BadControlLength {
                    frame_type,
                    expected,
                    actual: declared,
                });
            }
            None if declared > max_payload => {
                return Err(FrameError::TooLarge {
                    stream_id,
                    len: declared,
                    max: max_payload,
                });
            }
            _ => {}
        }

        if msg.len() != declared as usize {
            return Err(FrameError::LengthMismatch {
                frame_type,
                stream_id,
                declared,
                actual: msg.len(),
            });
        }

        Ok(Frame {
            frame_type,
            stream_id,
            payload: msg,
        })
    }
}
