//! Message framing for direct peer connections
//!
//! Provides length-prefixed framing with a magic number identifying each
//! frame kind.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix plus magic number
const HEADER_LEN: usize = 8;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Unknown magic number: {0:#010x}")]
    UnknownMagic(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed {kind:?} frame: {reason}")]
    Malformed { kind: FrameKind, reason: String },
}

/// Frame kinds, tagged on the wire by magic number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameKind {
    /// Peer handshake carrying the sender's system name
    SystemName = 0x1E3F_5001,
    /// Go-Back-N data segment
    ArqData = 0x1E3F_5010,
    /// Go-Back-N cumulative acknowledgment
    ArqAck = 0x1E3F_5011,
    /// Keepalive
    Ping = 0x1E3F_5020,
    /// Keepalive response
    Pong = 0x1E3F_5021,
}

impl FrameKind {
    /// Magic number written on the wire
    pub fn magic(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1E3F_5001 => Ok(Self::SystemName),
            0x1E3F_5010 => Ok(Self::ArqData),
            0x1E3F_5011 => Ok(Self::ArqAck),
            0x1E3F_5020 => Ok(Self::Ping),
            0x1E3F_5021 => Ok(Self::Pong),
            other => Err(FrameError::UnknownMagic(other)),
        }
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Body bytes
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Bytes::new())
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Bytes::new())
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes the magic number)
/// - 4 bytes: magic number (big-endian)
/// - N bytes: body
///
/// The codec holds no state besides its size limit, so every connection
/// simply constructs its own.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }
        if length < 4 {
            return Err(FrameError::TooShort(length));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = FrameKind::try_from(src.get_u32())?;
        let body = src.split_to(length - 4).freeze();

        Ok(Some(Frame { kind, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 4 + item.body.len();
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u32(item.kind.magic());
        dst.put_slice(&item.body);

        Ok(())
    }
}
