// Framing for windshift messages: a fixed 12-byte header followed by a
// JSON-encoded message payload. The header stores version, flags and length;
// the magic is a wire constant checked on decode, never carried in memory.
use bytes::{Bytes, BytesMut};

pub mod headers;
mod message;

pub use message::{
    ErrorCode, EventData, EventFrame, Message, Retention, StorageKind, StreamPointer, StreamSource,
};

/// `WSH1` in ASCII.
pub const MAGIC: u32 = 0x57534831;
pub const VERSION: u16 = 1;

/// No frame flags are defined yet; the field is reserved and must be zero so
/// it stays usable for protocol evolution.
pub const FLAG_NONE: u16 = 0;

/// Hard ceiling on payload size. Services enforce their own (lower)
/// configured limit on top of this.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not a windshift frame")]
    InvalidMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("reserved frame flags set: {0:#06x}")]
    ReservedFlags(u16),
    #[error("payload of {size} bytes exceeds the frame limit")]
    FrameTooLarge { size: usize },
    #[error("frame truncated: expected {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("message codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Decoded frame header. The magic has already been verified by the time a
/// value of this type exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    fn new(flags: u16, length: u32) -> Self {
        Self {
            version: VERSION,
            flags,
            length,
        }
    }

    /// Write the header, magic included, in network byte order.
    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Parse and verify a header. Magic, version and the reserved flag field
    /// are all checked before the length is trusted.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::Truncated {
                expected: Self::LEN,
                actual: buf.len(),
            });
        }
        if buf[0..4] != MAGIC.to_be_bytes() {
            return Err(Error::InvalidMagic);
        }
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = u16::from_be_bytes([buf[6], buf[7]]);
        if flags != FLAG_NONE {
            return Err(Error::ReservedFlags(flags));
        }
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self {
            version,
            flags,
            length,
        })
    }
}

/// One windshift frame: header plus message payload.
///
/// Frames normally come from [`Message::encode`]; `Frame` itself only deals
/// in bytes.
///
/// ```
/// use windshift_wire::Message;
///
/// let frame = Message::Ack { ids: vec![1] }.encode().expect("encode");
/// let bytes = frame.encode();
/// let decoded = windshift_wire::Frame::decode(bytes).expect("decode");
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
            });
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut header_bytes = [0u8; FrameHeader::LEN];
        self.header.encode_into(&mut header_bytes);
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&input)?;
        let expected = FrameHeader::LEN + header.length as usize;
        if input.len() < expected {
            return Err(Error::Truncated {
                expected,
                actual: input.len(),
            });
        }
        let payload = input.slice(FrameHeader::LEN..expected);
        Ok(Self { header, payload })
    }
}
