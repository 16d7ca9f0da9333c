//! P3 link framing — the envelope every byte to and from a client travels in.
//!
//! These types ARE the link protocol spoken by the installed client base.
//! Every field, every width, every constant is part of the wire format.
//!
//! Frame layout:
//!
//! ```text
//!   [0x5A][crc16 be][len be][tx seq][rx seq][type] [payload ...] [0x0D]
//! ```
//!
//! `len` counts tx seq, rx seq, type, and payload. The CRC is CRC-16/ARC over
//! `len` through the end of the payload. DATA payloads start with a two-byte
//! token and a big-endian stream id.

use bytes::{Buf, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::token::Token;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every P3 frame.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always FRAME_MAGIC. Anything else means the decoder lost sync.
    pub magic: u8,

    /// CRC-16/ARC of len..payload, big-endian.
    pub crc: [u8; 2],

    /// Bytes following this field up to (not including) the terminator.
    pub len: [u8; 2],

    /// Sender's sequence number for this frame.
    pub tx_seq: u8,

    /// Last sequence number the sender received from its peer.
    pub rx_seq: u8,

    /// FrameKind byte.
    pub kind: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 8]);

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x20,
    Ss = 0x21,
    Ssr = 0x22,
    Init = 0x23,
    Ack = 0x24,
    Nak = 0x25,
    Heartbeat = 0x26,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x20 => Ok(FrameKind::Data),
            0x21 => Ok(FrameKind::Ss),
            0x22 => Ok(FrameKind::Ssr),
            0x23 => Ok(FrameKind::Init),
            0x24 => Ok(FrameKind::Ack),
            0x25 => Ok(FrameKind::Nak),
            0x26 => Ok(FrameKind::Heartbeat),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

pub const FRAME_MAGIC: u8 = 0x5A;
pub const FRAME_TERMINATOR: u8 = 0x0D;
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Token + stream id at the start of every DATA payload.
pub const DATA_PREFIX_LEN: usize = 4;

/// Default negotiated payload ceiling for one frame (token + stream id + data).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 119;

/// Hard ceiling imposed by the 16-bit length field.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize - 3;

/// Sequence numbers cycle through this range.
pub const SEQ_MIN: u8 = 0x10;
pub const SEQ_MAX: u8 = 0x7F;

/// Advance a sequence number, wrapping from SEQ_MAX back to SEQ_MIN.
pub fn next_seq(seq: u8) -> u8 {
    if !(SEQ_MIN..SEQ_MAX).contains(&seq) {
        SEQ_MIN
    } else {
        seq + 1
    }
}

/// CRC-16/ARC (poly 0x8005 reflected, init 0).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tx_seq: u8,
    pub rx_seq: u8,
    pub payload: Bytes,
}

/// DATA frame payload, split into its routing prefix and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub token: Token,
    pub stream_id: u16,
    pub data: Bytes,
}

impl DataPayload {
    pub fn parse(payload: &Bytes) -> Result<Self, WireError> {
        if payload.len() < DATA_PREFIX_LEN {
            return Err(WireError::ShortPayload {
                need: DATA_PREFIX_LEN,
                got: payload.len(),
            });
        }
        Ok(Self {
            token: [payload[0], payload[1]],
            stream_id: u16::from_be_bytes([payload[2], payload[3]]),
            data: payload.slice(DATA_PREFIX_LEN..),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_PREFIX_LEN + self.data.len());
        out.extend_from_slice(&self.token);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Build a complete frame.
pub fn encode_frame(
    kind: FrameKind,
    tx_seq: u8,
    rx_seq: u8,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let len = (3 + payload.len()) as u16;

    let mut body = Vec::with_capacity(5 + payload.len());
    body.extend_from_slice(&len.to_be_bytes());
    body.push(tx_seq);
    body.push(rx_seq);
    body.push(kind.into());
    body.extend_from_slice(payload);
    let crc = crc16(&body);

    let header = FrameHeader {
        magic: FRAME_MAGIC,
        crc: crc.to_be_bytes(),
        len: len.to_be_bytes(),
        tx_seq,
        rx_seq,
        kind: kind.into(),
    };

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out.push(FRAME_TERMINATOR);
    Ok(Bytes::from(out))
}

/// Incremental decoder for an inbound byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// On a framing error the offending bytes are discarded so the next call
    /// resynchronizes on the following magic byte.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] != FRAME_MAGIC {
            let bad = self.buf[0];
            let skip = self
                .buf
                .iter()
                .position(|b| *b == FRAME_MAGIC)
                .unwrap_or(self.buf.len());
            self.buf.advance(skip);
            return Err(WireError::BadMagic(bad));
        }
        let header = match FrameHeader::read_from_prefix(&self.buf[..]) {
            Some(h) => h,
            None => return Ok(None),
        };

        let len = u16::from_be_bytes(header.len) as usize;
        if len < 3 {
            self.buf.advance(1);
            return Err(WireError::BadLength(len as u16));
        }
        let total = 5 + len + 1;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf.split_to(total).freeze();
        if frame[total - 1] != FRAME_TERMINATOR {
            return Err(WireError::MissingTerminator);
        }
        let expected = u16::from_be_bytes(header.crc);
        let actual = crc16(&frame[3..total - 1]);
        if expected != actual {
            return Err(WireError::CrcMismatch { expected, actual });
        }

        Ok(Some(Frame {
            kind: FrameKind::try_from(header.kind)?,
            tx_seq: header.tx_seq,
            rx_seq: header.rx_seq,
            payload: frame.slice(FRAME_HEADER_LEN..total - 1),
        }))
    }
}

// ── Client profile ────────────────────────────────────────────────────────────

/// Client platform, announced in the INIT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Mac,
    #[default]
    Unknown,
}

/// Capability facts a client announces when the link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ClientProfile {
    pub platform: Platform,
    pub version: u16,
    /// Client can render colour art (bit 0 of the flags byte).
    pub color: bool,
}

impl ClientProfile {
    /// INIT payload: `[platform][version be 2][flags]`. Missing bytes default.
    pub fn from_init(payload: &[u8]) -> Self {
        let platform = match payload.first() {
            Some(b'W') | Some(1) => Platform::Windows,
            Some(b'M') | Some(2) => Platform::Mac,
            _ => Platform::Unknown,
        };
        let version = match payload.get(1..3) {
            Some(v) => u16::from_be_bytes([v[0], v[1]]),
            None => 0,
        };
        let color = payload.get(3).map(|f| f & 0x01 != 0).unwrap_or(false);
        Self {
            platform,
            version,
            color,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting link-level data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic: 0x{0:02x}")]
    BadMagic(u8),

    #[error("bad frame length: {0}")]
    BadLength(u16),

    #[error("frame crc mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("frame terminator missing")]
    MissingTerminator,

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("payload too short: need {need} bytes, got {got}")]
    ShortPayload { need: usize, got: usize },

    #[error("text field is not valid utf-8")]
    BadText,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
