//! Chunk types — the unit the pacer queues and transmits.

use std::sync::Arc;

use bytes::Bytes;
use dialtone_core::token::Token;

/// A chunk ready to be framed and sent.
///
/// `payload` is the DATA body after the token and stream id, already sized to
/// fit one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingChunk {
    pub token: Token,
    pub stream_id: u16,
    /// Index of this chunk within its message.
    pub seq: u32,
    /// Final chunk of its message.
    pub last: bool,
    pub payload: Bytes,
    /// Diagnostic label, shared by every chunk of one message.
    pub label: Arc<str>,
}

impl OutgoingChunk {
    /// Size of the DATA payload this chunk produces on the wire.
    pub fn frame_payload_len(&self) -> usize {
        dialtone_core::wire::DATA_PREFIX_LEN + self.payload.len()
    }
}
