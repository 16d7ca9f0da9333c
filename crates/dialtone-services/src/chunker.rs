//! Chunker — split an encoded atom stream into frame-sized chunks.
//!
//! Chunk boundaries fall anywhere inside atom data, but never inside an atom
//! header (tag + length), including the headers of atoms nested in action
//! bodies. A header that would straddle the boundary moves to the start of
//! the next chunk.

use std::sync::Arc;

use bytes::Bytes;
use dialtone_core::codec::AtomSpan;
use dialtone_core::token::Token;
use dialtone_core::wire::DATA_PREFIX_LEN;

use crate::chunk_types::OutgoingChunk;
use crate::script::CompileError;

/// Longest atom header: 2 tag bytes + 2 length bytes.
pub const MAX_ATOM_HEADER: usize = 4;

/// Split `encoded` into chunks whose frame payload fits `max_frame_payload`.
///
/// `spans` must cover every atom of `encoded`, nested ones included, in
/// offset order, as [`encode_atoms`](dialtone_core::codec::encode_atoms)
/// returns them.
pub fn chunk_stream(
    token: Token,
    stream_id: u16,
    encoded: &[u8],
    spans: &[AtomSpan],
    max_frame_payload: usize,
    label: &str,
) -> Result<Vec<OutgoingChunk>, CompileError> {
    let capacity = max_frame_payload
        .checked_sub(DATA_PREFIX_LEN)
        .filter(|c| *c >= MAX_ATOM_HEADER)
        .ok_or(CompileError::FrameTooSmall(max_frame_payload))?;

    let label: Arc<str> = Arc::from(label);
    let source = Bytes::copy_from_slice(encoded);
    let mut chunks = Vec::new();
    let mut pos = 0;
    let mut next_span = 0;

    while pos < encoded.len() {
        let mut end = (pos + capacity).min(encoded.len());

        // skip atoms whose header ends inside this chunk
        while spans
            .get(next_span)
            .is_some_and(|s| s.offset + s.header_len <= end)
        {
            next_span += 1;
        }
        if let Some(span) = spans.get(next_span) {
            if span.offset > pos && span.offset < end {
                end = span.offset;
            }
        }

        chunks.push(OutgoingChunk {
            token,
            stream_id,
            seq: chunks.len() as u32,
            last: false,
            payload: source.slice(pos..end),
            label: label.clone(),
        });
        pos = end;
    }

    if let Some(last) = chunks.last_mut() {
        last.last = true;
    }
    Ok(chunks)
}

/// A one-chunk message, e.g. a transfer control frame.
pub fn single(token: Token, stream_id: u16, body: Vec<u8>, label: &str) -> OutgoingChunk {
    OutgoingChunk {
        token,
        stream_id,
        seq: 0,
        last: true,
        payload: Bytes::from(body),
        label: Arc::from(label),
    }
}

/// Concatenate chunk payloads in order.
pub fn reassemble(chunks: &[OutgoingChunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.iter().map(|c| c.payload.len()).sum());
    for chunk in chunks {
        out.extend_from_slice(&chunk.payload);
    }
    out
}
