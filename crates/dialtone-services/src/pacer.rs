//! Frame pacer — per-connection FIFO of chunks, drained in bounded bursts.
//!
//! `enqueue` never blocks. `drain_limited` frames up to `max_burst` chunks as
//! DATA frames and hands them to the connection's outbound channel with
//! `try_send`. When the channel is full the chunk goes back to the front of
//! the queue and the drain stops, so the socket writer's progress is what
//! paces the link. Once the channel is closed both calls log and do nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use dialtone_core::wire::{self, DataPayload, FrameKind, WireError};

use crate::chunk_types::OutgoingChunk;

/// Pacing limits, injected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerLimits {
    pub max_burst: usize,
    pub max_frame_payload: usize,
}

impl Default for PacerLimits {
    fn default() -> Self {
        Self {
            max_burst: 16,
            max_frame_payload: wire::DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }
}

#[derive(Debug)]
struct Queue {
    chunks: VecDeque<OutgoingChunk>,
    /// Sequence number of the last DATA frame handed to the channel.
    tx_seq: u8,
}

#[derive(Debug)]
pub struct FramePacer {
    /// Connection label for logs.
    peer: String,
    limits: PacerLimits,
    queue: Mutex<Queue>,
    /// Last sequence number received from the client.
    rx_seq: AtomicU8,
    closed: AtomicBool,
    ready: Notify,
}

impl FramePacer {
    pub fn new(peer: impl Into<String>, limits: PacerLimits) -> Self {
        Self {
            peer: peer.into(),
            limits,
            queue: Mutex::new(Queue {
                chunks: VecDeque::new(),
                tx_seq: wire::SEQ_MAX,
            }),
            rx_seq: AtomicU8::new(wire::SEQ_MAX),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }

    pub fn limits(&self) -> PacerLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append chunks to the back of the queue and wake the writer.
    pub fn enqueue(&self, chunks: Vec<OutgoingChunk>, label: &str) {
        if self.is_closed() {
            tracing::warn!(
                peer = %self.peer,
                label,
                dropped = chunks.len(),
                "enqueue on closed connection"
            );
            return;
        }
        let count = chunks.len();
        let depth = {
            let mut q = self.lock();
            q.chunks.extend(chunks);
            q.chunks.len()
        };
        tracing::debug!(peer = %self.peer, label, count, depth, "enqueued");
        self.ready.notify_one();
    }

    /// Send up to `max_burst` chunks from the front of the queue, in order.
    /// Returns how many were handed to `sink`.
    pub fn drain_limited(&self, sink: &mpsc::Sender<Bytes>, max_burst: usize) -> usize {
        self.drain_with(sink, max_burst, |_| {})
    }

    /// [`drain_limited`](Self::drain_limited), calling `on_sent` for each
    /// chunk accepted by `sink`. Runs under the queue lock.
    pub fn drain_with(
        &self,
        sink: &mpsc::Sender<Bytes>,
        max_burst: usize,
        mut on_sent: impl FnMut(&OutgoingChunk),
    ) -> usize {
        if self.is_closed() {
            tracing::debug!(peer = %self.peer, "drain on closed connection");
            return 0;
        }
        let rx = self.rx_seq.load(Ordering::Relaxed);
        let mut q = self.lock();
        let mut sent = 0;

        while sent < max_burst {
            let Some(chunk) = q.chunks.pop_front() else {
                break;
            };
            let tx = wire::next_seq(q.tx_seq);
            let frame = match frame_chunk(&chunk, tx, rx) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, label = %chunk.label, error = %e, "dropping unframeable chunk");
                    continue;
                }
            };
            match sink.try_send(frame) {
                Ok(()) => {
                    q.tx_seq = tx;
                    sent += 1;
                    on_sent(&chunk);
                }
                Err(TrySendError::Full(_)) => {
                    q.chunks.push_front(chunk);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    q.chunks.push_front(chunk);
                    drop(q);
                    self.close();
                    tracing::warn!(peer = %self.peer, sent, "outbound channel closed during drain");
                    return sent;
                }
            }
        }

        if sent > 0 {
            tracing::debug!(peer = %self.peer, sent, remaining = q.chunks.len(), "drained");
        }
        sent
    }

    /// Frame a control frame (ACK, SSR, heartbeat) with the current
    /// sequence numbers. Control frames do not advance the tx sequence.
    pub fn control_frame(&self, kind: FrameKind, payload: &[u8]) -> Result<Bytes, WireError> {
        let tx = self.lock().tx_seq;
        wire::encode_frame(kind, tx, self.rx_seq.load(Ordering::Relaxed), payload)
    }

    /// Record the sequence number of a frame received from the client.
    pub fn set_rx_seq(&self, seq: u8) {
        self.rx_seq.store(seq, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until something is enqueued.
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    /// Mark the channel gone. Queued chunks stay where they are but are
    /// never sent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = %self.peer, pending = self.pending(), "pacer closed");
        }
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn frame_chunk(chunk: &OutgoingChunk, tx: u8, rx: u8) -> Result<Bytes, WireError> {
    let payload = DataPayload {
        token: chunk.token,
        stream_id: chunk.stream_id,
        data: chunk.payload.clone(),
    }
    .encode();
    wire::encode_frame(FrameKind::Data, tx, rx, &payload)
}
