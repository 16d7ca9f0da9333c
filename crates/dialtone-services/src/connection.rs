//! Connections and the registry of signed-on screen names.
//!
//! A [`Connection`] exists from sign-on until the socket goes away. It owns
//! the frame pacer, the transfer slots and the sender half of the socket
//! writer's channel. The [`ConnectionRegistry`] maps a normalized screen name
//! to its live connection; a second sign-on for the same name evicts the
//! first.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use dialtone_core::token;
use dialtone_core::wire::{ClientProfile, FrameKind};

use crate::chunk_types::OutgoingChunk;
use crate::pacer::{FramePacer, PacerLimits};
use crate::xfer::{Direction, TransferSlots};

/// Registry key for a screen name: lowercase, spaces removed.
pub fn normalize_screen_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    /// Display form.
    pub screen_name: String,
    /// Normalized form; the registry key and storage owner.
    pub identity: String,
    pub profile: ClientProfile,
    pub connected_at: SystemTime,
    pub pacer: FramePacer,
    pub transfers: TransferSlots,
    outbound: mpsc::Sender<Bytes>,
    next_stream: AtomicU16,
    /// Flips to true once, when the connection is closed or evicted.
    closing: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: u64,
        screen_name: impl Into<String>,
        profile: ClientProfile,
        outbound: mpsc::Sender<Bytes>,
        limits: PacerLimits,
    ) -> Self {
        let screen_name = screen_name.into();
        let identity = normalize_screen_name(&screen_name);
        Self {
            id,
            pacer: FramePacer::new(format!("{id}:{identity}"), limits),
            screen_name,
            identity,
            profile,
            connected_at: SystemTime::now(),
            transfers: TransferSlots::new(),
            outbound,
            next_stream: AtomicU16::new(1),
            closing: watch::channel(false).0,
        }
    }

    /// Queue chunks behind everything already pending.
    pub fn send(&self, chunks: Vec<OutgoingChunk>, label: &str) {
        self.pacer.enqueue(chunks, label);
    }

    /// One paced burst toward the socket writer. Download segments leaving
    /// the queue count as activity on their transfer.
    pub fn flush(&self) -> usize {
        let burst = self.pacer.limits().max_burst;
        let mut segment_of = None;
        let sent = self.pacer.drain_with(&self.outbound, burst, |chunk| {
            if chunk.token == token::DOWNLOAD_DATA || chunk.token == token::DOWNLOAD_END {
                segment_of = token::segment_xfer_id(&chunk.payload);
            }
        });
        if let Some(id) = segment_of {
            self.transfers.touch(Direction::Download, id);
        }
        sent
    }

    /// Immediate-send path: queue and push one burst now instead of waiting
    /// for the pump's next readiness signal.
    pub fn send_now(&self, chunks: Vec<OutgoingChunk>, label: &str) -> usize {
        self.pacer.enqueue(chunks, label);
        self.flush()
    }

    /// Send a control frame ahead of any queued data. Returns false if the
    /// frame could not be handed to the writer.
    pub fn send_control(&self, kind: FrameKind, payload: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.pacer.control_frame(kind, payload) {
            Ok(frame) => self.outbound.try_send(frame).is_ok(),
            Err(e) => {
                tracing::warn!(conn = self.id, ?kind, error = %e, "control frame rejected");
                false
            }
        }
    }

    pub fn outbound(&self) -> &mpsc::Sender<Bytes> {
        &self.outbound
    }

    /// Stream ids are per connection and skip 0.
    pub fn next_stream_id(&self) -> u16 {
        loop {
            let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Stop sending, cancel in-flight transfers and tell the session driving
    /// this connection to hang up.
    pub fn close(&self) {
        self.closing.send_replace(true);
        self.pacer.close();
        for state in self.transfers.cancel_all() {
            tracing::info!(
                conn = self.id,
                xfer_id = state.id,
                direction = %state.direction,
                "transfer cancelled on disconnect"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pacer.is_closed() || self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            screen_name: self.screen_name.clone(),
            profile: self.profile,
            connected_secs: self
                .connected_at
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0),
            pending_chunks: self.pacer.pending(),
        }
    }
}

/// Snapshot of a connection for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub screen_name: String,
    pub profile: ClientProfile,
    pub connected_secs: u64,
    pub pending_chunks: usize,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Live connections keyed by normalized screen name. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, replacing and closing any prior connection for the
    /// same screen name. Returns the evicted connection.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        match self.inner.entry(conn.identity.clone()) {
            Entry::Occupied(mut e) => {
                let old = e.insert(conn);
                old.close();
                tracing::info!(
                    screen_name = %old.screen_name,
                    evicted = old.id,
                    "duplicate sign-on replaced earlier connection"
                );
                Some(old)
            }
            Entry::Vacant(e) => {
                e.insert(conn);
                None
            }
        }
    }

    /// Remove the entry for `identity` only if it is still connection
    /// `conn_id`, so a late disconnect cannot remove its replacement.
    pub fn unregister(&self, identity: &str, conn_id: u64) -> bool {
        self.inner
            .remove_if(identity, |_, c| c.id == conn_id)
            .is_some()
    }

    pub fn get(&self, screen_name: &str) -> Option<Arc<Connection>> {
        self.inner
            .get(&normalize_screen_name(screen_name))
            .map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of who is online, sorted by screen name.
    pub fn online(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<_> = self.inner.iter().map(|c| c.value().info()).collect();
        out.sort_by(|a, b| a.screen_name.cmp(&b.screen_name));
        out
    }

    /// Normalized names of everyone online, sorted.
    pub fn online_identities(&self) -> Vec<String> {
        let mut out: Vec<_> = self.inner.iter().map(|c| c.key().clone()).collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64, name: &str) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let c = Connection::new(id, name, ClientProfile::default(), tx, PacerLimits::default());
        (Arc::new(c), rx)
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_screen_name("Steve Case"), "stevecase");
        assert_eq!(normalize_screen_name("  GUEST 1 "), "guest1");
        assert_eq!(normalize_screen_name("   "), "");
    }

    #[test]
    fn duplicate_sign_on_evicts_and_closes_prior() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = conn(1, "Steve Case");
        let (b, _rb) = conn(2, "stevecase");
        assert!(reg.register(a.clone()).is_none());
        let evicted = reg.register(b.clone()).unwrap();
        assert_eq!(evicted.id, 1);
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("STEVE CASE").unwrap().id, 2);
    }

    #[test]
    fn stale_unregister_keeps_replacement() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = conn(1, "guest");
        let (b, _rb) = conn(2, "guest");
        reg.register(a);
        reg.register(b);
        assert!(!reg.unregister("guest", 1));
        assert_eq!(reg.len(), 1);
        assert!(reg.unregister("guest", 2));
        assert!(reg.is_empty());
    }

    #[test]
    fn online_is_sorted() {
        let reg = ConnectionRegistry::new();
        let (c1, _r1) = conn(1, "zed");
        let (c2, _r2) = conn(2, "amy");
        reg.register(c1);
        reg.register(c2);
        let names: Vec<_> = reg.online().into_iter().map(|i| i.screen_name).collect();
        assert_eq!(names, ["amy", "zed"]);
        assert_eq!(reg.online_identities(), ["amy", "zed"]);
    }

    #[test]
    fn stream_ids_skip_zero() {
        let (c, _rx) = conn(1, "a");
        c.next_stream.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(c.next_stream_id(), u16::MAX);
        assert_eq!(c.next_stream_id(), 1);
    }

    #[tokio::test]
    async fn eviction_signals_the_old_session() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = conn(1, "guest");
        let (b, _rb) = conn(2, "guest");
        reg.register(a.clone());

        let waiter = tokio::spawn({
            let a = a.clone();
            async move { a.closed().await }
        });
        reg.register(b.clone());
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("evicted connection was not signalled")
            .unwrap();

        // a late waiter sees the close too
        a.closed().await;
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), b.closed())
            .await
            .is_err());
    }

    #[test]
    fn control_frames_bypass_the_queue() {
        let (c, mut rx) = conn(1, "a");
        c.send(vec![crate::chunker::single(*b"AT", 1, vec![1], "x")], "x");
        assert!(c.send_control(FrameKind::Ack, &[]));
        let frame = rx.try_recv().unwrap();
        let mut dec = dialtone_core::wire::FrameDecoder::new();
        dec.push(&frame);
        assert_eq!(dec.next_frame().unwrap().unwrap().kind, FrameKind::Ack);
        assert_eq!(c.pacer.pending(), 1);
    }
}
