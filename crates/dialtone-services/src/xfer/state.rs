//! Transfer state and the per-connection slot registry.
//!
//! Each connection owns one download slot and one upload slot. A slot holds
//! at most one non-terminal transfer. Terminal transfers leave the slot
//! immediately. The most recent terminal state of each direction stays
//! readable, so a client-side cancel or a completion can be told apart after
//! the fact; failed ones are also kept in a short diagnostics list until
//! cleared.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Failed transfers kept per direction.
const FAILED_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Initiated,
    AwaitingAck,
    AwaitingFilePick,
    AwaitingStats,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    SizeLimitExceeded { limit: u64, size: u64 },
    ShortUpload { expected: u64, received: u64 },
    Storage { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timed out"),
            FailureReason::SizeLimitExceeded { limit, size } => {
                write!(f, "{size} bytes exceeds the {limit} byte limit")
            }
            FailureReason::ShortUpload { expected, received } => {
                write!(f, "received {received} of {expected} bytes")
            }
            FailureReason::Storage { message } => write!(f, "storage: {message}"),
        }
    }
}

/// Observable state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferState {
    pub id: u32,
    pub direction: Direction,
    pub filename: String,
    /// Declared size in bytes (0 until known for uploads).
    pub size: u64,
    /// Bytes handed to the transport (download) or received (upload).
    pub offset: u64,
    pub status: TransferStatus,
    pub failure: Option<FailureReason>,
    #[serde(skip)]
    pub last_activity: Instant,
}

impl TransferState {
    pub fn new(id: u32, direction: Direction, filename: String, size: u64) -> Self {
        Self {
            id,
            direction,
            filename,
            size,
            offset: 0,
            status: TransferStatus::Initiated,
            failure: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ── Slots ─────────────────────────────────────────────────────────────────────

/// The bytes that go with an active transfer.
#[derive(Debug)]
pub(crate) enum Payload {
    /// File being served.
    Outgoing(Bytes),
    /// Upload being reassembled.
    Incoming(BytesMut),
}

#[derive(Debug)]
pub(crate) struct Active {
    pub state: TransferState,
    pub payload: Payload,
}

#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub active: Option<Active>,
    /// Latest transfer to reach a terminal status.
    last: Option<TransferState>,
    failed: VecDeque<TransferState>,
}

impl Slot {
    /// Fail the active transfer if it has been idle for `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<TransferState> {
        let idle = self
            .active
            .as_ref()
            .is_some_and(|a| now.duration_since(a.state.last_activity) >= timeout);
        if idle {
            self.fail(FailureReason::Timeout)
        } else {
            None
        }
    }

    /// Move the active transfer to Failed and into the diagnostics list.
    pub fn fail(&mut self, reason: FailureReason) -> Option<TransferState> {
        let mut active = self.active.take()?;
        active.state.status = TransferStatus::Failed;
        active.state.failure = Some(reason);
        if self.failed.len() == FAILED_HISTORY {
            self.failed.pop_front();
        }
        self.failed.push_back(active.state.clone());
        self.last = Some(active.state.clone());
        Some(active.state)
    }

    /// Move the active transfer to a terminal, non-failed status.
    pub fn finish(&mut self, status: TransferStatus) -> Option<TransferState> {
        let mut active = self.active.take()?;
        active.state.status = status;
        self.last = Some(active.state.clone());
        Some(active.state)
    }
}

/// One connection's download and upload slots.
#[derive(Debug, Default)]
pub struct TransferSlots {
    download: Mutex<Slot>,
    upload: Mutex<Slot>,
}

impl TransferSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot(&self, direction: Direction) -> MutexGuard<'_, Slot> {
        let m = match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        };
        m.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The non-terminal transfer in `direction`, if any.
    pub fn active(&self, direction: Direction) -> Option<TransferState> {
        self.slot(direction).active.as_ref().map(|a| a.state.clone())
    }

    /// Mark transfer `id` as active now if it is streaming in `direction`.
    /// Returns false if some other transfer (or none) holds the slot.
    pub fn touch(&self, direction: Direction, id: u32) -> bool {
        match &mut self.slot(direction).active {
            Some(a) if a.state.id == id && a.state.status == TransferStatus::Streaming => {
                a.state.touch();
                true
            }
            _ => false,
        }
    }

    /// The most recent terminal transfer in `direction`.
    pub fn last(&self, direction: Direction) -> Option<TransferState> {
        self.slot(direction).last.clone()
    }

    /// Retained failures, downloads first, oldest first.
    pub fn failed(&self) -> Vec<TransferState> {
        let mut out: Vec<_> = self.slot(Direction::Download).failed.iter().cloned().collect();
        out.extend(self.slot(Direction::Upload).failed.iter().cloned());
        out
    }

    /// Drop retained failures. Returns how many were cleared.
    pub fn clear_failed(&self) -> usize {
        let mut n = 0;
        for direction in [Direction::Download, Direction::Upload] {
            let mut slot = self.slot(direction);
            n += slot.failed.len();
            slot.failed.clear();
        }
        n
    }

    /// Cancel everything in flight (connection going away).
    pub fn cancel_all(&self) -> Vec<TransferState> {
        [Direction::Download, Direction::Upload]
            .into_iter()
            .filter_map(|d| self.slot(d).finish(TransferStatus::Cancelled))
            .collect()
    }

    /// Fail every transfer idle for at least `timeout`.
    pub fn expire(&self, timeout: Duration) -> Vec<TransferState> {
        let now = Instant::now();
        [Direction::Download, Direction::Upload]
            .into_iter()
            .filter_map(|d| self.slot(d).expire(now, timeout))
            .collect()
    }
}
