//! Transfer engine — drives downloads and uploads through their states.
//!
//! Downloads: announce scene → client ack (tA) → F7 segments + F9 end →
//! client confirm (tC). Uploads: picker scene → picked (uP) → stat scene →
//! stats (uS) → authorize scene → data (uD)* → end (uE) → persisted.
//!
//! Expiry is lazy: every entry point first fails transfers that have been
//! idle past the inactivity timeout, so a stale slot never blocks a new
//! transfer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use dialtone_core::token::{self, ClientMessage};
use dialtone_core::wire::DATA_PREFIX_LEN;

use crate::chunk_types::OutgoingChunk;
use crate::chunker;
use crate::compiler::Compiler;
use crate::connection::Connection;
use crate::scene::{self, SceneContext, SceneRegistry};
use crate::script::CompileError;
use crate::storage::{self, FileStorage, StorageError, UPLOAD_SCOPE};

use super::state::{
    Active, Direction, FailureReason, Payload, TransferState, TransferStatus,
};

/// Bytes of xfer id in front of every F7 segment.
const SEGMENT_HEADER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub max_file_size: u64,
    pub inactivity_timeout: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_file_size: 2 * 1024 * 1024,
            inactivity_timeout: Duration::from_secs(30),
        }
    }
}

/// Both slots, the last finished transfer of each direction and the
/// retained failures for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub download: Option<TransferState>,
    pub upload: Option<TransferState>,
    pub last_download: Option<TransferState>,
    pub last_upload: Option<TransferState>,
    pub failed: Vec<TransferState>,
}

pub struct TransferEngine {
    limits: TransferLimits,
    storage: Arc<dyn FileStorage>,
    compiler: Arc<Compiler>,
    scenes: Arc<SceneRegistry>,
    next_id: AtomicU32,
}

impl TransferEngine {
    pub fn new(
        limits: TransferLimits,
        storage: Arc<dyn FileStorage>,
        compiler: Arc<Compiler>,
        scenes: Arc<SceneRegistry>,
    ) -> Self {
        Self {
            limits,
            storage,
            compiler,
            scenes,
            next_id: AtomicU32::new(1),
        }
    }

    pub fn limits(&self) -> TransferLimits {
        self.limits
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Start serving `data` to the client as `filename`.
    pub fn initiate_download(
        &self,
        conn: &Connection,
        filename: &str,
        data: Bytes,
    ) -> Result<TransferState, XferError> {
        self.sweep(conn);
        storage::check_name(filename)?;
        let size = data.len() as u64;
        let limit = self.limits.max_file_size.min(u32::MAX as u64);
        if size > limit {
            return Err(XferError::SizeLimitExceeded { limit, size });
        }

        let (state, chunks) = {
            let mut slot = conn.transfers.slot(Direction::Download);
            if let Some(active) = &slot.active {
                return Err(XferError::Conflict {
                    direction: Direction::Download,
                    id: active.state.id,
                });
            }
            let mut state =
                TransferState::new(self.allocate_id(), Direction::Download, filename.into(), size);
            let ctx = self
                .context(conn, state.id)
                .with("filename", filename)
                .with("size", size);
            let chunks = self.scene_chunks(conn, scene::XFER_DOWNLOAD_ANNOUNCE, &ctx)?;
            state.status = TransferStatus::AwaitingAck;
            slot.active = Some(Active {
                state: state.clone(),
                payload: Payload::Outgoing(data),
            });
            (state, chunks)
        };

        conn.send(chunks, scene::XFER_DOWNLOAD_ANNOUNCE);
        tracing::info!(
            conn = conn.id,
            screen_name = %conn.screen_name,
            xfer_id = state.id,
            filename,
            size,
            "download announced"
        );
        Ok(state)
    }

    /// Ask the client to pick a file to send.
    pub fn initiate_upload(&self, conn: &Connection) -> Result<TransferState, XferError> {
        self.sweep(conn);
        let (state, chunks) = {
            let mut slot = conn.transfers.slot(Direction::Upload);
            if let Some(active) = &slot.active {
                return Err(XferError::Conflict {
                    direction: Direction::Upload,
                    id: active.state.id,
                });
            }
            let mut state =
                TransferState::new(self.allocate_id(), Direction::Upload, String::new(), 0);
            let ctx = self.context(conn, state.id);
            let chunks = self.scene_chunks(conn, scene::XFER_UPLOAD_PICKER, &ctx)?;
            state.status = TransferStatus::AwaitingFilePick;
            slot.active = Some(Active {
                state: state.clone(),
                payload: Payload::Incoming(BytesMut::new()),
            });
            (state, chunks)
        };

        conn.send(chunks, scene::XFER_UPLOAD_PICKER);
        tracing::info!(
            conn = conn.id,
            screen_name = %conn.screen_name,
            xfer_id = state.id,
            "upload requested"
        );
        Ok(state)
    }

    /// Apply a client message. `Ok(None)` means the message is not about
    /// file transfer.
    pub fn handle(
        &self,
        conn: &Connection,
        msg: &ClientMessage,
    ) -> Result<Option<TransferState>, XferError> {
        let expired = self.sweep(conn);
        let timed_out = |id: u32| {
            if expired.iter().any(|s| s.id == id) {
                XferError::Timeout(id)
            } else {
                XferError::UnknownTransfer(id)
            }
        };

        let state = match msg {
            ClientMessage::DownloadAck { xfer_id } => self.download_ack(conn, *xfer_id),
            ClientMessage::DownloadConfirm { xfer_id } => self.download_confirm(conn, *xfer_id),
            ClientMessage::Cancel { xfer_id } => self.client_cancel(conn, *xfer_id),
            ClientMessage::UploadPicked { xfer_id, filename } => {
                self.upload_picked(conn, *xfer_id, filename)
            }
            ClientMessage::UploadStats { xfer_id, size } => {
                self.upload_stats(conn, *xfer_id, u64::from(*size))
            }
            ClientMessage::UploadData { xfer_id, data } => {
                self.upload_data(conn, *xfer_id, data)
            }
            ClientMessage::UploadEnd { xfer_id } => self.upload_end(conn, *xfer_id),
            ClientMessage::SignOn { .. } | ClientMessage::Other { .. } => return Ok(None),
        };
        match state {
            Err(XferError::UnknownTransfer(id)) => Err(timed_out(id)),
            other => other.map(Some),
        }
    }

    /// Cancel the transfer in `direction` from the server side.
    pub fn cancel(&self, conn: &Connection, direction: Direction) -> Option<TransferState> {
        self.sweep(conn);
        let state = conn
            .transfers
            .slot(direction)
            .finish(TransferStatus::Cancelled)?;
        self.abort(conn, state.id, "Cancelled by host");
        tracing::info!(conn = conn.id, xfer_id = state.id, %direction, "transfer cancelled");
        Some(state)
    }

    /// Fail every idle transfer and tell the client.
    pub fn sweep(&self, conn: &Connection) -> Vec<TransferState> {
        let expired = conn.transfers.expire(self.limits.inactivity_timeout);
        for state in &expired {
            tracing::warn!(
                conn = conn.id,
                xfer_id = state.id,
                direction = %state.direction,
                offset = state.offset,
                "transfer timed out"
            );
            self.abort(conn, state.id, "Transfer timed out");
        }
        expired
    }

    pub fn report(&self, conn: &Connection) -> TransferReport {
        self.sweep(conn);
        TransferReport {
            download: conn.transfers.active(Direction::Download),
            upload: conn.transfers.active(Direction::Upload),
            last_download: conn.transfers.last(Direction::Download),
            last_upload: conn.transfers.last(Direction::Upload),
            failed: conn.transfers.failed(),
        }
    }

    pub fn clear_failed(&self, conn: &Connection) -> usize {
        conn.transfers.clear_failed()
    }

    // ── Downloads ─────────────────────────────────────────────────────────────

    fn download_ack(&self, conn: &Connection, id: u32) -> Result<TransferState, XferError> {
        let (state, chunks) = {
            let mut slot = conn.transfers.slot(Direction::Download);
            let active = active_in(&mut slot.active, id, TransferStatus::AwaitingAck)?;
            let Payload::Outgoing(data) = &active.payload else {
                return Err(XferError::UnexpectedState {
                    id,
                    status: active.state.status,
                });
            };
            let chunks = self.segments(conn.next_stream_id(), id, data);
            active.state.status = TransferStatus::Streaming;
            active.state.offset = active.state.size;
            active.state.touch();
            (active.state.clone(), chunks)
        };

        tracing::debug!(conn = conn.id, xfer_id = id, frames = chunks.len(), "download streaming");
        conn.send(chunks, "xfer_download");
        Ok(state)
    }

    fn download_confirm(&self, conn: &Connection, id: u32) -> Result<TransferState, XferError> {
        let mut slot = conn.transfers.slot(Direction::Download);
        active_in(&mut slot.active, id, TransferStatus::Streaming)?;
        let state = slot
            .finish(TransferStatus::Completed)
            .ok_or(XferError::UnknownTransfer(id))?;
        tracing::info!(
            conn = conn.id,
            xfer_id = id,
            filename = %state.filename,
            size = state.size,
            "download completed"
        );
        Ok(state)
    }

    /// F7 segments sized to one frame each, then the F9 end marker.
    fn segments(&self, stream_id: u16, id: u32, data: &Bytes) -> Vec<OutgoingChunk> {
        let room = self
            .compiler
            .max_frame_payload()
            .saturating_sub(DATA_PREFIX_LEN + SEGMENT_HEADER)
            .max(1);
        let mut chunks: Vec<_> = data
            .chunks(room)
            .map(|piece| {
                chunker::single(
                    token::DOWNLOAD_DATA,
                    stream_id,
                    token::download_segment(id, piece),
                    "xfer_download",
                )
            })
            .collect();
        let total = data.len() as u32;
        chunks.push(chunker::single(
            token::DOWNLOAD_END,
            stream_id,
            token::download_end(id, total),
            "xfer_download",
        ));
        chunks
    }

    // ── Uploads ───────────────────────────────────────────────────────────────

    fn upload_picked(
        &self,
        conn: &Connection,
        id: u32,
        picked: &str,
    ) -> Result<TransferState, XferError> {
        let filename = base_name(picked);
        let mut slot = conn.transfers.slot(Direction::Upload);
        let active = active_in(&mut slot.active, id, TransferStatus::AwaitingFilePick)?;

        // An empty pick means the client dismissed the picker.
        if filename.is_empty() {
            let state = slot
                .finish(TransferStatus::Cancelled)
                .ok_or(XferError::UnknownTransfer(id))?;
            tracing::info!(conn = conn.id, xfer_id = id, "upload picker dismissed");
            return Ok(state);
        }
        if let Err(e) = storage::check_name(filename) {
            drop(slot);
            return Err(self.fail_upload(
                conn,
                id,
                FailureReason::Storage {
                    message: e.to_string(),
                },
                XferError::Storage(e),
            ));
        }

        active.state.filename = filename.to_string();
        active.state.status = TransferStatus::AwaitingStats;
        active.state.touch();
        let state = active.state.clone();
        drop(slot);

        let chunks = self.scene_chunks(conn, scene::XFER_UPLOAD_STAT, &self.context(conn, id))?;
        conn.send(chunks, scene::XFER_UPLOAD_STAT);
        tracing::debug!(conn = conn.id, xfer_id = id, filename, "upload file picked");
        Ok(state)
    }

    fn upload_stats(&self, conn: &Connection, id: u32, size: u64) -> Result<TransferState, XferError> {
        let mut slot = conn.transfers.slot(Direction::Upload);
        let active = active_in(&mut slot.active, id, TransferStatus::AwaitingStats)?;

        let limit = self.limits.max_file_size;
        if size > limit {
            drop(slot);
            return Err(self.fail_upload(
                conn,
                id,
                FailureReason::SizeLimitExceeded { limit, size },
                XferError::SizeLimitExceeded { limit, size },
            ));
        }

        active.state.size = size;
        active.state.status = TransferStatus::Streaming;
        active.state.touch();
        if let Payload::Incoming(buf) = &mut active.payload {
            buf.reserve(size as usize);
        }
        let state = active.state.clone();
        drop(slot);

        let chunks =
            self.scene_chunks(conn, scene::XFER_UPLOAD_AUTHORIZE, &self.context(conn, id))?;
        conn.send(chunks, scene::XFER_UPLOAD_AUTHORIZE);
        tracing::debug!(conn = conn.id, xfer_id = id, size, "upload authorized");
        Ok(state)
    }

    fn upload_data(&self, conn: &Connection, id: u32, data: &Bytes) -> Result<TransferState, XferError> {
        let mut slot = conn.transfers.slot(Direction::Upload);
        let active = active_in(&mut slot.active, id, TransferStatus::Streaming)?;

        let received = active.state.offset + data.len() as u64;
        if received > active.state.size {
            let limit = active.state.size;
            drop(slot);
            return Err(self.fail_upload(
                conn,
                id,
                FailureReason::SizeLimitExceeded {
                    limit,
                    size: received,
                },
                XferError::SizeLimitExceeded {
                    limit,
                    size: received,
                },
            ));
        }

        if let Payload::Incoming(buf) = &mut active.payload {
            buf.extend_from_slice(data);
        }
        active.state.offset = received;
        active.state.touch();
        Ok(active.state.clone())
    }

    fn upload_end(&self, conn: &Connection, id: u32) -> Result<TransferState, XferError> {
        let mut slot = conn.transfers.slot(Direction::Upload);
        let active = active_in(&mut slot.active, id, TransferStatus::Streaming)?;

        let (expected, received) = (active.state.size, active.state.offset);
        if received != expected {
            drop(slot);
            return Err(self.fail_upload(
                conn,
                id,
                FailureReason::ShortUpload { expected, received },
                XferError::ShortUpload { expected, received },
            ));
        }

        let filename = active.state.filename.clone();
        let written = match &active.payload {
            Payload::Incoming(buf) => {
                self.storage
                    .write(UPLOAD_SCOPE, &conn.identity, &filename, buf)
            }
            Payload::Outgoing(_) => Err(StorageError::NotFound(filename.clone())),
        };
        if let Err(e) = written {
            drop(slot);
            return Err(self.fail_upload(
                conn,
                id,
                FailureReason::Storage {
                    message: e.to_string(),
                },
                XferError::Storage(e),
            ));
        }

        let state = slot
            .finish(TransferStatus::Completed)
            .ok_or(XferError::UnknownTransfer(id))?;
        tracing::info!(
            conn = conn.id,
            screen_name = %conn.screen_name,
            xfer_id = id,
            filename = %state.filename,
            size = state.size,
            "upload stored"
        );
        Ok(state)
    }

    /// Mark the upload failed, tell the client, and hand back `err`.
    fn fail_upload(
        &self,
        conn: &Connection,
        id: u32,
        reason: FailureReason,
        err: XferError,
    ) -> XferError {
        let failed = conn.transfers.slot(Direction::Upload).fail(reason);
        if let Some(state) = failed {
            tracing::warn!(conn = conn.id, xfer_id = id, error = %err, "upload failed");
            let text = state
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.abort(conn, id, &format!("Upload failed: {text}"));
        }
        err
    }

    // ── Shared ────────────────────────────────────────────────────────────────

    fn client_cancel(&self, conn: &Connection, id: u32) -> Result<TransferState, XferError> {
        for direction in [Direction::Download, Direction::Upload] {
            let mut slot = conn.transfers.slot(direction);
            if slot.active.as_ref().is_some_and(|a| a.state.id == id) {
                let state = slot
                    .finish(TransferStatus::Cancelled)
                    .ok_or(XferError::UnknownTransfer(id))?;
                tracing::info!(conn = conn.id, xfer_id = id, %direction, "client cancelled transfer");
                return Ok(state);
            }
        }
        Err(XferError::UnknownTransfer(id))
    }

    fn context(&self, conn: &Connection, id: u32) -> SceneContext {
        SceneContext::new(conn.screen_name.clone(), conn.profile).with("xfer_id", id)
    }

    fn scene_chunks(
        &self,
        conn: &Connection,
        scene_id: &str,
        ctx: &SceneContext,
    ) -> Result<Vec<OutgoingChunk>, CompileError> {
        let script = self.scenes.render(self.compiler.table(), scene_id, ctx)?;
        self.compiler.compile(&script, conn.next_stream_id(), scene_id)
    }

    /// Best-effort abort notice. A failure to build it is logged only.
    fn abort(&self, conn: &Connection, id: u32, reason: &str) {
        let ctx = self.context(conn, id).with("reason", reason);
        match self.scene_chunks(conn, scene::XFER_ABORT, &ctx) {
            Ok(chunks) => conn.send(chunks, scene::XFER_ABORT),
            Err(e) => tracing::warn!(conn = conn.id, xfer_id = id, error = %e, "abort scene failed"),
        }
    }
}

/// The active transfer, if it is `id` and in `status`.
fn active_in(
    active: &mut Option<Active>,
    id: u32,
    status: TransferStatus,
) -> Result<&mut Active, XferError> {
    match active {
        Some(a) if a.state.id == id => {
            if a.state.status == status {
                Ok(a)
            } else {
                Err(XferError::UnexpectedState {
                    id,
                    status: a.state.status,
                })
            }
        }
        _ => Err(XferError::UnknownTransfer(id)),
    }
}

/// Strip any client-side directory from a picked path.
fn base_name(picked: &str) -> &str {
    picked
        .rsplit(['/', '\\', ':'])
        .next()
        .unwrap_or(picked)
        .trim()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum XferError {
    #[error("a {direction} transfer ({id}) is already in progress")]
    Conflict { direction: Direction, id: u32 },
    #[error("transfer {0} timed out")]
    Timeout(u32),
    #[error("{size} bytes exceeds the {limit} byte limit")]
    SizeLimitExceeded { limit: u64, size: u64 },
    #[error("upload ended after {received} of {expected} bytes")]
    ShortUpload { expected: u64, received: u64 },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("no active transfer {0}")]
    UnknownTransfer(u32),
    #[error("transfer {id} is {status:?}")]
    UnexpectedState { id: u32, status: TransferStatus },
    #[error("scene: {0}")]
    Scene(#[from] CompileError),
}
