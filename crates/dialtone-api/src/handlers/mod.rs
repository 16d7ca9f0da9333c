//! HTTP API handlers — exposes server state and admin actions as JSON.

pub mod fdo;
pub mod status;
pub mod xfer;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;

use dialtone_services::{CompileError, Connection, ServerContext, StorageError, XferError};

#[derive(Clone)]
pub struct ApiState {
    pub server: ServerContext,
    /// Address the client listener is bound to.
    pub listen_addr: String,
    pub started_at: Instant,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// The live connection for `screen_name`.
fn online(state: &ApiState, screen_name: &str) -> Result<Arc<Connection>, (StatusCode, String)> {
    state.server.registry.get(screen_name).ok_or((
        StatusCode::NOT_FOUND,
        format!("{screen_name} is not online"),
    ))
}

fn compile_error(e: CompileError) -> (StatusCode, String) {
    let status = match e {
        CompileError::UnknownScene(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

fn xfer_error(e: XferError) -> (StatusCode, String) {
    let status = match &e {
        XferError::Conflict { .. } => StatusCode::CONFLICT,
        XferError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        XferError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
        XferError::Storage(StorageError::InvalidName(_)) => StatusCode::BAD_REQUEST,
        XferError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        XferError::Scene(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use fdo::{handle_compile, handle_send};
pub use status::{handle_online, handle_scenes, handle_shutdown, handle_status};
pub use xfer::{
    handle_download, handle_upload, handle_xfer_cancel, handle_xfer_clear_failed,
    handle_xfer_report,
};
