//! /xfer handlers — start, inspect and cancel file transfers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dialtone_services::storage::{LIBRARY_SCOPE, PUBLIC_OWNER};
use dialtone_services::{Direction, TransferReport, TransferState};

use super::{online, xfer_error, ApiState};

// ── /xfer/download (POST) ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub screen_name: String,
    pub filename: String,
    /// File contents. When absent the file is read from the public library.
    pub data_hex: Option<String>,
}

pub async fn handle_download(
    State(state): State<ApiState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<TransferState>, (StatusCode, String)> {
    let conn = online(&state, &req.screen_name)?;
    let engine = &state.server.engine;

    let data = match &req.data_hex {
        Some(h) => Bytes::from(
            hex::decode(h).map_err(|_| (StatusCode::BAD_REQUEST, "invalid hex".to_string()))?,
        ),
        None => engine
            .storage()
            .read(LIBRARY_SCOPE, PUBLIC_OWNER, &req.filename)
            .map_err(|e| xfer_error(e.into()))?,
    };

    let xfer = engine
        .initiate_download(&conn, &req.filename, data)
        .map_err(xfer_error)?;
    Ok(Json(xfer))
}

// ── /xfer/upload (POST) ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UploadRequest {
    pub screen_name: String,
}

pub async fn handle_upload(
    State(state): State<ApiState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<TransferState>, (StatusCode, String)> {
    let conn = online(&state, &req.screen_name)?;
    let xfer = state
        .server
        .engine
        .initiate_upload(&conn)
        .map_err(xfer_error)?;
    Ok(Json(xfer))
}

// ── /xfer/{screen_name} (GET) ─────────────────────────────────────────────────

pub async fn handle_xfer_report(
    State(state): State<ApiState>,
    Path(screen_name): Path<String>,
) -> Result<Json<TransferReport>, (StatusCode, String)> {
    let conn = online(&state, &screen_name)?;
    Ok(Json(state.server.engine.report(&conn)))
}

// ── /xfer/{screen_name}/cancel (POST) ─────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    /// Both directions when absent.
    pub direction: Option<Direction>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: Vec<TransferState>,
}

pub async fn handle_xfer_cancel(
    State(state): State<ApiState>,
    Path(screen_name): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let conn = online(&state, &screen_name)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let directions = match req.direction {
        Some(d) => vec![d],
        None => vec![Direction::Download, Direction::Upload],
    };
    let cancelled = directions
        .into_iter()
        .filter_map(|d| state.server.engine.cancel(&conn, d))
        .collect();
    Ok(Json(CancelResponse { cancelled }))
}

// ── /xfer/{screen_name}/failed (DELETE) ───────────────────────────────────────

#[derive(Serialize)]
pub struct ClearFailedResponse {
    pub cleared: usize,
}

pub async fn handle_xfer_clear_failed(
    State(state): State<ApiState>,
    Path(screen_name): Path<String>,
) -> Result<Json<ClearFailedResponse>, (StatusCode, String)> {
    let conn = online(&state, &screen_name)?;
    Ok(Json(ClearFailedResponse {
        cleared: state.server.engine.clear_failed(&conn),
    }))
}
