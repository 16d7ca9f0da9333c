//! /fdo handlers — compile FDO source and push scenes to a client.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use dialtone_services::compiler;
use dialtone_services::{OutgoingChunk, SceneContext};

use super::{compile_error, online, ApiState};

// ── /fdo/compile (POST) ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CompileRequest {
    pub source: String,
    #[serde(default = "default_stream_id")]
    pub stream_id: u16,
}

fn default_stream_id() -> u16 {
    1
}

#[derive(Serialize)]
pub struct CompileResponse {
    pub atoms: usize,
    pub bytes: usize,
    /// Depth-indented listing of the flattened atom stream.
    pub listing: String,
    pub hex: String,
    pub chunks: Vec<ChunkJson>,
}

#[derive(Serialize)]
pub struct ChunkJson {
    pub seq: u32,
    pub last: bool,
    pub len: usize,
    pub hex: String,
}

impl From<&OutgoingChunk> for ChunkJson {
    fn from(c: &OutgoingChunk) -> Self {
        Self {
            seq: c.seq,
            last: c.last,
            len: c.frame_payload_len(),
            hex: hex::encode(&c.payload),
        }
    }
}

pub async fn handle_compile(
    State(state): State<ApiState>,
    Json(req): Json<CompileRequest>,
) -> Result<Json<CompileResponse>, (StatusCode, String)> {
    let compiler = &state.server.compiler;
    let script = compiler.parse(&req.source).map_err(compile_error)?;
    let atoms = compiler.flatten(&script).map_err(compile_error)?;
    let encoded = compiler.encode(&script).map_err(compile_error)?;
    let chunks = compiler
        .compile(&script, req.stream_id, "api_compile")
        .map_err(compile_error)?;

    Ok(Json(CompileResponse {
        atoms: atoms.len(),
        bytes: encoded.bytes.len(),
        listing: compiler::render(&atoms),
        hex: hex::encode(&encoded.bytes),
        chunks: chunks.iter().map(ChunkJson::from).collect(),
    }))
}

// ── /fdo/send (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendRequest {
    pub screen_name: String,
    /// FDO source to compile. Exclusive with `scene`.
    pub source: Option<String>,
    /// Registered scene id. Exclusive with `source`.
    pub scene: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Push the first burst now instead of waiting for the writer.
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub screen_name: String,
    pub stream_id: u16,
    pub chunks: usize,
    /// Chunks handed to the socket writer by an immediate send.
    pub sent_now: usize,
}

pub async fn handle_send(
    State(state): State<ApiState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, (StatusCode, String)> {
    let conn = online(&state, &req.screen_name)?;
    let server = &state.server;

    let (script, label) = match (&req.source, &req.scene) {
        (Some(source), None) => (server.compiler.parse(source), "api_source".to_string()),
        (None, Some(scene)) => {
            let mut ctx = SceneContext::new(conn.screen_name.clone(), conn.profile);
            ctx.params = req.params.clone();
            (
                server.scenes.render(server.compiler.table(), scene, &ctx),
                scene.clone(),
            )
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "exactly one of source or scene is required".to_string(),
            ))
        }
    };
    let script = script.map_err(compile_error)?;
    let stream_id = conn.next_stream_id();
    let chunks = server
        .compiler
        .compile(&script, stream_id, &label)
        .map_err(compile_error)?;
    let count = chunks.len();

    let sent_now = if req.immediate {
        conn.send_now(chunks, &label)
    } else {
        conn.send(chunks, &label);
        0
    };
    tracing::info!(
        screen_name = %conn.screen_name,
        label,
        chunks = count,
        sent_now,
        "FDO sent via API"
    );

    Ok(Json(SendResponse {
        screen_name: conn.screen_name.clone(),
        stream_id,
        chunks: count,
        sent_now,
    }))
}
