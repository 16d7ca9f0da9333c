//! /status, /online, /scenes, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use dialtone_services::{ConnectionInfo, SceneInfo};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub listen_addr: String,
    pub uptime_secs: u64,
    pub online: usize,
    pub limits: LimitsInfo,
}

#[derive(Serialize)]
pub struct LimitsInfo {
    pub max_burst: usize,
    pub max_frame_payload: usize,
    pub outbound_window: usize,
    pub max_file_size: u64,
    pub inactivity_timeout_secs: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let server = &state.server;
    let xfer = server.engine.limits();
    Json(StatusResponse {
        listen_addr: state.listen_addr.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online: server.registry.len(),
        limits: LimitsInfo {
            max_burst: server.pacer_limits.max_burst,
            max_frame_payload: server.pacer_limits.max_frame_payload,
            outbound_window: server.outbound_window,
            max_file_size: xfer.max_file_size,
            inactivity_timeout_secs: xfer.inactivity_timeout.as_secs(),
        },
    })
}

// ── /online ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct OnlineResponse {
    pub connections: Vec<ConnectionInfo>,
}

pub async fn handle_online(State(state): State<ApiState>) -> Json<OnlineResponse> {
    Json(OnlineResponse {
        connections: state.server.registry.online(),
    })
}

// ── /scenes ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ScenesResponse {
    pub scenes: Vec<SceneInfo>,
}

pub async fn handle_scenes(State(state): State<ApiState>) -> Json<ScenesResponse> {
    Json(ScenesResponse {
        scenes: state.server.scenes.list(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub shutting_down: bool,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        shutting_down: true,
    })
}
