//! Daemon status, online list, scenes, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    listen_addr: String,
    uptime_secs: u64,
    online: usize,
    limits: LimitsInfo,
}

#[derive(Deserialize)]
struct LimitsInfo {
    max_burst: usize,
    max_frame_payload: usize,
    outbound_window: usize,
    max_file_size: u64,
    inactivity_timeout_secs: u64,
}

#[derive(Deserialize)]
struct OnlineResponse {
    connections: Vec<ConnectionInfo>,
}

#[derive(Deserialize)]
struct ConnectionInfo {
    id: u64,
    screen_name: String,
    profile: Profile,
    connected_secs: u64,
    pending_chunks: usize,
}

#[derive(Deserialize)]
struct Profile {
    platform: String,
    version: u16,
}

#[derive(Deserialize)]
struct ScenesResponse {
    scenes: Vec<SceneInfo>,
}

#[derive(Deserialize)]
struct SceneInfo {
    id: String,
    params: Vec<String>,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    shutting_down: bool,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Dialtone Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Listening        : {}", resp.listen_addr);
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Online           : {}", resp.online);
    println!("  Max burst        : {} frames", resp.limits.max_burst);
    println!("  Max frame        : {} bytes", resp.limits.max_frame_payload);
    println!("  Outbound window  : {} frames", resp.limits.outbound_window);
    println!(
        "  Max file size    : {} ({:.1} KB)",
        resp.limits.max_file_size,
        resp.limits.max_file_size as f64 / 1024.0
    );
    println!("  Transfer timeout : {}s", resp.limits.inactivity_timeout_secs);

    Ok(())
}

pub async fn cmd_online(port: u16) -> Result<()> {
    let resp: OnlineResponse = get_json(&format!("{}/online", base_url(port))).await?;

    if resp.connections.is_empty() {
        println!("Nobody is online.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Online ({})", resp.connections.len());
    println!("═══════════════════════════════════════");

    for c in &resp.connections {
        println!("  ┌─ {}", c.screen_name);
        println!("  │  connection : {}", c.id);
        println!("  │  client     : {} v{}", c.profile.platform, c.profile.version);
        println!("  │  queued     : {} chunks", c.pending_chunks);
        println!("  └─ online     : {}s", c.connected_secs);
    }

    Ok(())
}

pub async fn cmd_scenes(port: u16) -> Result<()> {
    let resp: ScenesResponse = get_json(&format!("{}/scenes", base_url(port))).await?;

    for s in &resp.scenes {
        if s.params.is_empty() {
            println!("  {}", s.id);
        } else {
            println!("  {} ({})", s.id, s.params.join(", "));
        }
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    if resp.shutting_down {
        println!("Daemon is shutting down.");
    }
    Ok(())
}
