//! FDO compile and send commands.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, post_json_body};

#[derive(Serialize)]
struct CompileRequest<'a> {
    source: &'a str,
}

#[derive(Deserialize)]
struct CompileResponse {
    atoms: usize,
    bytes: usize,
    listing: String,
    chunks: Vec<ChunkJson>,
}

#[derive(Deserialize)]
struct ChunkJson {
    len: usize,
    hex: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    screen_name: &'a str,
    source: Option<String>,
    scene: Option<&'a str>,
    params: HashMap<String, String>,
    immediate: bool,
}

#[derive(Deserialize)]
struct SendResponse {
    screen_name: String,
    stream_id: u16,
    chunks: usize,
    sent_now: usize,
}

fn read_source(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read FDO source: {}", path))
}

pub async fn cmd_compile(port: u16, path: &str, show_hex: bool) -> Result<()> {
    let source = read_source(path)?;
    let resp: CompileResponse = post_json_body(
        &format!("{}/fdo/compile", base_url(port)),
        &CompileRequest { source: &source },
    )
    .await?;

    print!("{}", resp.listing);
    println!();
    println!("  Atoms  : {}", resp.atoms);
    println!("  Bytes  : {}", resp.bytes);
    println!("  Chunks : {}", resp.chunks.len());
    if show_hex {
        for (i, c) in resp.chunks.iter().enumerate() {
            println!("  [{:>3}] {:>3}B {}", i, c.len, c.hex);
        }
    }

    Ok(())
}

pub async fn cmd_send_source(port: u16, screen_name: &str, path: &str, immediate: bool) -> Result<()> {
    let req = SendRequest {
        screen_name,
        source: Some(read_source(path)?),
        scene: None,
        params: HashMap::new(),
        immediate,
    };
    send(port, &req).await
}

/// `params` are `key=value` pairs.
pub async fn cmd_send_scene(
    port: u16,
    screen_name: &str,
    scene: &str,
    params: &[&str],
    immediate: bool,
) -> Result<()> {
    let params = params
        .iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("scene parameter must be key=value: {}", p))
        })
        .collect::<Result<HashMap<_, _>>>()?;
    let req = SendRequest {
        screen_name,
        source: None,
        scene: Some(scene),
        params,
        immediate,
    };
    send(port, &req).await
}

async fn send(port: u16, req: &SendRequest<'_>) -> Result<()> {
    let resp: SendResponse = post_json_body(&format!("{}/fdo/send", base_url(port)), req).await?;
    println!("Queued for {}:", resp.screen_name);
    println!("  Stream   : {}", resp.stream_id);
    println!("  Chunks   : {}", resp.chunks);
    if resp.sent_now > 0 {
        println!("  Sent now : {}", resp.sent_now);
    }
    Ok(())
}
