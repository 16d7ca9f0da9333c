//! File transfer commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::http::{base_url, delete_json, get_json, post_json_body};

#[derive(Deserialize)]
struct TransferState {
    id: u32,
    direction: String,
    filename: String,
    size: u64,
    offset: u64,
    status: String,
    failure: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct TransferReport {
    download: Option<TransferState>,
    upload: Option<TransferState>,
    #[serde(default)]
    last_download: Option<TransferState>,
    #[serde(default)]
    last_upload: Option<TransferState>,
    failed: Vec<TransferState>,
}

#[derive(Deserialize)]
struct CancelResponse {
    cancelled: Vec<TransferState>,
}

#[derive(Deserialize)]
struct ClearFailedResponse {
    cleared: usize,
}

#[derive(Serialize)]
struct DownloadRequest<'a> {
    screen_name: &'a str,
    filename: &'a str,
    data_hex: Option<String>,
}

fn print_state(s: &TransferState) {
    let name = if s.filename.is_empty() { "-" } else { s.filename.as_str() };
    println!("  ┌─ #{} {} {}", s.id, s.direction, name);
    println!("  │  status : {}", s.status);
    if let Some(f) = &s.failure {
        println!("  │  reason : {}", f);
    }
    println!("  └─ bytes  : {}/{}", s.offset, s.size);
}

/// Push a local file, or a library file when `from_library` is set.
pub async fn cmd_download(port: u16, screen_name: &str, path: &str, from_library: bool) -> Result<()> {
    let (filename, data_hex) = if from_library {
        (path.to_string(), None)
    } else {
        let data = std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        (filename, Some(hex::encode(data)))
    };

    let req = DownloadRequest {
        screen_name,
        filename: &filename,
        data_hex,
    };
    let resp: TransferState =
        post_json_body(&format!("{}/xfer/download", base_url(port)), &req).await?;
    println!("Download offered to {}:", screen_name);
    print_state(&resp);
    Ok(())
}

pub async fn cmd_upload(port: u16, screen_name: &str) -> Result<()> {
    let resp: TransferState = post_json_body(
        &format!("{}/xfer/upload", base_url(port)),
        &json!({ "screen_name": screen_name }),
    )
    .await?;
    println!("Upload requested from {}:", screen_name);
    print_state(&resp);
    Ok(())
}

pub async fn cmd_report(port: u16, screen_name: &str) -> Result<()> {
    let resp: TransferReport =
        get_json(&format!("{}/xfer/{}", base_url(port), screen_name)).await?;

    println!("═══════════════════════════════════════");
    println!("  Transfers for {}", screen_name);
    println!("═══════════════════════════════════════");
    match (&resp.download, &resp.upload) {
        (None, None) => println!("  No active transfers."),
        (d, u) => {
            d.iter().chain(u.iter()).for_each(print_state);
        }
    }
    if resp.last_download.is_some() || resp.last_upload.is_some() {
        println!("\n  Last finished:");
        resp.last_download
            .iter()
            .chain(resp.last_upload.iter())
            .for_each(print_state);
    }
    if !resp.failed.is_empty() {
        println!("\n  Failed ({}):", resp.failed.len());
        resp.failed.iter().for_each(print_state);
    }
    Ok(())
}

pub async fn cmd_cancel(port: u16, screen_name: &str, direction: Option<&str>) -> Result<()> {
    let resp: CancelResponse = post_json_body(
        &format!("{}/xfer/{}/cancel", base_url(port), screen_name),
        &json!({ "direction": direction }),
    )
    .await?;
    if resp.cancelled.is_empty() {
        println!("Nothing to cancel.");
    }
    for s in &resp.cancelled {
        println!("Cancelled {} #{}", s.direction, s.id);
    }
    Ok(())
}

pub async fn cmd_clear_failed(port: u16, screen_name: &str) -> Result<()> {
    let resp: ClearFailedResponse =
        delete_json(&format!("{}/xfer/{}/failed", base_url(port), screen_name)).await?;
    println!("Cleared {} failed transfers.", resp.cleared);
    Ok(())
}
