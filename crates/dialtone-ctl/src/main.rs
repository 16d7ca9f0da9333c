//! dialtone-ctl — command-line interface for the Dialtone daemon.

use anyhow::{Context, Result};

mod cmd;

use cmd::{fdo, status, xfer};

const DEFAULT_PORT: u16 = 5191;

fn print_usage() {
    println!("Usage: dialtone-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                               Show daemon status and limits");
    println!("  online                               List signed-on screen names");
    println!("  scenes                               List registered scenes");
    println!("  compile <file.fdo> [--hex]           Compile FDO source and show the result");
    println!("  send <name> <file.fdo> [--now]       Compile and send FDO source to a client");
    println!("  scene <name> <scene> [k=v ...] [--now]");
    println!("                                       Send a registered scene to a client");
    println!("  download <name> <path>               Offer a local file to a client");
    println!("  download <name> --library <file>     Offer a library file to a client");
    println!("  upload <name>                        Ask a client to send a file");
    println!("  xfer <name>                          Show a client's transfers");
    println!("  cancel <name> [download|upload]      Cancel a client's transfers");
    println!("  clear-failed <name>                  Drop a client's failed-transfer history");
    println!("  shutdown                             Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   Admin API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse global options
    let mut port = DEFAULT_PORT;
    let mut now = false;
    let mut show_hex = false;
    let mut library = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--now" => now = true,
            "--hex" => show_hex = true,
            "--library" => library = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["online"] => status::cmd_online(port).await,
        ["scenes"] => status::cmd_scenes(port).await,
        ["shutdown"] => status::cmd_shutdown(port).await,
        ["compile", path] => fdo::cmd_compile(port, path, show_hex).await,
        ["send", name, path] => fdo::cmd_send_source(port, name, path, now).await,
        ["scene", name, scene, params @ ..] => {
            fdo::cmd_send_scene(port, name, scene, params, now).await
        }
        ["download", name, path] => xfer::cmd_download(port, name, path, library).await,
        ["upload", name] => xfer::cmd_upload(port, name).await,
        ["xfer", name] => xfer::cmd_report(port, name).await,
        ["cancel", name] => xfer::cmd_cancel(port, name, None).await,
        ["cancel", name, dir @ ("download" | "upload")] => {
            xfer::cmd_cancel(port, name, Some(*dir)).await
        }
        ["clear-failed", name] => xfer::cmd_clear_failed(port, name).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
