//! dialtoned — Dialtone dial-up backend daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use dialtone_core::config::DialtoneConfig;
use dialtone_services::{LocalFileStorage, ServerContext};

mod listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DialtoneConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DialtoneConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DialtoneConfig::default()
    });

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.network.listen_addr.clone());
    tracing::info!(listen_addr, "dialtoned starting");

    let storage_path = config.transfer.storage_path.clone();
    std::fs::create_dir_all(&storage_path)
        .with_context(|| format!("creating storage dir {}", storage_path.display()))?;
    let storage = Arc::new(LocalFileStorage::new(storage_path.clone()));
    let server = ServerContext::from_config(&config, storage);

    tracing::info!(
        max_burst = config.transport.max_burst,
        max_frame_payload = config.transport.max_frame_payload,
        outbound_window = config.transport.outbound_window,
        "transport limits"
    );
    tracing::info!(
        max_file_size = config.transfer.max_file_size,
        inactivity_timeout_secs = config.transfer.inactivity_timeout_secs,
        storage = %storage_path.display(),
        "transfer limits"
    );
    if config.directory.screen_names.is_empty() {
        tracing::warn!("screen name directory is empty; any name may sign on");
    } else {
        tracing::info!(names = config.directory.screen_names.len(), "screen name directory loaded");
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let tcp = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    let listener_task = tokio::spawn(
        listener::ClientListener::new(tcp, server.clone(), shutdown_tx.clone()).run(),
    );

    let _online_printer = {
        let registry = server.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(count = registry.len(), "online snapshot");
            }
        })
    };

    // Admin HTTP endpoint
    let api_port = config.network.api_port;
    let _api_server = {
        let state = dialtone_api::ApiState {
            server: server.clone(),
            listen_addr: listen_addr.clone(),
            started_at: Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = dialtone_api::serve(state, api_port).await {
                tracing::error!(error = %e, "admin API failed");
            }
        })
    };

    let _ = shutdown_rx.recv().await;
    tracing::info!("shutting down");

    match tokio::time::timeout(Duration::from_secs(5), listener_task).await {
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "listener exited with error"),
        Ok(_) => {}
        Err(_) => tracing::warn!("listener did not stop in time"),
    }
    tracing::info!(online = server.registry.len(), "dialtoned stopped");
    Ok(())
}
