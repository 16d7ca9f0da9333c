//! Client listener — accepts TCP links and spawns a session per link.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use dialtone_services::{run_session, ServerContext};

pub struct ClientListener {
    listener: TcpListener,
    server: ServerContext,
    shutdown: broadcast::Sender<()>,
}

impl ClientListener {
    pub fn new(listener: TcpListener, server: ServerContext, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            listener,
            server,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut stop = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!(active = sessions.len(), "client listener shutting down");
                    break;
                }

                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!(error = %e, "session task panicked");
                    }
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %addr, error = %e, "set_nodelay failed");
                    }
                    let server = self.server.clone();
                    let shutdown = self.shutdown.subscribe();
                    sessions.spawn(async move {
                        let peer = addr.to_string();
                        if let Err(e) = run_session(server, stream, peer.clone(), shutdown).await {
                            tracing::warn!(%peer, error = %e, "session ended with error");
                        }
                    });
                }
            }
        }

        // Sessions received the same shutdown signal; wait for them to unwind.
        while let Some(done) = sessions.join_next().await {
            if let Err(e) = done {
                tracing::warn!(error = %e, "session task panicked");
            }
        }
        Ok(())
    }
}
