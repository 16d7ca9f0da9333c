//! Session driver — one task per client link.
//!
//! Reads P3 frames off the socket, answers link-control frames, admits the
//! client on its sign-on message and then routes DATA messages into the
//! transfer engine. Outbound traffic goes through a bounded channel drained
//! by a dedicated writer task; a pump task moves paced chunks from the
//! connection's queue into that channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use dialtone_core::config::DialtoneConfig;
use dialtone_core::token::ClientMessage;
use dialtone_core::wire::{self, ClientProfile, DataPayload, Frame, FrameDecoder, FrameKind};
use dialtone_core::AtomTable;

use crate::compiler::Compiler;
use crate::connection::{Connection, ConnectionRegistry};
use crate::directory::{Directory, StaticDirectory};
use crate::pacer::PacerLimits;
use crate::scene::{SceneContext, SceneRegistry};
use crate::storage::FileStorage;
use crate::xfer::{TransferEngine, TransferLimits};

/// How often idle transfers are checked while a link is quiet.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// How long the writer gets to flush after the read side ends.
const WRITER_GRACE: Duration = Duration::from_secs(5);
const READ_BUF: usize = 4096;

/// Everything a session needs, shared by all sessions.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: ConnectionRegistry,
    pub engine: Arc<TransferEngine>,
    pub directory: Arc<dyn Directory>,
    pub scenes: Arc<SceneRegistry>,
    pub compiler: Arc<Compiler>,
    pub pacer_limits: PacerLimits,
    pub outbound_window: usize,
    next_conn_id: Arc<AtomicU64>,
}

impl ServerContext {
    pub fn new(
        pacer_limits: PacerLimits,
        outbound_window: usize,
        transfer_limits: TransferLimits,
        directory: Arc<dyn Directory>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        let compiler = Arc::new(Compiler::new(
            Arc::new(AtomTable::standard()),
            pacer_limits.max_frame_payload,
        ));
        let scenes = Arc::new(SceneRegistry::with_builtins());
        let engine = Arc::new(TransferEngine::new(
            transfer_limits,
            storage,
            compiler.clone(),
            scenes.clone(),
        ));
        Self {
            registry: ConnectionRegistry::new(),
            engine,
            directory,
            scenes,
            compiler,
            pacer_limits,
            outbound_window: outbound_window.max(1),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn from_config(config: &DialtoneConfig, storage: Arc<dyn FileStorage>) -> Self {
        let directory = StaticDirectory::new(config.directory.screen_names.iter().cloned());
        Self::new(
            PacerLimits {
                max_burst: config.transport.max_burst,
                max_frame_payload: config.transport.max_frame_payload,
            },
            config.transport.outbound_window,
            TransferLimits {
                max_file_size: config.transfer.max_file_size,
                inactivity_timeout: Duration::from_secs(config.transfer.inactivity_timeout_secs),
            },
            Arc::new(directory),
            storage,
        )
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one client link until EOF, a read error or shutdown.
pub async fn run_session<S>(
    ctx: ServerContext,
    stream: S,
    peer: String,
    shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(ctx.outbound_window);

    let writer_task = {
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!(%peer, error = %e, "socket write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        })
    };

    tracing::info!(%peer, "link up");
    let mut link = Link {
        ctx,
        peer,
        out: out_tx,
        profile: ClientProfile::default(),
        last_rx: wire::SEQ_MAX,
        conn: None,
        pump: None,
    };
    let result = link.read_loop(reader, shutdown).await;
    let peer = link.peer.clone();
    link.teardown().await;

    // The session's own senders are gone now, so the writer exits once the
    // channel drains. Anything still holding the connection past the grace
    // period loses the socket anyway.
    let mut writer_task = writer_task;
    if tokio::time::timeout(WRITER_GRACE, &mut writer_task).await.is_err() {
        tracing::warn!(%peer, "writer did not drain in time");
        writer_task.abort();
    }
    tracing::info!(%peer, "link down");
    result
}

enum Flow {
    Continue,
    Close,
}

struct Link {
    ctx: ServerContext,
    peer: String,
    out: mpsc::Sender<Bytes>,
    profile: ClientProfile,
    /// Last client sequence number, before a connection exists.
    last_rx: u8,
    conn: Option<Arc<Connection>>,
    pump: Option<JoinHandle<()>>,
}

impl Link {
    async fn read_loop<R>(&mut self, mut reader: R, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF];
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(peer = %self.peer, "session shutting down");
                    return Ok(());
                }

                _ = closed_by_server(self.conn.clone()) => {
                    tracing::info!(peer = %self.peer, "connection closed by server, hanging up");
                    return Ok(());
                }

                _ = sweep.tick() => {
                    if let Some(conn) = &self.conn {
                        self.ctx.engine.sweep(conn);
                    }
                }

                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::debug!(peer = %self.peer, "client closed link");
                        return Ok(());
                    }
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => {
                                if let Flow::Close = self.on_frame(frame) {
                                    return Ok(());
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(peer = %self.peer, error = %e, "dropping bad frame");
                            }
                        }
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Flow {
        match &self.conn {
            Some(conn) => conn.pacer.set_rx_seq(frame.tx_seq),
            None => self.last_rx = frame.tx_seq,
        }

        match frame.kind {
            FrameKind::Init => {
                self.profile = ClientProfile::from_init(&frame.payload);
                tracing::debug!(peer = %self.peer, profile = ?self.profile, "client init");
                self.control(FrameKind::Ack, &[]);
            }
            FrameKind::Heartbeat => self.control(FrameKind::Ack, &[]),
            FrameKind::Ss => self.control(FrameKind::Ssr, &[]),
            FrameKind::Ack | FrameKind::Nak | FrameKind::Ssr => {}
            FrameKind::Data => return self.on_data(&frame.payload),
        }
        Flow::Continue
    }

    fn on_data(&mut self, payload: &Bytes) -> Flow {
        let msg = match DataPayload::parse(payload)
            .and_then(|p| ClientMessage::parse(p.token, p.data))
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "malformed data frame");
                return Flow::Continue;
            }
        };

        let Some(conn) = self.conn.clone() else {
            return match msg {
                ClientMessage::SignOn { screen_name } => self.sign_on(&screen_name),
                other => {
                    tracing::warn!(peer = %self.peer, msg = ?other, "message before sign-on");
                    Flow::Continue
                }
            };
        };

        match self.ctx.engine.handle(&conn, &msg) {
            Ok(Some(state)) => {
                tracing::debug!(conn = conn.id, xfer_id = state.id, status = ?state.status, "transfer advanced");
            }
            Ok(None) => {
                tracing::debug!(conn = conn.id, msg = ?msg, "ignoring message");
            }
            Err(e) => {
                tracing::warn!(conn = conn.id, error = %e, "transfer message rejected");
            }
        }
        Flow::Continue
    }

    fn sign_on(&mut self, requested: &str) -> Flow {
        let Some(record) = self.ctx.directory.lookup(requested) else {
            tracing::info!(peer = %self.peer, screen_name = requested, "sign-on rejected");
            self.reject(requested);
            return Flow::Close;
        };

        let conn = Arc::new(Connection::new(
            self.ctx.next_conn_id(),
            record.screen_name,
            self.profile,
            self.out.clone(),
            self.ctx.pacer_limits,
        ));
        conn.pacer.set_rx_seq(self.last_rx);
        self.ctx.registry.register(conn.clone());
        tracing::info!(
            peer = %self.peer,
            conn = conn.id,
            screen_name = %conn.screen_name,
            "signed on"
        );

        let ctx = SceneContext::new(conn.screen_name.clone(), conn.profile);
        match self
            .ctx
            .scenes
            .render(self.ctx.compiler.table(), "welcome", &ctx)
            .and_then(|s| self.ctx.compiler.compile(&s, conn.next_stream_id(), "welcome"))
        {
            Ok(chunks) => conn.send(chunks, "welcome"),
            Err(e) => tracing::warn!(conn = conn.id, error = %e, "welcome scene failed"),
        }

        self.pump = Some(spawn_pump(conn.clone()));
        self.conn = Some(conn);
        Flow::Continue
    }

    /// Tell the client why it is being turned away. The message goes out
    /// through a throwaway connection that is never registered.
    fn reject(&self, requested: &str) {
        let conn = Connection::new(0, requested, self.profile, self.out.clone(), self.ctx.pacer_limits);
        conn.pacer.set_rx_seq(self.last_rx);
        let ctx = SceneContext::new(requested, self.profile)
            .with("text", format!("\"{requested}\" is not a registered screen name."))
            .with("kind", "error");
        match self
            .ctx
            .scenes
            .render(self.ctx.compiler.table(), "message", &ctx)
            .and_then(|s| self.ctx.compiler.compile(&s, 1, "sign_on_rejected"))
        {
            Ok(chunks) => {
                conn.send_now(chunks, "sign_on_rejected");
            }
            Err(e) => tracing::warn!(peer = %self.peer, error = %e, "rejection scene failed"),
        }
    }

    fn control(&self, kind: FrameKind, payload: &[u8]) {
        if let Some(conn) = &self.conn {
            conn.send_control(kind, payload);
            return;
        }
        match wire::encode_frame(kind, wire::SEQ_MAX, self.last_rx, payload) {
            Ok(frame) => {
                let _ = self.out.try_send(frame);
            }
            Err(e) => tracing::warn!(peer = %self.peer, error = %e, "control frame rejected"),
        }
    }

    async fn teardown(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if let Some(conn) = self.conn.take() {
            conn.close();
            self.ctx.registry.unregister(&conn.identity, conn.id);
            tracing::info!(conn = conn.id, screen_name = %conn.screen_name, "signed off");
        }
    }
}

/// Resolves when the signed-on connection is closed from outside the session,
/// e.g. evicted by a newer sign-on. Never resolves before sign-on.
async fn closed_by_server(conn: Option<Arc<Connection>>) {
    match conn {
        Some(conn) => conn.closed().await,
        None => std::future::pending().await,
    }
}

/// Move paced chunks from the connection's queue to the writer channel.
fn spawn_pump(conn: Arc<Connection>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if conn.is_closed() {
                break;
            }
            if conn.pacer.is_empty() {
                conn.pacer.ready().await;
                continue;
            }
            conn.flush();
            if !conn.pacer.is_empty() {
                // Channel full: wait for the writer to free a slot.
                match conn.outbound().reserve().await {
                    Ok(permit) => drop(permit),
                    Err(_) => break,
                }
            }
            tokio::task::yield_now().await;
        }
        tracing::debug!(conn = conn.id, "pump stopped");
    })
}
