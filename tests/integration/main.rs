//! Dialtone integration test harness.
//!
//! Everything runs in-process. Client links are `tokio::io::duplex` pipes
//! driven by [`Client`], and inactivity timeouts run on paused tokio time, so
//! the suite needs no network and no running daemon:
//!
//!   cargo test --test integration

mod compile;
mod sessions;
mod transfers;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use dialtone_core::atom::Atom;
use dialtone_core::codec::decode_stream;
use dialtone_core::token::{self, ClientMessage, Token};
use dialtone_core::wire::{self, ClientProfile, DataPayload, Frame, FrameDecoder, FrameKind};
use dialtone_core::AtomTable;
use dialtone_services::{
    run_session, Connection, FileStorage, MemoryStorage, PacerLimits, ServerContext,
    StaticDirectory, TransferLimits,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const MAX_PAYLOAD: usize = wire::DEFAULT_MAX_FRAME_PAYLOAD;

/// How long a client waits for the server before the test fails.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Server context with in-memory storage and an open directory.
pub fn server() -> ServerContext {
    server_with(Arc::new(MemoryStorage::new()), TransferLimits::default())
}

pub fn server_with(storage: Arc<dyn FileStorage>, limits: TransferLimits) -> ServerContext {
    ServerContext::new(
        PacerLimits::default(),
        64,
        limits,
        Arc::new(StaticDirectory::open()),
        storage,
    )
}

/// A registered connection with no session behind it. The receiver gets
/// every frame the connection hands to its writer.
pub fn attach(
    server: &ServerContext,
    id: u64,
    screen_name: &str,
) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(1024);
    let conn = Arc::new(Connection::new(
        id,
        screen_name,
        ClientProfile::default(),
        tx,
        server.pacer_limits,
    ));
    server.registry.register(conn.clone());
    (conn, rx)
}

/// Push everything queued on `conn` and decode what the writer would send.
pub fn drain(conn: &Connection, rx: &mut mpsc::Receiver<Bytes>) -> Vec<Frame> {
    while conn.flush() > 0 {}
    let mut dec = FrameDecoder::new();
    while let Ok(bytes) = rx.try_recv() {
        dec.push(&bytes);
    }
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = dec.next_frame() {
        frames.push(frame);
    }
    frames
}

/// DATA payloads among `frames`, in order.
pub fn data_payloads(frames: &[Frame]) -> Vec<DataPayload> {
    frames
        .iter()
        .filter(|f| f.kind == FrameKind::Data)
        .map(|f| DataPayload::parse(&f.payload).unwrap())
        .collect()
}

/// Reassemble the F7 segments of one download. Returns the file bytes and
/// the total announced by the F9 marker.
pub fn download_body(payloads: &[DataPayload], xfer_id: u32) -> (Vec<u8>, Option<u32>) {
    let mut body = Vec::new();
    let mut total = None;
    for p in payloads {
        let id = u32::from_be_bytes([p.data[0], p.data[1], p.data[2], p.data[3]]);
        if id != xfer_id {
            continue;
        }
        match p.token {
            token::DOWNLOAD_DATA => body.extend_from_slice(&p.data[4..]),
            token::DOWNLOAD_END => {
                total = Some(u32::from_be_bytes([p.data[4], p.data[5], p.data[6], p.data[7]]));
            }
            _ => {}
        }
    }
    (body, total)
}

/// Decode complete FDO streams out of `payloads`, one per stream id, in the
/// order the streams started.
pub fn scenes(payloads: &[DataPayload]) -> Vec<Vec<Atom>> {
    let table = AtomTable::standard();
    let mut order: Vec<u16> = Vec::new();
    let mut bodies: Vec<Vec<u8>> = Vec::new();
    for p in payloads.iter().filter(|p| p.token == token::FDO) {
        match order.iter().position(|s| *s == p.stream_id) {
            Some(i) => bodies[i].extend_from_slice(&p.data),
            None => {
                order.push(p.stream_id);
                bodies.push(p.data.to_vec());
            }
        }
    }
    bodies
        .iter()
        .map(|b| decode_stream(&table, b).unwrap())
        .collect()
}

pub fn atom_names(atoms: &[Atom]) -> Vec<&'static str> {
    atoms.iter().map(Atom::name).collect()
}

// ── Client ────────────────────────────────────────────────────────────────────

/// The client end of a duplex link with a live session on the other side.
pub struct Client {
    io: DuplexStream,
    decoder: FrameDecoder,
    tx_seq: u8,
    pub session: JoinHandle<Result<()>>,
}

impl Client {
    pub fn connect(server: &ServerContext, shutdown: broadcast::Receiver<()>) -> Self {
        let (io, server_side) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run_session(
            server.clone(),
            server_side,
            "duplex".into(),
            shutdown,
        ));
        Self {
            io,
            decoder: FrameDecoder::new(),
            tx_seq: wire::SEQ_MAX,
            session,
        }
    }

    pub async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        self.tx_seq = wire::next_seq(self.tx_seq);
        let frame = wire::encode_frame(kind, self.tx_seq, wire::SEQ_MAX, payload)?;
        self.io.write_all(&frame).await?;
        Ok(())
    }

    /// Write bytes to the link as-is.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await?;
        Ok(())
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let (token, data) = msg.encode();
        let payload = DataPayload {
            token,
            stream_id: 0,
            data: Bytes::from(data),
        }
        .encode();
        self.send_frame(FrameKind::Data, &payload).await
    }

    /// INIT as a Windows client, then sign on.
    pub async fn sign_on(&mut self, screen_name: &str) -> Result<()> {
        self.send_frame(FrameKind::Init, b"W\x01\x2c\x01").await?;
        self.send(&ClientMessage::SignOn {
            screen_name: screen_name.into(),
        })
        .await
    }

    pub async fn next_frame(&mut self) -> Result<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let n = tokio::time::timeout(IO_TIMEOUT, self.io.read(&mut buf))
                .await
                .context("timed out waiting for a frame")??;
            if n == 0 {
                bail!("link closed");
            }
            self.decoder.push(&buf[..n]);
        }
    }

    pub async fn next_data(&mut self) -> Result<DataPayload> {
        loop {
            let frame = self.next_frame().await?;
            if frame.kind == FrameKind::Data {
                return Ok(DataPayload::parse(&frame.payload)?);
            }
        }
    }

    /// Skip ahead to the next DATA message carrying `token`.
    pub async fn expect(&mut self, token: Token) -> Result<DataPayload> {
        loop {
            let p = self.next_data().await?;
            if p.token == token {
                return Ok(p);
            }
        }
    }

    /// Read the next complete FDO stream.
    pub async fn next_scene(&mut self) -> Result<Vec<Atom>> {
        let table = AtomTable::standard();
        let first = self.expect(token::FDO).await?;
        let stream_id = first.stream_id;
        let mut body = first.data.to_vec();
        loop {
            if let Ok(atoms) = decode_stream(&table, &body) {
                if atoms
                    .last()
                    .is_some_and(|a| a.name() == "uni_end_stream" && a.depth == 0)
                {
                    return Ok(atoms);
                }
            }
            let p = self.expect(token::FDO).await?;
            if p.stream_id != stream_id {
                bail!("stream {} interleaved with {stream_id}", p.stream_id);
            }
            body.extend_from_slice(&p.data);
        }
    }

    /// Drop the link and wait for the session to finish.
    pub async fn hang_up(self) -> Result<()> {
        let Client { io, session, .. } = self;
        drop(io);
        session.await?
    }

    /// Read until the server closes the link.
    pub async fn read_to_close(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.next_frame().await {
                Ok(frame) => frames.push(frame),
                Err(e) if e.to_string() == "link closed" => return Ok(frames),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
