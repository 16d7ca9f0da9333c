use crate::*;

use dialtone_core::atom::Operand;
use dialtone_services::storage::UPLOAD_SCOPE;
use dialtone_services::{Direction, TransferStatus};

fn shutdown() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

#[tokio::test]
async fn test_sign_on_and_welcome() -> Result<()> {
    let server = server();
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);

    client.sign_on("Steve Case").await?;
    assert_eq!(client.next_frame().await?.kind, FrameKind::Ack);
    let welcome = client.next_scene().await?;
    assert!(welcome
        .iter()
        .any(|a| a.operands.contains(&Operand::from("Welcome, Steve Case!"))));

    let conn = server.registry.get("stevecase").unwrap();
    assert_eq!(conn.screen_name, "Steve Case");
    assert_eq!(server.registry.online_identities(), ["stevecase"]);

    client.hang_up().await?;
    assert!(server.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_link_control_before_sign_on() -> Result<()> {
    let server = server();
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);

    client.send_frame(FrameKind::Heartbeat, &[]).await?;
    assert_eq!(client.next_frame().await?.kind, FrameKind::Ack);
    client.send_frame(FrameKind::Ss, &[]).await?;
    assert_eq!(client.next_frame().await?.kind, FrameKind::Ssr);

    // junk and transfer messages before sign-on are dropped, not fatal
    client.send_raw(b"\x00\x01not a frame").await?;
    client.send(&ClientMessage::DownloadAck { xfer_id: 1 }).await?;
    client.send_frame(FrameKind::Heartbeat, &[]).await?;
    assert_eq!(client.next_frame().await?.kind, FrameKind::Ack);
    assert!(server.registry.is_empty());

    client.sign_on("guest").await?;
    client.next_scene().await?;
    assert!(server.registry.get("guest").is_some());
    client.hang_up().await
}

#[tokio::test]
async fn test_unregistered_name_is_turned_away() -> Result<()> {
    let server = ServerContext::new(
        PacerLimits::default(),
        64,
        TransferLimits::default(),
        Arc::new(StaticDirectory::new(["Steve Case"])),
        Arc::new(MemoryStorage::new()),
    );
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);

    client.sign_on("Mallory").await?;
    let frames = client.read_to_close().await?;
    let sent = scenes(&data_payloads(&frames));
    assert_eq!(sent.len(), 1);
    assert!(atom_names(&sent[0]).contains(&"async_alert"));
    assert!(server.registry.is_empty());
    client.hang_up().await
}

/// Host-initiated download driven to completion by wire acks.
#[tokio::test]
async fn test_download_over_the_wire() -> Result<()> {
    let server = server();
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);
    client.sign_on("guest").await?;
    client.next_scene().await?;

    let conn = server.registry.get("guest").unwrap();
    let data: Vec<u8> = (0..3000).map(|i| (i % 97) as u8).collect();
    let state = server
        .engine
        .initiate_download(&conn, "readme.txt", Bytes::from(data.clone()))?;

    let announce = client.next_scene().await?;
    assert!(announce
        .iter()
        .any(|a| a.name() == "xfer_set_id" && a.operands == [Operand::Int(state.id)]));

    client
        .send(&ClientMessage::DownloadAck { xfer_id: state.id })
        .await?;
    let mut payloads = Vec::new();
    loop {
        let p = client.next_data().await?;
        let end = p.token == token::DOWNLOAD_END;
        payloads.push(p);
        if end {
            break;
        }
    }
    let (body, total) = download_body(&payloads, state.id);
    assert_eq!(body, data);
    assert_eq!(total, Some(3000));

    client
        .send(&ClientMessage::DownloadConfirm { xfer_id: state.id })
        .await?;
    assert!(eventually(|| server.engine.report(&conn).download.is_none()).await);
    assert!(server.engine.report(&conn).failed.is_empty());
    client.hang_up().await
}

/// Host-requested upload: picker, stats, authorize, data, end.
#[tokio::test]
async fn test_upload_over_the_wire() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let server = server_with(storage.clone(), TransferLimits::default());
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);
    client.sign_on("Steve Case").await?;
    client.next_scene().await?;

    let conn = server.registry.get("stevecase").unwrap();
    let id = server.engine.initiate_upload(&conn)?.id;

    client.next_scene().await?;
    client
        .send(&ClientMessage::UploadPicked {
            xfer_id: id,
            filename: "A:\\notes.txt".into(),
        })
        .await?;
    client.next_scene().await?;
    client
        .send(&ClientMessage::UploadStats { xfer_id: id, size: 11 })
        .await?;
    client.next_scene().await?;
    for part in [&b"hello "[..], &b"world"[..]] {
        client
            .send(&ClientMessage::UploadData {
                xfer_id: id,
                data: Bytes::copy_from_slice(part),
            })
            .await?;
    }
    client.send(&ClientMessage::UploadEnd { xfer_id: id }).await?;

    assert!(eventually(|| storage.read(UPLOAD_SCOPE, "stevecase", "notes.txt").is_ok()).await);
    let stored = storage.read(UPLOAD_SCOPE, "stevecase", "notes.txt")?;
    assert_eq!(stored.as_ref(), b"hello world");
    assert!(server.engine.report(&conn).upload.is_none());
    client.hang_up().await
}

/// Signing on again under the same name replaces the first link and hangs
/// it up; the first session ending leaves the replacement registered.
#[tokio::test]
async fn test_duplicate_sign_on_evicts() -> Result<()> {
    let server = server();
    let (_tx, rx) = shutdown();

    let mut first = Client::connect(&server, rx.resubscribe());
    first.sign_on("Steve Case").await?;
    first.next_scene().await?;
    let old = server.registry.get("stevecase").unwrap();

    let mut second = Client::connect(&server, rx);
    second.sign_on("stevecase").await?;
    second.next_scene().await?;
    let new = server.registry.get("Steve Case").unwrap();

    assert_ne!(old.id, new.id);
    assert!(old.is_closed());
    assert_eq!(server.registry.len(), 1);
    drop(old);

    // the server drops the evicted link without waiting for the old client
    first.read_to_close().await?;
    first.hang_up().await?;
    assert_eq!(server.registry.get("stevecase").unwrap().id, new.id);

    // the replacement is still live
    second.send_frame(FrameKind::Heartbeat, &[]).await?;
    assert_eq!(second.next_frame().await?.kind, FrameKind::Ack);

    second.hang_up().await?;
    assert!(server.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_disconnect_cancels_transfers() -> Result<()> {
    let server = server();
    let (_tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);
    client.sign_on("guest").await?;
    client.next_scene().await?;

    let conn = server.registry.get("guest").unwrap();
    let state = server
        .engine
        .initiate_download(&conn, "a.txt", Bytes::from_static(b"hello"))?;
    assert_eq!(state.status, TransferStatus::AwaitingAck);

    client.hang_up().await?;
    assert!(conn.is_closed());
    assert!(conn.transfers.active(Direction::Download).is_none());
    assert!(conn.transfers.failed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_links() -> Result<()> {
    let server = server();
    let (tx, rx) = shutdown();
    let mut client = Client::connect(&server, rx);
    client.sign_on("guest").await?;
    client.next_scene().await?;

    tx.send(())?;
    client.read_to_close().await?;
    assert!(server.registry.is_empty());
    client.hang_up().await
}
