use crate::*;

use dialtone_services::storage::{StorageError, UPLOAD_SCOPE};
use dialtone_services::{Direction, FailureReason, TransferStatus, XferError};

fn upload_to_streaming(
    server: &ServerContext,
    conn: &Connection,
    size: u32,
) -> u32 {
    let id = server.engine.initiate_upload(conn).unwrap().id;
    let picked = ClientMessage::UploadPicked {
        xfer_id: id,
        filename: "C:\\DOWNLOAD\\cat.gif".into(),
    };
    server.engine.handle(conn, &picked).unwrap();
    let stats = ClientMessage::UploadStats { xfer_id: id, size };
    let state = server.engine.handle(conn, &stats).unwrap().unwrap();
    assert_eq!(state.status, TransferStatus::Streaming);
    id
}

fn upload_data(id: u32, bytes: &'static [u8]) -> ClientMessage {
    ClientMessage::UploadData {
        xfer_id: id,
        data: Bytes::from_static(bytes),
    }
}

// ── Downloads ─────────────────────────────────────────────────────────────────

/// A second download is refused while the first is in flight, and allowed
/// again once the first completes.
#[test]
fn test_download_conflict_then_completion() {
    let server = server();
    let (conn, mut rx) = attach(&server, 1, "Steve Case");
    let data: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();

    let first = server
        .engine
        .initiate_download(&conn, "big.bin", Bytes::from(data.clone()))
        .unwrap();
    assert_eq!(first.status, TransferStatus::AwaitingAck);
    assert_eq!(first.size, 10 * 1024);

    let err = server
        .engine
        .initiate_download(&conn, "other.bin", Bytes::from_static(b"x"))
        .unwrap_err();
    assert!(matches!(
        err,
        XferError::Conflict { direction: Direction::Download, id } if id == first.id
    ));

    let announce = scenes(&data_payloads(&drain(&conn, &mut rx)));
    assert_eq!(announce.len(), 1);
    assert!(atom_names(&announce[0]).contains(&"xfer_invoke_download"));

    let ack = ClientMessage::DownloadAck { xfer_id: first.id };
    let streaming = server.engine.handle(&conn, &ack).unwrap().unwrap();
    assert_eq!(streaming.status, TransferStatus::Streaming);
    assert_eq!(streaming.offset, streaming.size);

    let frames = drain(&conn, &mut rx);
    assert!(frames.iter().all(|f| f.payload.len() <= MAX_PAYLOAD));
    let (body, total) = download_body(&data_payloads(&frames), first.id);
    assert_eq!(body, data);
    assert_eq!(total, Some(10 * 1024));

    let confirm = ClientMessage::DownloadConfirm { xfer_id: first.id };
    let done = server.engine.handle(&conn, &confirm).unwrap().unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    let report = server.engine.report(&conn);
    assert!(report.download.is_none());
    assert_eq!(report.last_download.unwrap().status, TransferStatus::Completed);

    let third = server
        .engine
        .initiate_download(&conn, "other.bin", Bytes::from_static(b"x"))
        .unwrap();
    assert_ne!(third.id, first.id);
}

#[test]
fn test_download_messages_out_of_order() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let state = server
        .engine
        .initiate_download(&conn, "a.txt", Bytes::from_static(b"hello"))
        .unwrap();

    let confirm = ClientMessage::DownloadConfirm { xfer_id: state.id };
    assert!(matches!(
        server.engine.handle(&conn, &confirm),
        Err(XferError::UnexpectedState { status: TransferStatus::AwaitingAck, .. })
    ));

    let stray = ClientMessage::DownloadAck { xfer_id: state.id + 100 };
    assert!(matches!(
        server.engine.handle(&conn, &stray),
        Err(XferError::UnknownTransfer(_))
    ));
    // neither message disturbed the real transfer
    assert_eq!(
        server.engine.report(&conn).download.unwrap().status,
        TransferStatus::AwaitingAck
    );
}

#[test]
fn test_download_limits_and_names() {
    let server = server_with(
        Arc::new(MemoryStorage::new()),
        TransferLimits {
            max_file_size: 100,
            ..TransferLimits::default()
        },
    );
    let (conn, _rx) = attach(&server, 1, "guest");

    let err = server
        .engine
        .initiate_download(&conn, "big.bin", Bytes::from(vec![0u8; 101]))
        .unwrap_err();
    assert!(matches!(err, XferError::SizeLimitExceeded { limit: 100, size: 101 }));

    let err = server
        .engine
        .initiate_download(&conn, "../secret", Bytes::from_static(b"x"))
        .unwrap_err();
    assert!(matches!(err, XferError::Storage(StorageError::InvalidName(_))));

    // rejected requests never occupy the slot
    assert!(server.engine.report(&conn).download.is_none());
    assert!(server.engine.report(&conn).failed.is_empty());
}

#[test]
fn test_cancellations() {
    let server = server();
    let (conn, mut rx) = attach(&server, 1, "guest");

    let down = server
        .engine
        .initiate_download(&conn, "a.txt", Bytes::from_static(b"hello"))
        .unwrap();
    let cancel = ClientMessage::Cancel { xfer_id: down.id };
    let state = server.engine.handle(&conn, &cancel).unwrap().unwrap();
    assert_eq!(state.status, TransferStatus::Cancelled);

    server.engine.initiate_upload(&conn).unwrap();
    drain(&conn, &mut rx);
    let state = server.engine.cancel(&conn, Direction::Upload).unwrap();
    assert_eq!(state.status, TransferStatus::Cancelled);
    assert!(server.engine.cancel(&conn, Direction::Upload).is_none());

    // the host-side cancel tells the client
    let abort = scenes(&data_payloads(&drain(&conn, &mut rx)));
    assert_eq!(abort.len(), 1);

    // a client cancel stays observable after the slot is freed
    let report = server.engine.report(&conn);
    assert!(report.download.is_none());
    assert!(report.upload.is_none());
    assert!(report.failed.is_empty());
    let last = report.last_download.unwrap();
    assert_eq!((last.id, last.status), (down.id, TransferStatus::Cancelled));
    assert_eq!(report.last_upload.unwrap().status, TransferStatus::Cancelled);
}

// ── Uploads ───────────────────────────────────────────────────────────────────

#[test]
fn test_upload_is_stored_under_sender() {
    let storage = Arc::new(MemoryStorage::new());
    let server = server_with(storage.clone(), TransferLimits::default());
    let (conn, mut rx) = attach(&server, 1, "Steve Case");

    let requested = server.engine.initiate_upload(&conn).unwrap();
    assert_eq!(requested.status, TransferStatus::AwaitingFilePick);
    let id = requested.id;

    let picked = ClientMessage::UploadPicked {
        xfer_id: id,
        filename: "C:\\DOWNLOAD\\cat.gif".into(),
    };
    let state = server.engine.handle(&conn, &picked).unwrap().unwrap();
    assert_eq!(state.status, TransferStatus::AwaitingStats);
    assert_eq!(state.filename, "cat.gif");

    let stats = ClientMessage::UploadStats { xfer_id: id, size: 6 };
    server.engine.handle(&conn, &stats).unwrap();
    let state = server.engine.handle(&conn, &upload_data(id, b"abc")).unwrap().unwrap();
    assert_eq!(state.offset, 3);
    server.engine.handle(&conn, &upload_data(id, b"def")).unwrap();

    let end = ClientMessage::UploadEnd { xfer_id: id };
    let done = server.engine.handle(&conn, &end).unwrap().unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.size, 6);

    let stored = storage.read(UPLOAD_SCOPE, "stevecase", "cat.gif").unwrap();
    assert_eq!(stored.as_ref(), b"abcdef");

    // picker, stat and authorize scenes, in that order
    let sent = scenes(&data_payloads(&drain(&conn, &mut rx)));
    assert_eq!(sent.len(), 3);
    assert!(server.engine.report(&conn).upload.is_none());
}

#[test]
fn test_empty_pick_cancels_upload() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let id = server.engine.initiate_upload(&conn).unwrap().id;

    let picked = ClientMessage::UploadPicked {
        xfer_id: id,
        filename: String::new(),
    };
    let state = server.engine.handle(&conn, &picked).unwrap().unwrap();
    assert_eq!(state.status, TransferStatus::Cancelled);
    assert!(server.engine.report(&conn).failed.is_empty());
}

#[test]
fn test_upload_over_limit_fails() {
    let server = server_with(
        Arc::new(MemoryStorage::new()),
        TransferLimits {
            max_file_size: 100,
            ..TransferLimits::default()
        },
    );
    let (conn, mut rx) = attach(&server, 1, "guest");
    let id = server.engine.initiate_upload(&conn).unwrap().id;
    let picked = ClientMessage::UploadPicked {
        xfer_id: id,
        filename: "big.zip".into(),
    };
    server.engine.handle(&conn, &picked).unwrap();

    let stats = ClientMessage::UploadStats { xfer_id: id, size: 101 };
    let err = server.engine.handle(&conn, &stats).unwrap_err();
    assert!(matches!(err, XferError::SizeLimitExceeded { limit: 100, size: 101 }));

    let report = server.engine.report(&conn);
    assert!(report.upload.is_none());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        report.failed[0].failure,
        Some(FailureReason::SizeLimitExceeded { limit: 100, size: 101 })
    );

    // picker, stat, then the abort notice
    assert_eq!(scenes(&data_payloads(&drain(&conn, &mut rx))).len(), 3);
}

#[test]
fn test_upload_overrunning_declared_size_fails() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let id = upload_to_streaming(&server, &conn, 4);

    let err = server.engine.handle(&conn, &upload_data(id, b"12345")).unwrap_err();
    assert!(matches!(err, XferError::SizeLimitExceeded { limit: 4, size: 5 }));
    assert_eq!(server.engine.report(&conn).failed.len(), 1);
}

#[test]
fn test_short_upload_fails() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let id = upload_to_streaming(&server, &conn, 6);
    server.engine.handle(&conn, &upload_data(id, b"abc")).unwrap();

    let end = ClientMessage::UploadEnd { xfer_id: id };
    let err = server.engine.handle(&conn, &end).unwrap_err();
    assert!(matches!(err, XferError::ShortUpload { expected: 6, received: 3 }));

    let failed = server.engine.report(&conn).failed;
    assert_eq!(
        failed[0].failure,
        Some(FailureReason::ShortUpload { expected: 6, received: 3 })
    );
    assert!(server.engine.storage().read(UPLOAD_SCOPE, "guest", "cat.gif").is_err());
}

#[test]
fn test_storage_failure_marks_upload_failed() {
    let server = server_with(Arc::new(MemoryStorage::read_only()), TransferLimits::default());
    let (conn, _rx) = attach(&server, 1, "guest");
    let id = upload_to_streaming(&server, &conn, 3);
    server.engine.handle(&conn, &upload_data(id, b"abc")).unwrap();

    let end = ClientMessage::UploadEnd { xfer_id: id };
    let err = server.engine.handle(&conn, &end).unwrap_err();
    assert!(matches!(err, XferError::Storage(StorageError::ReadOnly)));

    let report = server.engine.report(&conn);
    assert!(report.upload.is_none());
    assert!(matches!(
        report.failed[0].failure,
        Some(FailureReason::Storage { .. })
    ));
    assert_eq!(server.engine.clear_failed(&conn), 1);
    assert!(server.engine.report(&conn).failed.is_empty());
}

// ── Timeouts ──────────────────────────────────────────────────────────────────

/// An upload left idle past the timeout fails, late messages for it are
/// reported as timed out, and the slot is immediately reusable.
#[tokio::test(start_paused = true)]
async fn test_idle_upload_times_out() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let first = server.engine.initiate_upload(&conn).unwrap();

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(server.engine.sweep(&conn).is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let picked = ClientMessage::UploadPicked {
        xfer_id: first.id,
        filename: "late.txt".into(),
    };
    let err = server.engine.handle(&conn, &picked).unwrap_err();
    assert!(matches!(err, XferError::Timeout(id) if id == first.id));

    let failed = server.engine.report(&conn).failed;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, first.id);
    assert_eq!(failed[0].failure, Some(FailureReason::Timeout));

    let second = server.engine.initiate_upload(&conn).unwrap();
    assert_eq!(second.status, TransferStatus::AwaitingFilePick);

    // once swept, the old id is simply unknown
    let err = server.engine.handle(&conn, &picked).unwrap_err();
    assert!(matches!(err, XferError::UnknownTransfer(id) if id == first.id));
}

/// Activity resets the idle clock.
#[tokio::test(start_paused = true)]
async fn test_activity_keeps_upload_alive() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let id = upload_to_streaming(&server, &conn, 9);

    for chunk in [b"abc", b"def", b"ghi"] {
        tokio::time::advance(Duration::from_secs(20)).await;
        server.engine.handle(&conn, &upload_data(id, chunk)).unwrap();
    }
    assert_eq!(server.engine.report(&conn).upload.unwrap().offset, 9);
}

/// A transfer that times out without any further traffic is found by the
/// next initiation.
#[tokio::test(start_paused = true)]
async fn test_stale_download_does_not_block_new_one() {
    let server = server();
    let (conn, _rx) = attach(&server, 1, "guest");
    let first = server
        .engine
        .initiate_download(&conn, "a.txt", Bytes::from_static(b"hello"))
        .unwrap();

    tokio::time::advance(server.engine.limits().inactivity_timeout).await;
    let second = server
        .engine
        .initiate_download(&conn, "b.txt", Bytes::from_static(b"world"))
        .unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(server.engine.report(&conn).failed[0].id, first.id);
}

/// A download that takes longer than the idle timeout to pace out stays
/// alive while segments keep leaving; the idle clock only starts once the
/// last one is gone.
#[tokio::test(start_paused = true)]
async fn test_slow_delivery_keeps_download_alive() {
    let server = server();
    let (conn, mut rx) = attach(&server, 1, "guest");
    let data: Vec<u8> = (0..200 * 1024).map(|i| (i % 241) as u8).collect();
    let state = server
        .engine
        .initiate_download(&conn, "big.bin", Bytes::from(data.clone()))
        .unwrap();
    drain(&conn, &mut rx);

    let ack = ClientMessage::DownloadAck { xfer_id: state.id };
    server.engine.handle(&conn, &ack).unwrap();

    // one burst per second: far slower than the 30 s timeout allows for
    // the whole file
    let mut frames = Vec::new();
    let mut elapsed = Duration::ZERO;
    while !conn.pacer.is_empty() {
        frames.extend(drain_burst(&conn, &mut rx));
        tokio::time::advance(Duration::from_secs(1)).await;
        elapsed += Duration::from_secs(1);
        let report = server.engine.report(&conn);
        assert_eq!(
            report.download.map(|s| s.status),
            Some(TransferStatus::Streaming),
            "download dropped after {elapsed:?}"
        );
    }
    assert!(elapsed > server.engine.limits().inactivity_timeout);

    let (body, total) = download_body(&data_payloads(&frames), state.id);
    assert_eq!(body, data);
    assert_eq!(total, Some(200 * 1024));

    let confirm = ClientMessage::DownloadConfirm { xfer_id: state.id };
    let done = server.engine.handle(&conn, &confirm).unwrap().unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert!(server.engine.report(&conn).failed.is_empty());
}

/// With everything delivered, a missing confirm times out as usual.
#[tokio::test(start_paused = true)]
async fn test_unconfirmed_download_times_out_after_delivery() {
    let server = server();
    let (conn, mut rx) = attach(&server, 1, "guest");
    let state = server
        .engine
        .initiate_download(&conn, "a.txt", Bytes::from(vec![7u8; 4000]))
        .unwrap();
    server
        .engine
        .handle(&conn, &ClientMessage::DownloadAck { xfer_id: state.id })
        .unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    drain(&conn, &mut rx);

    // delivery just now counts as activity
    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(server.engine.sweep(&conn).is_empty());

    tokio::time::advance(Duration::from_secs(10)).await;
    let expired = server.engine.sweep(&conn);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].failure, Some(FailureReason::Timeout));
}

/// One paced burst, decoded.
fn drain_burst(conn: &Connection, rx: &mut mpsc::Receiver<Bytes>) -> Vec<Frame> {
    conn.flush();
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
