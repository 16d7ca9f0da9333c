use crate::*;

use dialtone_services::chunker;
use dialtone_services::{FramePacer, OutgoingChunk};

fn chunks(label: &str, stream_id: u16, n: u8) -> Vec<OutgoingChunk> {
    (0..n)
        .map(|i| chunker::single(token::FDO, stream_id, vec![i], label))
        .collect()
}

fn decode_all(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Frame> {
    let mut dec = FrameDecoder::new();
    while let Ok(bytes) = rx.try_recv() {
        dec.push(&bytes);
    }
    let mut frames = Vec::new();
    while let Some(frame) = dec.next_frame().unwrap() {
        frames.push(frame);
    }
    frames
}

fn limits(max_burst: usize) -> PacerLimits {
    PacerLimits {
        max_burst,
        ..PacerLimits::default()
    }
}

/// Messages leave in enqueue order no matter how the drain is sliced.
#[test]
fn test_pacer_preserves_enqueue_order() {
    let pacer = FramePacer::new("order", limits(3));
    let (tx, mut rx) = mpsc::channel(64);
    pacer.enqueue(chunks("a", 1, 5), "a");
    pacer.enqueue(chunks("b", 2, 5), "b");

    let mut sent = 0;
    while !pacer.is_empty() {
        sent += pacer.drain_limited(&tx, 3);
    }
    assert_eq!(sent, 10);

    let order: Vec<(u16, u8)> = data_payloads(&decode_all(&mut rx))
        .iter()
        .map(|p| (p.stream_id, p.data[0]))
        .collect();
    let expected: Vec<(u16, u8)> = (0..5).map(|i| (1, i)).chain((0..5).map(|i| (2, i))).collect();
    assert_eq!(order, expected);
}

/// Twenty queued chunks with a burst of sixteen: sixteen now, four next.
#[test]
fn test_burst_limit() {
    let pacer = FramePacer::new("burst", limits(16));
    let (tx, mut rx) = mpsc::channel(64);
    pacer.enqueue(chunks("x", 1, 20), "x");

    assert_eq!(pacer.drain_limited(&tx, 16), 16);
    assert_eq!(pacer.pending(), 4);
    assert_eq!(decode_all(&mut rx).len(), 16);

    assert_eq!(pacer.drain_limited(&tx, 16), 4);
    assert!(pacer.is_empty());
    assert_eq!(decode_all(&mut rx).len(), 4);
}

/// A full channel stops the burst early; nothing is lost or reordered.
#[test]
fn test_backpressure_requeues_in_order() {
    let pacer = FramePacer::new("full", limits(16));
    let (tx, mut rx) = mpsc::channel(3);
    pacer.enqueue(chunks("x", 1, 8), "x");

    let mut received = Vec::new();
    while !pacer.is_empty() {
        assert!(pacer.drain_limited(&tx, 16) <= 3);
        received.extend(decode_all(&mut rx));
    }
    let values: Vec<u8> = data_payloads(&received).iter().map(|p| p.data[0]).collect();
    assert_eq!(values, (0..8).collect::<Vec<u8>>());
}

/// Once the writer is gone, draining sends nothing and later enqueues are
/// dropped.
#[test]
fn test_closed_channel_is_a_no_op() {
    let pacer = FramePacer::new("gone", limits(16));
    let (tx, rx) = mpsc::channel(8);
    drop(rx);
    pacer.enqueue(chunks("x", 1, 2), "x");

    assert_eq!(pacer.drain_limited(&tx, 16), 0);
    assert!(pacer.is_closed());
    pacer.enqueue(chunks("y", 1, 2), "y");
    assert_eq!(pacer.pending(), 2);
}

/// Control frames echo the last tx and rx sequence without consuming one.
#[test]
fn test_control_frames_carry_current_sequence() {
    let pacer = FramePacer::new("ctl", limits(16));
    let (tx, mut rx) = mpsc::channel(8);
    pacer.set_rx_seq(0x42);
    pacer.enqueue(chunks("x", 1, 2), "x");
    pacer.drain_limited(&tx, 16);
    let data = decode_all(&mut rx);
    let last_tx = data.last().unwrap().tx_seq;
    assert!(data.iter().all(|f| f.rx_seq == 0x42));

    let ack = pacer.control_frame(FrameKind::Ack, &[]).unwrap();
    let mut dec = FrameDecoder::new();
    dec.push(&ack);
    let ack = dec.next_frame().unwrap().unwrap();
    assert_eq!(ack.kind, FrameKind::Ack);
    assert_eq!(ack.tx_seq, last_tx);
    assert_eq!(ack.rx_seq, 0x42);

    pacer.enqueue(chunks("y", 1, 1), "y");
    pacer.drain_limited(&tx, 16);
    assert_eq!(decode_all(&mut rx)[0].tx_seq, wire::next_seq(last_tx));
}
