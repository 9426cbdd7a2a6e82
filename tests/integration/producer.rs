//! Upload path: every piece is sent exactly once however many workers race
//! for them, and the routed result matches the source file.

use crate::*;

use std::collections::HashSet;

use imux_services::producer::{ChunkProducer, FileJob};
use imux_services::{DestinationRouter, SessionRegistry};

const SIZE: usize = 10_000;
const CHUNK: usize = 1_000;

fn source() -> (tempfile::TempDir, std::path::PathBuf, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let body: Vec<u8> = (0..SIZE).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, &body).unwrap();
    (dir, path, body)
}

async fn upload(workers: usize) -> (Vec<Chunk>, Vec<u8>) {
    let (_dir, path, body) = source();
    let job = FileJob {
        name: "payload.bin".into(),
        path,
        offset: 0,
    };
    let producer = Arc::new(
        ChunkProducer::new("sess", vec![job], CHUNK, None)
            .await
            .unwrap(),
    );
    let sinks: Vec<Arc<CollectSink>> = (0..workers).map(|i| CollectSink::new(i as LinkId)).collect();

    let report = tokio::time::timeout(WAIT, producer.run(sinks.clone()))
        .await
        .expect("transfer hung")
        .unwrap();
    assert_eq!(report.files, 1);
    assert_eq!(report.bytes, SIZE as u64);

    let sent: Vec<Chunk> = sinks.iter().flat_map(|s| s.chunks()).collect();
    (sent, body)
}

fn assert_exactly_once(sent: &[Chunk]) {
    let pieces = SIZE / CHUNK + 1;
    assert_eq!(sent.len(), pieces);
    let ids: HashSet<u64> = sent.iter().map(|c| c.sequence_id).collect();
    assert_eq!(ids, (0..pieces as u64).collect());
    assert_eq!(sent.iter().map(|c| c.payload.len()).sum::<usize>(), SIZE);
    assert_eq!(sent.iter().filter(|c| c.is_fin()).count(), 1);
    assert!(sent.iter().all(|c| c.socket_id == "put:0:payload.bin"));
}

#[tokio::test]
async fn single_worker_sends_each_piece_once() {
    let (sent, _) = upload(1).await;
    assert_exactly_once(&sent);
    // One worker sends in production order.
    let seqs: Vec<u64> = sent.iter().map(|c| c.sequence_id).collect();
    assert_eq!(seqs, (0..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn more_workers_than_pieces_still_send_each_piece_once() {
    let (sent, _) = upload(32).await;
    assert_exactly_once(&sent);
}

#[tokio::test]
async fn routed_upload_reproduces_the_file() {
    let (mut sent, body) = upload(4).await;
    sent.reverse();

    let dialer = PipeDialer::new();
    let router = DestinationRouter::new(SessionRegistry::new(CHUNK), dialer.clone(), 64);
    let link: Arc<dyn ChunkSink> = CollectSink::new(1);
    for c in sent {
        router.route(c, link.clone()).await.unwrap();
    }
    assert_eq!(read_to_end(dialer.far_end("put:0:payload.bin")).await, body);
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn dead_links_do_not_lose_pieces() {
    let (_dir, path, _) = source();
    let job = FileJob {
        name: "payload.bin".into(),
        path,
        offset: 0,
    };
    let producer = Arc::new(
        ChunkProducer::new("sess", vec![job], CHUNK, None)
            .await
            .unwrap(),
    );
    let healthy = CollectSink::new(1);
    let sinks: Vec<Arc<dyn ChunkSink>> = vec![
        Arc::new(DeadSink(2)),
        healthy.clone(),
        Arc::new(DeadSink(3)),
    ];

    tokio::time::timeout(WAIT, producer.run(sinks))
        .await
        .expect("transfer hung")
        .unwrap();
    assert_exactly_once(&healthy.chunks());
}

#[tokio::test]
async fn resume_offset_skips_what_the_server_has() {
    let (_dir, path, body) = source();
    let job = FileJob {
        name: "payload.bin".into(),
        path,
        offset: 4_000,
    };
    let producer = Arc::new(
        ChunkProducer::new("sess", vec![job], CHUNK, None)
            .await
            .unwrap(),
    );
    let sink = CollectSink::new(1);
    let report = producer.run(vec![sink.clone()]).await.unwrap();
    assert_eq!(report.bytes, 6_000);

    let sent = sink.chunks();
    assert!(sent.iter().all(|c| c.socket_id == "put:4000:payload.bin"));
    let data: Vec<u8> = sent.iter().flat_map(|c| c.payload.to_vec()).collect();
    assert_eq!(data, &body[4_000..]);
}
