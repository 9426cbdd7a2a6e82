//! Forward path: resequencing at the destination and one dial per socket.

use crate::*;

use bytes::Bytes;
use imux_services::{DestinationRouter, SessionRegistry};

fn chunk(seq: u64, data: &'static [u8]) -> Chunk {
    Chunk::new("sess", "tunnel-1", seq, Bytes::from_static(data))
}

#[tokio::test]
async fn out_of_order_chunks_reach_the_destination_in_order() {
    let dialer = PipeDialer::new();
    let router = DestinationRouter::new(SessionRegistry::new(1024), dialer.clone(), 64);
    let link: Arc<dyn ChunkSink> = CollectSink::new(1);

    router.route(chunk(0, b"zero "), link.clone()).await.unwrap();
    router.route(chunk(2, b"two"), link.clone()).await.unwrap();
    router.route(chunk(1, b"one "), link.clone()).await.unwrap();
    router.route(Chunk::fin("sess", "tunnel-1", 3), link).await.unwrap();

    let got = read_to_end(dialer.far_end("tunnel-1")).await;
    assert_eq!(got, b"zero one two");
}

#[tokio::test]
async fn chunks_spread_over_links_are_written_once_in_order() {
    let dialer = PipeDialer::new();
    let registry = SessionRegistry::new(1024);
    let router = DestinationRouter::new(registry.clone(), dialer.clone(), 64);
    let links: Vec<Arc<dyn ChunkSink>> = (1..=3)
        .map(|id| CollectSink::new(id) as Arc<dyn ChunkSink>)
        .collect();

    // Reverse order, round-robin over three links.
    let pieces: Vec<u64> = (0..30).rev().collect();
    for (i, seq) in pieces.iter().enumerate() {
        let payload = Bytes::from(format!("{seq:02},"));
        let c = Chunk::new("sess", "tunnel-2", *seq, payload);
        router.route(c, links[i % 3].clone()).await.unwrap();
    }
    router
        .route(Chunk::fin("sess", "tunnel-2", 30), links[0].clone())
        .await
        .unwrap();

    let got = String::from_utf8(read_to_end(dialer.far_end("tunnel-2")).await).unwrap();
    let expected: String = (0..30).map(|n| format!("{n:02},")).collect();
    assert_eq!(got, expected);

    // Every link that delivered forward traffic now serves the return path.
    let session = registry.get("sess").unwrap();
    assert_eq!(session.fanout.serving_links(), vec![1, 2, 3]);
}

#[tokio::test]
async fn concurrent_first_arrivals_dial_once() {
    let dialer = PipeDialer::slow(Duration::from_millis(50));
    let router = Arc::new(DestinationRouter::new(
        SessionRegistry::new(1024),
        dialer.clone(),
        64,
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for seq in 0..16u64 {
        let router = router.clone();
        tasks.spawn(async move {
            let link: Arc<dyn ChunkSink> = CollectSink::new(seq + 1);
            let c = Chunk::new("sess", "tunnel-3", seq, Bytes::from(vec![b'a' + seq as u8]));
            router.route(c, link).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(router.socket_count(), 1);

    let link: Arc<dyn ChunkSink> = CollectSink::new(99);
    router
        .route(Chunk::fin("sess", "tunnel-3", 16), link)
        .await
        .unwrap();
    let got = read_to_end(dialer.far_end("tunnel-3")).await;
    assert_eq!(got, b"abcdefghijklmnop");
}

#[tokio::test]
async fn sockets_of_one_session_are_independent() {
    let dialer = PipeDialer::new();
    let router = DestinationRouter::new(SessionRegistry::new(1024), dialer.clone(), 64);
    let link: Arc<dyn ChunkSink> = CollectSink::new(1);

    for (socket, data) in [("a", b"A1"), ("b", b"B1")] {
        router
            .route(Chunk::new("sess", socket, 1, Bytes::from_static(data)), link.clone())
            .await
            .unwrap();
    }
    // Socket b completes while a still waits for its first chunk.
    router
        .route(Chunk::new("sess", "b", 0, Bytes::from_static(b"B0")), link.clone())
        .await
        .unwrap();
    router.route(Chunk::fin("sess", "b", 2), link.clone()).await.unwrap();
    assert_eq!(read_to_end(dialer.far_end("b")).await, b"B0B1");

    router
        .route(Chunk::new("sess", "a", 0, Bytes::from_static(b"A0")), link.clone())
        .await
        .unwrap();
    router.route(Chunk::fin("sess", "a", 2), link).await.unwrap();
    assert_eq!(read_to_end(dialer.far_end("a")).await, b"A0A1");
    assert_eq!(dialer.dial_count(), 2);
}
