//! Return path: a chunk a failing link had picked is delivered by another
//! link, exactly once.

use crate::*;

use bytes::Bytes;
use imux_services::reassembler::Reassembler;
use imux_services::{ChunkSequencer, ResponseFanout};
use tokio::sync::Notify;

/// Takes a chunk, holds it until released, then fails.
struct StallingSink {
    id: LinkId,
    picked: Notify,
    release: Notify,
}

impl StallingSink {
    fn new(id: LinkId) -> Arc<Self> {
        Arc::new(Self {
            id,
            picked: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ChunkSink for StallingSink {
    fn link_id(&self) -> LinkId {
        self.id
    }

    async fn send_chunk(&self, _chunk: &Chunk) -> Result<()> {
        self.picked.notify_one();
        self.release.notified().await;
        Err(ImuxError::WriteFailure("broken pipe".into()))
    }
}

async fn wait_for(sink: &CollectSink, n: usize) {
    tokio::time::timeout(WAIT, async {
        while sink.chunks().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("chunks never arrived");
}

fn fanout() -> ResponseFanout {
    ResponseFanout::new("sess", Arc::new(ChunkSequencer::new()))
}

fn chunk(seq: u64) -> Chunk {
    Chunk::new("sess", "get:f", seq, Bytes::from(format!("chunk-{seq}")))
}

#[tokio::test]
async fn failed_write_is_redelivered_once_by_the_other_link() {
    let fanout = fanout();
    let stalling = StallingSink::new(1);
    fanout.register_link(stalling.clone());
    fanout.publish(chunk(0)).unwrap();

    tokio::time::timeout(WAIT, stalling.picked.notified())
        .await
        .expect("first link never picked the chunk");

    let healthy = CollectSink::new(2);
    fanout.register_link(healthy.clone());
    stalling.release.notify_one();
    wait_for(&healthy, 1).await;

    fanout.publish(chunk(1)).unwrap();
    fanout.publish(chunk(2)).unwrap();
    wait_for(&healthy, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let seqs: Vec<u64> = healthy.chunks().iter().map(|c| c.sequence_id).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(fanout.serving_links(), vec![2]);
    assert_eq!(fanout.queued(), 0);
}

#[tokio::test]
async fn chunk_waits_for_a_link_when_the_last_one_fails() {
    let fanout = fanout();
    let stalling = StallingSink::new(1);
    fanout.register_link(stalling.clone());
    fanout.publish(chunk(0)).unwrap();
    tokio::time::timeout(WAIT, stalling.picked.notified())
        .await
        .unwrap();
    stalling.release.notify_one();

    tokio::time::timeout(WAIT, async {
        while fanout.writer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(fanout.queued(), 1);

    let late = CollectSink::new(2);
    fanout.register_link(late.clone());
    wait_for(&late, 1).await;
    assert_eq!(late.chunks(), vec![chunk(0)]);
}

#[tokio::test]
async fn stream_survives_a_dead_link_and_reassembles() {
    let fanout = fanout();
    let a = CollectSink::new(1);
    let b = CollectSink::new(2);
    fanout.register_link(Arc::new(DeadSink(3)));
    fanout.register_link(a.clone());
    fanout.register_link(b.clone());

    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let reader = Box::new(std::io::Cursor::new(body.clone()));
    fanout
        .spawn_reader("get:f".into(), reader, Arc::new(AtomicUsize::new(0)))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while !a.chunks().iter().chain(b.chunks().iter()).any(|c| c.is_fin()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("end of stream never delivered");

    // The client side sees both links' traffic in arbitrary order.
    let mut arrivals: Vec<Chunk> = a.chunks();
    arrivals.extend(b.chunks());
    arrivals.reverse();

    let (near, far) = tokio::io::duplex(1 << 20);
    let reassembler = Reassembler::new(1024, None);
    reassembler.register("get:f", Box::new(near));
    for c in arrivals {
        reassembler.deliver(c).await.unwrap();
    }
    assert_eq!(read_to_end(far).await, body);
}
