//! Real secure links over loopback TCP: a client splits one socket's stream
//! across two links, the server routes it to a destination that answers, and
//! the answer comes back over both links to be reassembled.

use crate::*;

use bytes::Bytes;
use imux_core::crypto::Keypair;
use imux_core::link::SEGMENT_PLAINTEXT;
use imux_core::{SecureLink, WireMessage};
use imux_services::reassembler::Reassembler;
use imux_services::{next_link_id, DestinationRouter, LinkSender, SessionRegistry};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Destination that reads its input to EOF and answers with it reversed.
struct ReverseDialer;

#[async_trait]
impl Dialer for ReverseDialer {
    async fn dial(&self, _session_id: &str, _socket_id: &str) -> std::io::Result<Destination> {
        let (near, mut far) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let mut input = Vec::new();
            far.read_to_end(&mut input).await?;
            input.reverse();
            far.write_all(&input).await?;
            far.shutdown().await
        });
        let (read, write) = tokio::io::split(near);
        Ok(Destination {
            reader: Some(Box::new(read)),
            writer: Box::new(write),
        })
    }
}

/// Accept `links` secure links and route their chunks until each closes.
async fn serve(listener: TcpListener, keys: Arc<Keypair>, links: usize) -> Arc<DestinationRouter> {
    let router = Arc::new(DestinationRouter::new(
        SessionRegistry::new(16 * 1024),
        Arc::new(ReverseDialer),
        1024,
    ));
    for _ in 0..links {
        let (stream, _) = listener.accept().await.unwrap();
        let link = SecureLink::accept(stream, &keys).await.unwrap();
        let (mut reader, writer) = link.split();
        let sender: Arc<dyn ChunkSink> = Arc::new(LinkSender::new(next_link_id(), writer));
        let router = router.clone();
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(WireMessage::Chunk(chunk)) => {
                        let _ = router.route(chunk, sender.clone()).await;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_closed() => break,
                    Err(e) => panic!("server link failed: {e}"),
                }
            }
        });
    }
    router
}

#[tokio::test]
async fn handshake_reports_the_server_fingerprint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_keys = Arc::new(Keypair::generate());
    let expected = server_keys.fingerprint();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        SecureLink::accept(stream, &server_keys).await.unwrap()
    });
    let client_keys = Keypair::generate();
    let stream = TcpStream::connect(addr).await.unwrap();
    let client = SecureLink::connect(stream, &client_keys).await.unwrap();
    let server = server.await.unwrap();

    assert_eq!(client.remote_fingerprint(), expected);
    assert_eq!(server.remote_fingerprint(), client_keys.fingerprint());
    assert_eq!(client.link_key(), server.link_key());
}

#[tokio::test]
async fn stream_split_over_two_links_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_keys = Arc::new(Keypair::generate());
    let server = tokio::spawn(serve(listener, server_keys, 2));

    let client_keys = Keypair::generate();
    let reassembler = Arc::new(Reassembler::new(1024, None));
    let (near, far) = tokio::io::duplex(1 << 20);
    reassembler.register("tunnel-e2e", Box::new(near));

    let mut senders = Vec::new();
    let mut pumps = Vec::new();
    for _ in 0..2 {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        let (mut reader, writer) = SecureLink::connect(stream, &client_keys)
            .await
            .unwrap()
            .split();
        senders.push(LinkSender::new(next_link_id(), writer));
        let reassembler = reassembler.clone();
        pumps.push(tokio::spawn(async move {
            while let Ok(WireMessage::Chunk(chunk)) = reader.recv().await {
                reassembler.deliver(chunk).await.unwrap();
            }
        }));
    }
    let router = server.await.unwrap();

    // One chunk spans several encrypted segments.
    let big = vec![7u8; SEGMENT_PLAINTEXT * 3 + 11];
    let pieces: Vec<Bytes> = vec![
        Bytes::from_static(b"head-"),
        Bytes::from(big.clone()),
        Bytes::from_static(b"-tail"),
    ];
    let mut input = Vec::new();
    for p in &pieces {
        input.extend_from_slice(p);
    }

    // Highest sequence first, alternating links.
    let fin = Chunk::fin("sess", "tunnel-e2e", pieces.len() as u64);
    senders[0].send_chunk(&fin).await.unwrap();
    for (seq, payload) in pieces.into_iter().enumerate().rev() {
        let chunk = Chunk::new("sess", "tunnel-e2e", seq as u64, payload);
        senders[seq % 2].send_chunk(&chunk).await.unwrap();
    }

    let mut expected = input;
    expected.reverse();
    assert_eq!(read_to_end(far).await, expected);
    assert_eq!(reassembler.open_sinks(), 0);
    // The finished socket stays known until its session is evicted.
    assert_eq!(router.socket_count(), 1);

    for sender in &senders {
        sender.shutdown().await.unwrap();
    }
    for pump in pumps {
        pump.abort();
    }
}
