//! `tunnel --listen`: carry local TCP connections over the pool.
//!
//! Each accepted connection becomes its own SocketID. Its bytes go up through
//! an upstream fanout shared by every pool link; the server dials its forward
//! address for the socket and the replies come back through the reassembler.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use imux_services::{ChunkSequencer, ChunkSink, ResponseFanout};

use crate::client::Client;

pub async fn run(client: Client, listen: &str, chunk_size: usize) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let sequencer = Arc::new(ChunkSequencer::new());
    let fanout = ResponseFanout::upstream(client.session_id.clone(), sequencer.clone());
    for sender in &client.senders {
        let sink: Arc<dyn ChunkSink> = sender.clone();
        fanout.register_link(sink);
    }
    let chunk_size = Arc::new(AtomicUsize::new(chunk_size));
    println!(
        "forwarding {listen} through {} link(s), ctrl-c to stop",
        client.senders.len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if fanout.writer_count() == 0 {
                    tracing::error!(peer = %peer, "no transport links left, refusing connection");
                    break;
                }
                let _ = stream.set_nodelay(true);
                let socket_id = format!("tcp-{}", uuid::Uuid::new_v4());
                let (read, write) = stream.into_split();
                client.reassembler.register(socket_id.clone(), Box::new(write));
                let reader = fanout.spawn_reader(socket_id.clone(), Box::new(read), chunk_size.clone());
                tracing::info!(peer = %peer, socket_id = %socket_id, "tunnel opened");

                let sequencer = sequencer.clone();
                let session_id = client.session_id.clone();
                tokio::spawn(async move {
                    let _ = reader.await;
                    sequencer.forget(&session_id, &socket_id);
                    tracing::debug!(socket_id = %socket_id, "local side finished");
                });
            }
        }
    }

    fanout.close();
    client.close().await
}
