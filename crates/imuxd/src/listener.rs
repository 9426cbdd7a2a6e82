//! Transport link listener.
//!
//! Every accepted TCP connection completes the Noise handshake and then
//! serves one of two roles: the control link of a login, or a pool link that
//! joined a session with `WorkerReady`. Chunks are accepted on either, but
//! only for the session the link joined; a link that has joined nothing
//! cannot route at all.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use imux_core::crypto::Keypair;
use imux_core::{LinkReader, Response, SecureLink, WireMessage};
use imux_services::{
    next_link_id, ChunkSink, DestinationRouter, LinkId, LinkSender, Session, SessionRegistry,
};

use crate::auth::Authenticator;
use crate::commands::{self, After};
use crate::workspace::Workspaces;

/// Everything a link task needs, shared by all of them.
pub struct Daemon {
    pub keypair: Keypair,
    pub registry: SessionRegistry,
    pub router: Arc<DestinationRouter>,
    pub workspaces: Arc<Workspaces>,
    pub auth: Arc<dyn Authenticator>,
    pub auth_failure_delay: Duration,
}

impl Daemon {
    /// Tear a session down on request. Eviction hooks clear the router and
    /// workspace state.
    pub fn close_session(&self, session_id: &str) {
        self.registry.teardown(session_id);
    }
}

pub struct LinkListener {
    listener: TcpListener,
    daemon: Arc<Daemon>,
    shutdown: broadcast::Receiver<()>,
}

impl LinkListener {
    pub fn new(listener: TcpListener, daemon: Arc<Daemon>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            listener,
            daemon,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("link listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
                    }
                    let daemon = self.daemon.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_link(daemon, stream, peer.to_string()).await {
                            tracing::warn!(peer = %peer, error = %format!("{e:#}"), "link ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Run one transport link to completion.
pub async fn serve_link<S>(daemon: Arc<Daemon>, stream: S, peer: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link = SecureLink::accept(stream, &daemon.keypair)
        .await
        .context("handshake failed")?;
    let link_id = next_link_id();
    tracing::info!(
        link_id,
        peer = %peer,
        fingerprint = %link.remote_fingerprint(),
        "link established"
    );

    let (reader, writer) = link.split();
    let sender = Arc::new(LinkSender::new(link_id, writer));

    let result = LinkTask {
        daemon: daemon.clone(),
        link_id,
        sender,
        control: None,
        joined: None,
    }
    .run(reader)
    .await;

    let evicted = daemon.registry.detach_link(link_id);
    tracing::info!(link_id, evicted = evicted.len(), "link closed");
    result
}

struct LinkTask<W> {
    daemon: Arc<Daemon>,
    link_id: LinkId,
    sender: Arc<LinkSender<W>>,
    /// Session this link logged in to, if it is a control link.
    control: Option<Arc<Session>>,
    /// Session whose chunks this link may carry, set by login or
    /// `WorkerReady`.
    joined: Option<String>,
}

impl<W> LinkTask<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run<R: AsyncRead + Unpin>(mut self, mut reader: LinkReader<R>) -> Result<()> {
        loop {
            let msg = match reader.recv().await {
                Ok(msg) => msg,
                Err(e) if e.is_closed() => return Ok(()),
                Err(e) => return Err(e).context("link read failed"),
            };

            match msg {
                WireMessage::Chunk(chunk) => match self.joined.as_deref() {
                    Some(joined) if joined == chunk.session_id => {
                        let sink: Arc<dyn ChunkSink> = self.sender.clone();
                        if let Err(e) = self.daemon.router.route(chunk, sink).await {
                            tracing::debug!(link_id = self.link_id, error = %e, "chunk not routed");
                        }
                    }
                    joined => {
                        tracing::warn!(
                            link_id = self.link_id,
                            session_id = %chunk.session_id,
                            socket_id = %chunk.socket_id,
                            joined = ?joined,
                            "chunk outside the link's session, dropping"
                        );
                    }
                },
                WireMessage::AuthRequest(req) => {
                    let response = self.login(&req.username, &req.password).await;
                    self.reply(response).await?;
                }
                WireMessage::WorkerReady(ready) => {
                    let response = match self.daemon.registry.get(&ready.nonce) {
                        Some(session) => {
                            let sink: Arc<dyn ChunkSink> = self.sender.clone();
                            self.daemon.registry.attach_serving_link(&session, sink);
                            self.joined = Some(session.id.clone());
                            tracing::info!(link_id = self.link_id, session_id = %session.id, "pool link joined");
                            Response::ok(session.id.clone())
                        }
                        None => {
                            tracing::warn!(link_id = self.link_id, "worker ready for unknown session");
                            Response::failed("unknown session")
                        }
                    };
                    self.reply(response).await?;
                }
                WireMessage::Command(cmd) => {
                    let Some(session) = self.control.clone() else {
                        self.reply(Response::failed("not logged in")).await?;
                        continue;
                    };
                    let (response, after) = commands::execute(&self.daemon, &session, &cmd).await;
                    self.reply(response).await?;
                    if after == After::Close {
                        let _ = self.sender.shutdown().await;
                        return Ok(());
                    }
                }
                WireMessage::Response(_) => {
                    tracing::warn!(link_id = self.link_id, "unexpected response from client");
                }
            }
        }
    }

    async fn login(&mut self, username: &str, password: &str) -> Response {
        if !self.daemon.auth.authenticate(username, password).await {
            tracing::warn!(link_id = self.link_id, username, "login failed");
            tokio::time::sleep(self.daemon.auth_failure_delay).await;
            return Response::failed("login failed");
        }

        let session = self.daemon.registry.open();
        self.daemon.registry.bind_link(&session, self.link_id);
        tracing::info!(link_id = self.link_id, username, session_id = %session.id, "logged in");
        let response = Response::ok(session.id.clone());
        self.joined = Some(session.id.clone());
        self.control = Some(session);
        response
    }

    async fn reply(&self, response: Response) -> Result<()> {
        self.sender
            .send(&WireMessage::Response(response))
            .await
            .context("failed to send response")
    }
}
