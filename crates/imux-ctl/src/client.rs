//! Session setup: control link, trust check, login and the transport pool.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dialoguer::{Input, Password};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use imux_core::config::NetworkSpec;
use imux_core::crypto::Keypair;
use imux_core::wire::{AuthRequest, WorkerReady};
use imux_core::{Command, LinkReader, LinkWriter, Response, SecureLink, WireMessage};
use imux_services::known_hosts::KnownHosts;
use imux_services::pool::{BuildProgress, LinkConnector, TransportPool};
use imux_services::progress::ProgressEvent;
use imux_services::reassembler::Reassembler;
use imux_services::{ImuxError, LinkId, LinkSender, next_link_id};

use crate::trust::verify_host;

pub type PoolSender = LinkSender<WriteHalf<TcpStream>>;
type Reader = LinkReader<ReadHalf<TcpStream>>;

const LOGIN_ATTEMPTS: usize = 3;

pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub networks: NetworkSpec,
    pub keypair: Keypair,
    pub known_hosts: KnownHosts,
    pub assume_yes: bool,
    pub reorder_limit: usize,
    /// Collect progress events from the reassembler.
    pub progress: bool,
}

/// One pool link, after the handshake and the worker-ready exchange.
pub struct PoolLink {
    id: LinkId,
    sender: Arc<PoolSender>,
    reader: Reader,
}

struct PoolConnector {
    server: SocketAddr,
    keypair: Arc<Keypair>,
    fingerprint: String,
    session_id: String,
}

#[async_trait]
impl LinkConnector for PoolConnector {
    type Link = PoolLink;

    async fn connect(&self, bind: IpAddr) -> imux_services::Result<PoolLink> {
        let socket = match bind {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(bind, 0))?;
        let stream = socket.connect(self.server).await?;
        stream.set_nodelay(true)?;

        let link = SecureLink::connect(stream, &self.keypair).await?;
        let got = link.remote_fingerprint();
        if got != self.fingerprint {
            return Err(ImuxError::UntrustedLink {
                expected: self.fingerprint.clone(),
                got,
            });
        }

        let (mut reader, writer) = link.split();
        let id = next_link_id();
        let sender = LinkSender::new(id, writer);
        sender
            .send(&WireMessage::WorkerReady(WorkerReady {
                nonce: self.session_id.clone(),
            }))
            .await?;
        match reader.recv().await? {
            WireMessage::Response(r) if r.ok => {}
            WireMessage::Response(r) => return Err(ImuxError::Refused(r.message)),
            other => {
                return Err(ImuxError::Refused(format!(
                    "expected a response, got {:?}",
                    other.kind()
                )));
            }
        }
        tracing::debug!(link_id = id, bind = %bind, "pool link ready");
        Ok(PoolLink {
            id,
            sender: Arc::new(sender),
            reader,
        })
    }
}

/// A logged-in session with its pool built.
pub struct Client {
    pub session_id: String,
    pub senders: Vec<Arc<PoolSender>>,
    pub reassembler: Arc<Reassembler>,
    pub events: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    control_tx: LinkWriter<WriteHalf<TcpStream>>,
    control_rx: Reader,
    readers: JoinSet<()>,
}

impl Client {
    pub async fn open(opts: ConnectOptions) -> Result<Self> {
        let ConnectOptions {
            host,
            port,
            user,
            networks,
            keypair,
            mut known_hosts,
            assume_yes,
            reorder_limit,
            progress,
        } = opts;

        let server = tokio::net::lookup_host((host.as_str(), port))
            .await
            .with_context(|| format!("failed to resolve {host}"))?
            .next()
            .with_context(|| format!("no address for {host}"))?;
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        stream.set_nodelay(true)?;

        let link = SecureLink::connect(stream, &keypair)
            .await
            .context("handshake failed")?;
        let fingerprint = link.remote_fingerprint();
        verify_host(&mut known_hosts, &format!("{host}:{port}"), &fingerprint, assume_yes)?;

        let (mut control_rx, mut control_tx) = link.split();
        let session_id = login(&mut control_tx, &mut control_rx, user).await?;
        tracing::info!(session_id = %session_id, "logged in");

        // ── Transport pool ──────────────────────────────────────────────────
        let connector = Arc::new(PoolConnector {
            server,
            keypair: Arc::new(keypair),
            fingerprint,
            session_id: session_id.clone(),
        });
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<BuildProgress>();
        let printer = tokio::spawn(async move {
            while let Some(p) = progress_rx.recv().await {
                eprint!("\r\x1b[2K{p}");
            }
            eprint!("\r\x1b[2K");
        });
        let pool = TransportPool::build(connector, &networks, Some(progress_tx)).await;
        let _ = printer.await;
        let pool = pool.context("failed to build the transport pool")?;
        println!(
            "{} in {}",
            pool.report,
            imux_services::progress::format_duration(pool.report.elapsed)
        );

        let (events_tx, events) = if progress {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let reassembler = Arc::new(Reassembler::new(reorder_limit, events_tx));

        let mut senders = Vec::with_capacity(pool.links.len());
        let mut readers = JoinSet::new();
        for link in pool.links {
            senders.push(link.sender);
            readers.spawn(pump(link.id, link.reader, reassembler.clone()));
        }

        Ok(Self {
            session_id,
            senders,
            reassembler,
            events,
            control_tx,
            control_rx,
            readers,
        })
    }

    /// Run one command on the control link and wait for its reply.
    pub async fn request(&mut self, cmd: Command) -> Result<Response> {
        self.control_tx
            .send(&WireMessage::Command(cmd))
            .await
            .context("control link failed")?;
        loop {
            match self.control_rx.recv().await.context("control link failed")? {
                WireMessage::Response(r) => return Ok(r),
                WireMessage::Chunk(chunk) => {
                    if let Err(e) = self.reassembler.deliver(chunk).await {
                        tracing::warn!(error = %e, "chunk on control link not delivered");
                    }
                }
                other => tracing::warn!(kind = ?other.kind(), "unexpected message on control link"),
            }
        }
    }

    /// Pool links whose reader is still running.
    pub fn live_links(&mut self) -> usize {
        while self.readers.try_join_next().is_some() {}
        self.readers.len()
    }

    /// End the session and close every link.
    pub async fn close(mut self) -> Result<()> {
        let reply = self
            .request(Command {
                command: "exit".into(),
                args: Vec::new(),
            })
            .await;
        for sender in &self.senders {
            let _ = sender.shutdown().await;
        }
        self.readers.shutdown().await;
        reply.map(|_| ())
    }
}

async fn login(
    tx: &mut LinkWriter<WriteHalf<TcpStream>>,
    rx: &mut Reader,
    user: Option<String>,
) -> Result<String> {
    let username = match user {
        Some(u) => u,
        None => Input::new().with_prompt("Username").interact_text()?,
    };
    let env_password = std::env::var("IMUX_PASSWORD").ok();

    for attempt in 1..=LOGIN_ATTEMPTS {
        let password = match &env_password {
            Some(p) => p.clone(),
            None => Password::new().with_prompt("Password").interact()?,
        };
        tx.send(&WireMessage::AuthRequest(AuthRequest {
            username: username.clone(),
            password,
        }))
        .await
        .context("failed to send login")?;

        match rx.recv().await.context("control link failed during login")? {
            WireMessage::Response(r) if r.ok => return Ok(r.message),
            WireMessage::Response(r) => {
                eprintln!("login failed: {} ({attempt}/{LOGIN_ATTEMPTS})", r.message);
                if env_password.is_some() {
                    break;
                }
            }
            other => bail!("unexpected {:?} during login", other.kind()),
        }
    }
    bail!("login failed for {username}")
}

/// Feed everything a pool link receives into the reassembler.
async fn pump(link_id: LinkId, mut reader: Reader, reassembler: Arc<Reassembler>) {
    loop {
        match reader.recv().await {
            Ok(WireMessage::Chunk(chunk)) => {
                if let Err(e) = reassembler.deliver(chunk).await {
                    tracing::warn!(link_id, error = %e, "chunk not delivered");
                }
            }
            Ok(other) => {
                tracing::debug!(link_id, kind = ?other.kind(), "ignoring message on pool link");
            }
            Err(e) if e.is_closed() => {
                tracing::info!(link_id, "pool link closed");
                return;
            }
            Err(e) => {
                tracing::warn!(link_id, error = %e, "pool link failed");
                return;
            }
        }
    }
}
