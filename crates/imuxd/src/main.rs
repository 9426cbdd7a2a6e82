//! imuxd — imux server daemon.
//!
//! Accepts transport links, routes inbound chunks to their destinations and
//! fans responses back out over each session's serving links.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use imux_core::config::ImuxConfig;
use imux_core::crypto::Keypair;
use imux_services::destination::TcpDialer;
use imux_services::{DestinationRouter, SessionRegistry};

mod auth;
mod commands;
mod listener;
mod workspace;

use auth::ConfigAuthenticator;
use listener::{Daemon, LinkListener};
use workspace::{DaemonDialer, Workspaces};

#[derive(Parser)]
#[command(name = "imuxd", about = "imux server daemon")]
struct Args {
    /// Config file. Defaults to $IMUX_CONFIG, then ~/.config/imux/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override `server.listen_addr`.
    #[arg(long)]
    listen: Option<String>,
    /// Override `server.forward_addr`.
    #[arg(long)]
    forward: Option<String>,
    /// Print the `password_blake3` value for PASSWORD and exit.
    #[arg(long, value_name = "PASSWORD")]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Some(password) = args.hash_password {
        println!("{}", auth::password_digest(&password));
        return Ok(());
    }

    // Load config
    let mut config = match &args.config {
        Some(path) => ImuxConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            if let Err(e) = ImuxConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            ImuxConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                ImuxConfig::default()
            })
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(forward) = args.forward {
        config.server.forward_addr = forward;
    }
    let server = config.server.clone();

    // Keypair
    let keypair = Keypair::load_or_generate(&server.keypair_path)
        .with_context(|| format!("failed to load keypair {}", server.keypair_path.display()))?;
    tracing::info!(fingerprint = %keypair.fingerprint(), "keypair ready");

    // Storage
    std::fs::create_dir_all(&server.storage_path).with_context(|| {
        format!("failed to create storage path {}", server.storage_path.display())
    })?;
    tracing::info!(path = %server.storage_path.display(), "file storage path");

    let forward = if server.forward_addr.is_empty() {
        tracing::info!("no forward address, tunneling disabled");
        None
    } else {
        let addr: SocketAddr = server
            .forward_addr
            .parse()
            .with_context(|| format!("bad forward address {:?}", server.forward_addr))?;
        tracing::info!(forward = %addr, "tunneled sockets forward here");
        Some(TcpDialer::new(addr))
    };

    let auth = ConfigAuthenticator::new(&config.users);
    if auth.is_empty() {
        tracing::warn!("no users configured, every login will fail");
    }

    // Shared state
    let workspaces = Arc::new(Workspaces::new(server.storage_path.clone()));
    let registry = SessionRegistry::new(server.default_chunk_size);
    {
        let workspaces = workspaces.clone();
        registry.on_evict(move |session_id| workspaces.forget(session_id));
    }
    let dialer = Arc::new(DaemonDialer::new(workspaces.clone(), forward));
    let router = Arc::new(DestinationRouter::new(
        registry.clone(),
        dialer,
        server.reorder_limit,
    ));
    let daemon = Arc::new(Daemon {
        keypair,
        registry: registry.clone(),
        router: router.clone(),
        workspaces,
        auth: Arc::new(auth),
        auth_failure_delay: Duration::from_secs(server.auth_failure_delay_secs),
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener = TcpListener::bind(&server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", server.listen_addr))?;
    tracing::info!(addr = %server.listen_addr, "accepting transport links");

    let listener_task =
        tokio::spawn(LinkListener::new(listener, daemon, shutdown_tx.subscribe()).run());

    let session_printer = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(count = registry.len(), "session table snapshot");
                for s in registry.snapshot() {
                    tracing::debug!(
                        session_id = %s.session_id,
                        links = s.links.len(),
                        open_sockets = s.open_sockets,
                        queued = s.queued_chunks,
                        "  session"
                    );
                }
            }
        })
    };

    // Status HTTP endpoint
    if server.api_port != 0 {
        let state = imux_api::ApiState {
            registry: registry.clone(),
            router: router.clone(),
            listen_addr: server.listen_addr.clone(),
            started_at: std::time::Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = server.api_port;
        tokio::spawn(async move {
            if let Err(e) = imux_api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = listener_task       => tracing::error!("link listener exited: {:?}", r),
        r = session_printer     => tracing::error!("session printer exited: {:?}", r),
    }

    Ok(())
}
