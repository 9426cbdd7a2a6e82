//! imux-ctl — client for imuxd: pooled transfers, tunnels and daemon status.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use imux_core::config::{ImuxConfig, NetworkSpec};
use imux_core::crypto::Keypair;
use imux_services::known_hosts::KnownHosts;

mod client;
mod cmd;
mod trust;

use client::{Client, ConnectOptions};

const DEFAULT_API_PORT: u16 = 9101;

#[derive(Parser)]
#[command(name = "imux-ctl", about = "Inverse-multiplexed transfers over many TCP links")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Open a session and run put/get and server commands interactively.
    Connect(ConnectArgs),
    /// Forward local TCP connections through the server.
    Tunnel {
        #[command(flatten)]
        conn: ConnectArgs,
        /// Local address to accept connections on, e.g. 127.0.0.1:2222.
        #[arg(long)]
        listen: String,
    },
    /// Show the local daemon's status.
    Status {
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        api_port: u16,
    },
    /// List the local daemon's sessions.
    Sessions {
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        api_port: u16,
    },
    /// Inspect or drop one session of the local daemon.
    Session {
        id: String,
        #[arg(long)]
        drop: bool,
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        api_port: u16,
    },
    /// Stop the local daemon.
    Shutdown {
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        api_port: u16,
    },
}

#[derive(Args)]
struct ConnectArgs {
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 4430)]
    port: u16,
    #[arg(long)]
    user: Option<String>,
    /// Pool layout, `<bind>:<count>[;<bind>:<count>...]`.
    #[arg(long)]
    networks: Option<String>,
    /// Continue partial uploads where the server copy ends.
    #[arg(long, overrides_with = "no_resume")]
    resume: bool,
    #[arg(long)]
    no_resume: bool,
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Trust unknown hosts without asking.
    #[arg(long, short = 'y')]
    yes: bool,
}

/// Connection settings after flags are layered over the config file.
struct Effective {
    options: ConnectOptions,
    chunk_size: usize,
    resume: bool,
}

fn resolve(args: ConnectArgs, config: &ImuxConfig, progress: bool) -> Result<Effective> {
    let client = &config.client;
    let networks: NetworkSpec = args
        .networks
        .as_deref()
        .unwrap_or(client.networks.as_str())
        .parse()?;
    let keypair = Keypair::load_or_generate(&client.keypair_path)
        .with_context(|| format!("failed to load keypair {}", client.keypair_path.display()))?;
    let known_hosts = KnownHosts::load(&client.known_hosts_path).with_context(|| {
        format!("failed to read {}", client.known_hosts_path.display())
    })?;

    let resume = if args.no_resume {
        false
    } else {
        args.resume || client.resume
    };
    Ok(Effective {
        options: ConnectOptions {
            host: args.host,
            port: args.port,
            user: args.user,
            networks,
            keypair,
            known_hosts,
            assume_yes: args.yes,
            reorder_limit: client.reorder_limit,
            progress,
        },
        chunk_size: args.chunk_size.unwrap_or(client.chunk_size),
        resume,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Connect(args) => {
            let config = ImuxConfig::load()?;
            let eff = resolve(args, &config, true)?;
            let client = Client::open(eff.options).await?;
            cmd::shell::run(
                client,
                cmd::shell::ShellOptions {
                    chunk_size: eff.chunk_size,
                    resume: eff.resume,
                },
            )
            .await
        }
        Cmd::Tunnel { conn, listen } => {
            let config = ImuxConfig::load()?;
            let eff = resolve(conn, &config, false)?;
            let client = Client::open(eff.options).await?;
            cmd::tunnel::run(client, &listen, eff.chunk_size).await
        }
        Cmd::Status { api_port } => cmd::status::cmd_status(api_port).await,
        Cmd::Sessions { api_port } => cmd::status::cmd_sessions(api_port).await,
        Cmd::Session { id, drop, api_port } => {
            if drop {
                cmd::status::cmd_session_drop(api_port, &id).await
            } else {
                cmd::status::cmd_session_inspect(api_port, &id).await
            }
        }
        Cmd::Shutdown { api_port } => cmd::status::cmd_shutdown(api_port).await,
    }
}
