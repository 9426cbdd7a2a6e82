//! Daemon status, session and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use imux_services::progress::format_bytes;

use super::http::{base_url, delete_json, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    listen_addr: String,
    uptime_secs: u64,
    sessions: usize,
    links: usize,
    serving_links: usize,
    open_sockets: usize,
    routed_sockets: usize,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionInfo>,
}

#[derive(Deserialize)]
struct SessionInfo {
    session_id: String,
    links: Vec<u64>,
    serving_links: Vec<u64>,
    max_chunk_size: usize,
    open_sockets: usize,
    bytes_in: u64,
    bytes_out: u64,
    queued_chunks: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct DropResponse {
    session_id: String,
    dropped: bool,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  imuxd Status");
    println!("═══════════════════════════════════════");
    println!("  Listening        : {}", resp.listen_addr);
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Active sessions  : {}", resp.sessions);
    println!("  Transport links  : {} ({} serving)", resp.links, resp.serving_links);
    println!("  Open sockets     : {} ({} routed)", resp.open_sockets, resp.routed_sockets);
    println!("  Received         : {}", format_bytes(resp.bytes_in));
    println!("  Sent             : {}", format_bytes(resp.bytes_out));
    Ok(())
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let resp: SessionsResponse = get_json(&format!("{}/sessions", base_url(port))).await?;

    if resp.sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    for s in &resp.sessions {
        print_session(s);
    }
    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let resp: SessionInfo =
        get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;
    print_session(&resp);
    Ok(())
}

pub async fn cmd_session_drop(port: u16, session_id: &str) -> Result<()> {
    let resp: DropResponse =
        delete_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    if resp.dropped {
        println!("✓ Session dropped: {}", resp.session_id);
    } else {
        println!("Session not found: {}", session_id);
    }
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

fn print_session(s: &SessionInfo) {
    println!("  ┌─ {}", s.session_id);
    println!("  │  links       : {:?}", s.links);
    println!("  │  serving     : {:?}", s.serving_links);
    println!("  │  chunk size  : {}", format_bytes(s.max_chunk_size as u64));
    println!("  │  sockets     : {}", s.open_sockets);
    println!("  │  in / out    : {} / {}", format_bytes(s.bytes_in), format_bytes(s.bytes_out));
    println!("  │  queued      : {}", s.queued_chunks);
    println!("  └─ uptime      : {}s", s.uptime_secs);
}
