//! Interactive session: `put`, `get`, `exit` and server commands.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use imux_core::Command;
use imux_services::destination::SocketTarget;
use imux_services::producer::{ChunkProducer, FileJob};
use imux_services::progress::{ProgressAggregator, ProgressEvent, format_bytes, summary};

use crate::client::Client;

pub struct ShellOptions {
    pub chunk_size: usize,
    pub resume: bool,
}

pub async fn run(mut client: Client, opts: ShellOptions) -> Result<()> {
    println!("session {} ready, {} link(s)", client.session_id, client.senders.len());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(b"imux> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(cmd) = Command::parse(&line) else {
            continue;
        };

        match cmd.command.as_str() {
            "put" => {
                if let Err(e) = put(&mut client, &cmd.args, &opts).await {
                    println!("put failed: {e:#}");
                }
            }
            "get" => {
                if let Err(e) = get(&mut client, &cmd.args).await {
                    println!("get failed: {e:#}");
                }
            }
            "exit" | "quit" => break,
            _ => {
                let reply = client.request(cmd).await?;
                if reply.ok {
                    if !reply.message.is_empty() {
                        println!("{}", reply.message);
                    }
                } else {
                    println!("error: {}", reply.message);
                }
            }
        }
        if client.live_links() == 0 {
            println!("all transport links are gone");
            break;
        }
    }

    client.close().await
}

async fn put(client: &mut Client, files: &[String], opts: &ShellOptions) -> Result<()> {
    if files.is_empty() {
        println!("usage: put <files...>");
        return Ok(());
    }

    let mut jobs = Vec::with_capacity(files.len());
    for file in files {
        let path = PathBuf::from(file);
        let name = local_name(&path)?;
        let offset = if opts.resume {
            remote_size(client, &name).await?
        } else {
            0
        };
        if offset > 0 {
            println!("resuming {name} at {}", format_bytes(offset));
        }
        jobs.push(FileJob { name, path, offset });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let producer = Arc::new(
        ChunkProducer::new(client.session_id.clone(), jobs, opts.chunk_size, Some(tx)).await?,
    );
    let agg = ProgressAggregator::new(producer.file_count().await, producer.total_bytes().await);

    let (_, outcome) = render(&mut rx, agg, false, producer.run(client.senders.clone())).await;
    match outcome {
        Some(Ok(report)) => println!("{}", summary(report.files, report.bytes, report.elapsed)),
        Some(Err(e)) => println!("transfer failed: {e}"),
        None => println!("interrupted"),
    }
    Ok(())
}

async fn get(client: &mut Client, files: &[String]) -> Result<()> {
    if files.is_empty() {
        println!("usage: get <files...>");
        return Ok(());
    }

    for name in files {
        let local = local_name(Path::new(name))?;
        let file = tokio::fs::File::create(&local)
            .await
            .with_context(|| format!("failed to create {local}"))?;
        let socket_id = SocketTarget::Get { name: name.clone() }.to_string();
        client.reassembler.register(socket_id, Box::new(file));
    }
    if let Some(events) = client.events.as_mut() {
        while events.try_recv().is_ok() {}
    }

    let reply = client
        .request(Command {
            command: "get".into(),
            args: files.to_vec(),
        })
        .await?;
    if !reply.ok {
        client.reassembler.abandon();
        println!("error: {}", reply.message);
        return Ok(());
    }

    // One "<size> <name>" line per file.
    let total: u64 = reply
        .message
        .lines()
        .filter_map(|l| l.split_once(' '))
        .filter_map(|(size, _)| size.parse::<u64>().ok())
        .sum();

    let started = Instant::now();
    let reassembler = client.reassembler.clone();
    let agg = ProgressAggregator::new(files.len(), total);
    let Some(events) = client.events.as_mut() else {
        reassembler.wait_idle().await;
        return Ok(());
    };
    let (agg, outcome) = render(events, agg, true, reassembler.wait_idle()).await;
    match outcome {
        Some(()) => println!(
            "{}",
            summary(agg.snapshot().files_done, agg.moved(), started.elapsed())
        ),
        None => {
            let dropped = reassembler.abandon();
            println!("interrupted, {} file(s) incomplete", dropped.len());
        }
    }
    Ok(())
}

/// Ask the server how much of `name` it already has.
async fn remote_size(client: &mut Client, name: &str) -> Result<u64> {
    let reply = client
        .request(Command {
            command: "stat".into(),
            args: vec![name.to_string()],
        })
        .await?;
    Ok(if reply.ok {
        reply.message.trim().parse().unwrap_or(0)
    } else {
        0
    })
}

fn local_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Draw the status line until `done` resolves. Returns `None` for the
/// outcome if the user interrupted.
///
/// `sample_speed` derives the pool speed from moved bytes, for transfers
/// whose events carry no per-link samples.
async fn render<F, T>(
    events: &mut mpsc::UnboundedReceiver<ProgressEvent>,
    mut agg: ProgressAggregator,
    sample_speed: bool,
    done: F,
) -> (ProgressAggregator, Option<T>)
where
    F: Future<Output = T>,
{
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_moved = 0;
    tokio::pin!(done);

    let outcome = loop {
        tokio::select! {
            out = &mut done => break Some(out),
            _ = tokio::signal::ctrl_c() => break None,
            Some(event) = events.recv() => {
                agg.apply(event);
                for name in agg.take_completed() {
                    eprint!("\r\x1b[2K");
                    println!("completed: {name}");
                }
            }
            _ = ticker.tick() => {
                if sample_speed {
                    let moved = agg.moved();
                    agg.apply(ProgressEvent::LinkSpeed {
                        worker: 0,
                        bytes_per_sec: moved - last_moved,
                    });
                    last_moved = moved;
                }
                eprint!("\r\x1b[2K{}", agg.snapshot());
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        agg.apply(event);
    }
    eprint!("\r\x1b[2K");
    for name in agg.take_completed() {
        println!("completed: {name}");
    }
    (agg, outcome)
}
