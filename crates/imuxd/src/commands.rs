//! Control commands a logged-in session can run.

use std::sync::Arc;

use imux_core::{Command, Response};
use imux_services::destination::SocketTarget;
use imux_services::Session;

use crate::listener::Daemon;

/// What the control link does after answering.
#[derive(Debug, PartialEq, Eq)]
pub enum After {
    Continue,
    Close,
}

pub async fn execute(daemon: &Daemon, session: &Arc<Session>, cmd: &Command) -> (Response, After) {
    tracing::debug!(session_id = %session.id, command = %cmd.command, args = ?cmd.args, "command");
    let response = match cmd.command.as_str() {
        "pwd" => pwd(daemon, session),
        "cd" => cd(daemon, session, &cmd.args).await,
        "ls" => ls(daemon, session, &cmd.args).await,
        "stat" => stat(daemon, session, &cmd.args).await,
        "get" => get(daemon, session, &cmd.args).await,
        "exit" => {
            daemon.close_session(&session.id);
            return (Response::ok("bye"), After::Close);
        }
        other => Response::failed(format!("unknown command: {other}")),
    };
    (response, After::Continue)
}

fn pwd(daemon: &Daemon, session: &Session) -> Response {
    Response::ok(format!("/{}", daemon.workspaces.relative(&session.id).display()))
}

async fn cd(daemon: &Daemon, session: &Session, args: &[String]) -> Response {
    let dir = args.first().map(String::as_str).unwrap_or("/");
    match daemon.workspaces.cd(&session.id, dir).await {
        Ok(now) => Response::ok(format!("/{}", now.display())),
        Err(e) => Response::failed(format!("cd {dir}: {e}")),
    }
}

async fn ls(daemon: &Daemon, session: &Session, args: &[String]) -> Response {
    let dir = match args.first() {
        Some(name) => match daemon.workspaces.resolve(&session.id, name) {
            Ok(path) => path,
            Err(e) => return Response::failed(format!("ls {name}: {e}")),
        },
        None => daemon.workspaces.dir(&session.id),
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => return Response::failed(format!("ls: {e}")),
    };
    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
            Ok(None) => break,
            Err(e) => return Response::failed(format!("ls: {e}")),
        }
    }
    names.sort();
    Response::ok(names.join("\n"))
}

/// Size in bytes of a file in the session directory. Used by resuming
/// uploads.
async fn stat(daemon: &Daemon, session: &Session, args: &[String]) -> Response {
    let Some(name) = args.first() else {
        return Response::failed("usage: stat <file>");
    };
    let meta = match daemon.workspaces.resolve(&session.id, name) {
        Ok(path) => tokio::fs::metadata(path).await,
        Err(e) => Err(e),
    };
    match meta {
        Ok(meta) if meta.is_file() => Response::ok(meta.len().to_string()),
        Ok(_) => Response::failed(format!("{name} is not a file")),
        Err(e) => Response::failed(format!("stat {name}: {e}")),
    }
}

/// Stream files back over the session's serving links.
///
/// All files are opened before anything is sent, so a missing file fails the
/// command as a whole.
async fn get(daemon: &Daemon, session: &Arc<Session>, args: &[String]) -> Response {
    if args.is_empty() {
        return Response::failed("usage: get <files...>");
    }

    let mut opened = Vec::with_capacity(args.len());
    for name in args {
        let file = match daemon.workspaces.resolve(&session.id, name) {
            Ok(path) => tokio::fs::File::open(path).await,
            Err(e) => Err(e),
        };
        match file {
            Ok(file) => {
                let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                opened.push((name.clone(), file, size));
            }
            Err(e) => return Response::failed(format!("get {name}: {e}")),
        }
    }

    let mut lines = Vec::with_capacity(opened.len());
    for (name, file, size) in opened {
        let socket_id = SocketTarget::Get { name: name.clone() }.to_string();
        session.socket_opened();
        let reader = session.fanout.spawn_reader(
            socket_id.clone(),
            Box::new(file),
            session.max_chunk_size.clone(),
        );

        let registry = daemon.registry.clone();
        let owner = session.clone();
        tokio::spawn(async move {
            if let Err(e) = reader.await {
                tracing::error!(socket_id = %socket_id, error = %e, "file reader panicked");
            }
            registry.socket_closed(&owner);
        });

        tracing::info!(session_id = %session.id, file = %name, size, "sending file");
        lines.push(format!("{size} {name}"));
    }
    Response::ok(lines.join("\n"))
}
