//! Per-session working directories and the daemon's destination dialer.
//!
//! Every session starts in the storage root. `cd` moves it around below the
//! root but never above it; file names from the client are resolved against
//! the session's current directory.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use imux_services::destination::{
    open_upload, resolve_within, Destination, Dialer, SocketTarget, TcpDialer,
};

pub struct Workspaces {
    root: PathBuf,
    /// Session → current directory, relative to `root`.
    cwd: DashMap<String, PathBuf>,
}

impl Workspaces {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cwd: DashMap::new(),
        }
    }

    /// Current directory of a session, relative to the root.
    pub fn relative(&self, session_id: &str) -> PathBuf {
        self.cwd
            .get(session_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn dir(&self, session_id: &str) -> PathBuf {
        self.root.join(self.relative(session_id))
    }

    /// Resolve a client-supplied file name in the session's directory.
    pub fn resolve(&self, session_id: &str, name: &str) -> io::Result<PathBuf> {
        resolve_within(&self.dir(session_id), name)
    }

    /// Change the session's directory. `..` is allowed down to the root and a
    /// leading `/` means the root itself.
    pub async fn cd(&self, session_id: &str, dir: &str) -> io::Result<PathBuf> {
        let mut next = self.relative(session_id);
        for component in Path::new(dir).components() {
            match component {
                Component::Normal(part) => next.push(part),
                Component::ParentDir => {
                    if !next.pop() {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "already at the top directory",
                        ));
                    }
                }
                Component::RootDir => next = PathBuf::new(),
                Component::CurDir | Component::Prefix(_) => {}
            }
        }

        let meta = tokio::fs::metadata(self.root.join(&next)).await?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{dir} is not a directory"),
            ));
        }
        self.cwd.insert(session_id.to_string(), next.clone());
        Ok(next)
    }

    pub fn forget(&self, session_id: &str) {
        self.cwd.remove(session_id);
    }
}

/// Dials `put:` sockets as files in the session directory and everything
/// else as a connection to the forward address.
pub struct DaemonDialer {
    workspaces: Arc<Workspaces>,
    forward: Option<TcpDialer>,
}

impl DaemonDialer {
    pub fn new(workspaces: Arc<Workspaces>, forward: Option<TcpDialer>) -> Self {
        Self {
            workspaces,
            forward,
        }
    }
}

#[async_trait]
impl Dialer for DaemonDialer {
    async fn dial(&self, session_id: &str, socket_id: &str) -> io::Result<Destination> {
        match SocketTarget::parse(socket_id) {
            SocketTarget::Put { offset, name } => {
                let path = self.workspaces.resolve(session_id, &name)?;
                let file = open_upload(&path, offset).await?;
                tracing::debug!(session_id, path = %path.display(), offset, "upload opened");
                Ok(Destination {
                    reader: None,
                    writer: Box::new(file),
                })
            }
            SocketTarget::Get { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "get sockets only flow toward the client",
            )),
            SocketTarget::Tunnel(_) => match &self.forward {
                Some(forward) => forward.dial(session_id, socket_id).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no forward address configured",
                )),
            },
        }
    }
}
