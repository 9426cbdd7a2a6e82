//! Destinations: what a SocketID resolves to on the server.
//!
//! The SocketID string doubles as the address of the destination:
//!
//!   put:<offset>:<name>   write a file into the session directory
//!   get:<name>            a file streamed back to the client
//!   anything else         a tunneled connection to the forward address

use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Parsed form of a SocketID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketTarget {
    Put { offset: u64, name: String },
    Get { name: String },
    Tunnel(String),
}

impl SocketTarget {
    pub fn parse(socket_id: &str) -> Self {
        if let Some(rest) = socket_id.strip_prefix("put:") {
            if let Some((offset, name)) = rest.split_once(':') {
                if let Ok(offset) = offset.parse() {
                    return Self::Put {
                        offset,
                        name: name.to_string(),
                    };
                }
            }
        }
        if let Some(name) = socket_id.strip_prefix("get:") {
            return Self::Get {
                name: name.to_string(),
            };
        }
        Self::Tunnel(socket_id.to_string())
    }
}

impl fmt::Display for SocketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Put { offset, name } => write!(f, "put:{offset}:{name}"),
            Self::Get { name } => write!(f, "get:{name}"),
            Self::Tunnel(id) => f.write_str(id),
        }
    }
}

/// A dialed destination. `reader` is present when the destination produces
/// bytes that must flow back to the client.
pub struct Destination {
    pub reader: Option<BoxReader>,
    pub writer: BoxWriter,
}

/// Opens the destination behind a SocketID.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, session_id: &str, socket_id: &str) -> std::io::Result<Destination>;
}

/// Dials a fixed TCP address for every socket.
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, _session_id: &str, _socket_id: &str) -> std::io::Result<Destination> {
        let stream = tokio::net::TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Destination {
            reader: Some(Box::new(read)),
            writer: Box::new(write),
        })
    }
}

/// Resolve a client-supplied file name inside `root`.
///
/// Only plain relative names are allowed; `..`, absolute paths and prefixes
/// are rejected so a client cannot escape its directory.
pub fn resolve_within(root: &Path, name: &str) -> std::io::Result<PathBuf> {
    let candidate = Path::new(name);
    let clean = candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if name.is_empty() || !clean {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing path {name:?}"),
        ));
    }
    Ok(root.join(candidate))
}

/// Open `path` for an upload that starts at `offset`.
///
/// Offset 0 creates or truncates. A non-zero offset continues a partial file:
/// anything past `offset` is cut off and writing resumes there.
pub async fn open_upload(path: &Path, offset: u64) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if offset == 0 {
        return tokio::fs::File::create(path).await;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn socket_ids_parse_by_prefix() {
        assert_eq!(
            SocketTarget::parse("put:42:dir/a.bin"),
            SocketTarget::Put {
                offset: 42,
                name: "dir/a.bin".into()
            }
        );
        assert_eq!(
            SocketTarget::parse("get:a:b"),
            SocketTarget::Get { name: "a:b".into() }
        );
        assert_eq!(
            SocketTarget::parse("put:x:a"),
            SocketTarget::Tunnel("put:x:a".into())
        );
        let id = "7f1c";
        assert_eq!(SocketTarget::parse(id).to_string(), id);
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/srv/imux");
        assert_eq!(
            resolve_within(root, "a/b.txt").unwrap(),
            PathBuf::from("/srv/imux/a/b.txt")
        );
        assert!(resolve_within(root, "../etc/passwd").is_err());
        assert!(resolve_within(root, "/etc/passwd").is_err());
        assert!(resolve_within(root, "").is_err());
    }

    #[tokio::test]
    async fn upload_resumes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");

        let mut f = open_upload(&path, 0).await.unwrap();
        f.write_all(b"hello, garbage").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let mut f = open_upload(&path, 7).await.unwrap();
        f.write_all(b"world").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        assert_eq!(std::fs::read(&path).unwrap(), b"hello, world");
    }
}
