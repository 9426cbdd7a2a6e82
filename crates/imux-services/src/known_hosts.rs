//! Known hosts — remote address → trusted link fingerprint.
//!
//! One line per host, `<addr> <fingerprint>`. Lines starting with `#` and
//! blank lines are ignored. Every change rewrites the whole file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    Known,
    Unknown,
    /// The host is on file with a different fingerprint.
    Mismatch { stored: String },
}

pub struct KnownHosts {
    path: PathBuf,
    hosts: BTreeMap<String, String>,
}

impl KnownHosts {
    /// Load the file at `path`. A missing file is an empty host list.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let mut hosts = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((addr, fp)) if !fp.trim().is_empty() => {
                    hosts.insert(addr.to_string(), fp.trim().to_string());
                }
                _ => {
                    tracing::warn!(path = %path.display(), line = n + 1, "skipping malformed known-hosts line");
                }
            }
        }
        Ok(Self { path, hosts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(&self, addr: &str, fingerprint: &str) -> HostStatus {
        match self.hosts.get(addr) {
            None => HostStatus::Unknown,
            Some(stored) if stored == fingerprint => HostStatus::Known,
            Some(stored) => HostStatus::Mismatch {
                stored: stored.clone(),
            },
        }
    }

    /// Record (or replace) the fingerprint of `addr` and write the file.
    pub fn save(&mut self, addr: &str, fingerprint: &str) -> std::io::Result<()> {
        self.hosts.insert(addr.to_string(), fingerprint.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for (addr, fp) in &self.hosts {
            out.push_str(addr);
            out.push(' ');
            out.push_str(fp);
            out.push('\n');
        }
        std::fs::write(&self.path, out)?;
        tracing::info!(addr, path = %self.path.display(), "saved host fingerprint");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
