//! Transport pool — dial N links in parallel and keep whichever succeed.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imux_core::config::NetworkSpec;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{ImuxError, Result};

/// Establishes one ready-to-use link from a local bind address.
///
/// "Ready" includes the handshake, the trust check and the worker-ready
/// exchange with the server.
#[async_trait]
pub trait LinkConnector: Send + Sync + 'static {
    type Link: Send + 'static;

    async fn connect(&self, bind: IpAddr) -> Result<Self::Link>;
}

/// Running tally, emitted every time a dial resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub built: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for BuildProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "built {}/{} transfer sockets, {} failed",
            self.built, self.total, self.failed
        )
    }
}

/// Final outcome of a pool build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub built: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} built, {} failed", self.built, self.total, self.failed)
    }
}

pub struct TransportPool<L> {
    pub links: Vec<L>,
    pub report: PoolReport,
}

impl<L: Send + 'static> TransportPool<L> {
    /// Dial every link `spec` asks for concurrently.
    ///
    /// Succeeds if at least one link was established. Individual failures
    /// are logged and counted, never fatal on their own.
    pub async fn build<C>(
        connector: Arc<C>,
        spec: &NetworkSpec,
        progress: Option<mpsc::UnboundedSender<BuildProgress>>,
    ) -> Result<Self>
    where
        C: LinkConnector<Link = L>,
    {
        let started = Instant::now();
        let total = spec.total();

        let mut dials = JoinSet::new();
        for entry in &spec.entries {
            for _ in 0..entry.count {
                let connector = connector.clone();
                let bind = entry.bind;
                dials.spawn(async move { (bind, connector.connect(bind).await) });
            }
        }

        let mut links = Vec::with_capacity(total);
        let mut failed = 0usize;
        while let Some(joined) = dials.join_next().await {
            match joined {
                Ok((_, Ok(link))) => links.push(link),
                Ok((bind, Err(e))) => {
                    failed += 1;
                    tracing::warn!(bind = %bind, error = %e, "transport link failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(error = %e, "transport link task panicked");
                }
            }
            if let Some(tx) = &progress {
                let _ = tx.send(BuildProgress {
                    built: links.len(),
                    failed,
                    total,
                });
            }
        }

        let report = PoolReport {
            built: links.len(),
            failed,
            total,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            built = report.built,
            failed = report.failed,
            total = report.total,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "transport pool built"
        );

        if links.is_empty() {
            return Err(ImuxError::AllLinksFailed { attempted: total });
        }
        Ok(Self { links, report })
    }
}
