//! Transport pool builds: partial failure is tolerated, total failure is not.

use crate::*;

use std::collections::HashSet;
use std::net::IpAddr;

use imux_core::config::NetworkSpec;
use imux_services::pool::{BuildProgress, LinkConnector, TransportPool};
use tokio::sync::mpsc;

/// Numbers its dials from zero and refuses the ones listed.
struct Scripted {
    next: AtomicUsize,
    refuse: HashSet<usize>,
    binds: Mutex<Vec<IpAddr>>,
}

impl Scripted {
    fn new(refuse: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicUsize::new(0),
            refuse: refuse.iter().copied().collect(),
            binds: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LinkConnector for Scripted {
    type Link = Arc<CollectSink>;

    async fn connect(&self, bind: IpAddr) -> Result<Self::Link> {
        self.binds.lock().unwrap().push(bind);
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if self.refuse.contains(&n) {
            return Err(ImuxError::Refused(format!("dial {n} refused")));
        }
        Ok(CollectSink::new(n as LinkId))
    }
}

#[tokio::test]
async fn two_of_five_failing_leaves_three_links() {
    let spec: NetworkSpec = "127.0.0.1:5".parse().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = TransportPool::build(Scripted::new(&[1, 3]), &spec, Some(tx))
        .await
        .unwrap();

    assert_eq!(pool.links.len(), 3);
    assert_eq!(pool.report.to_string(), "3/5 built, 2 failed");

    let mut last = None;
    while let Some(p) = rx.recv().await {
        last = Some(p);
    }
    assert_eq!(
        last,
        Some(BuildProgress {
            built: 3,
            failed: 2,
            total: 5
        })
    );
}

#[tokio::test]
async fn every_dial_failing_is_fatal() {
    let spec: NetworkSpec = "127.0.0.1:5".parse().unwrap();
    let err = TransportPool::build(Scripted::new(&[0, 1, 2, 3, 4]), &spec, None)
        .await
        .err()
        .expect("a pool with no links must not build");
    assert!(matches!(err, ImuxError::AllLinksFailed { attempted: 5 }));
}

#[tokio::test]
async fn links_are_spread_over_every_bind_address() {
    let spec: NetworkSpec = "127.0.0.1:2;127.0.0.2:3".parse().unwrap();
    let connector = Scripted::new(&[]);
    let pool = TransportPool::build(connector.clone(), &spec, None)
        .await
        .unwrap();
    assert_eq!(pool.links.len(), 5);

    let binds = connector.binds.lock().unwrap();
    let first: IpAddr = "127.0.0.1".parse().unwrap();
    let second: IpAddr = "127.0.0.2".parse().unwrap();
    assert_eq!(binds.iter().filter(|b| **b == first).count(), 2);
    assert_eq!(binds.iter().filter(|b| **b == second).count(), 3);
}
