//! Progress aggregation — per-link throughput samples and per-file
//! completion merged into one status projection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Latest throughput sample of one worker.
    LinkSpeed { worker: usize, bytes_per_sec: u64 },
    /// Bytes that completed since the previous event.
    Moved(u64),
    FileCompleted { name: String },
}

/// Byte counter owned by one worker and drained by the sampler.
#[derive(Debug, Default)]
pub struct WorkerMeter {
    bytes: AtomicU64,
}

impl WorkerMeter {
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn take(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Sample every meter once per `period` until the receiver goes away or the
/// returned handle is aborted.
pub fn spawn_sampler(
    meters: Vec<Arc<WorkerMeter>>,
    period: Duration,
    events: mpsc::UnboundedSender<ProgressEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if flush_meters(&meters, period, &events).is_err() {
                return;
            }
        }
    })
}

/// Emit one round of samples. Also used for the final partial interval.
pub fn flush_meters(
    meters: &[Arc<WorkerMeter>],
    period: Duration,
    events: &mpsc::UnboundedSender<ProgressEvent>,
) -> Result<(), mpsc::error::SendError<ProgressEvent>> {
    let secs = period.as_secs_f64().max(0.001);
    let mut moved = 0;
    for (worker, meter) in meters.iter().enumerate() {
        let bytes = meter.take();
        moved += bytes;
        events.send(ProgressEvent::LinkSpeed {
            worker,
            bytes_per_sec: (bytes as f64 / secs) as u64,
        })?;
    }
    if moved > 0 {
        events.send(ProgressEvent::Moved(moved))?;
    }
    Ok(())
}

// ── Aggregator ────────────────────────────────────────────────────────────────

pub struct ProgressAggregator {
    files: usize,
    total_bytes: u64,
    moved: u64,
    speeds: BTreeMap<usize, u64>,
    files_done: usize,
    completed: Vec<String>,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub files: usize,
    pub files_done: usize,
    pub total_bytes: u64,
    pub moved: u64,
    pub bytes_per_sec: u64,
    pub percent: f64,
    pub eta: Option<Duration>,
}

impl ProgressAggregator {
    pub fn new(files: usize, total_bytes: u64) -> Self {
        Self {
            files,
            total_bytes,
            moved: 0,
            speeds: BTreeMap::new(),
            files_done: 0,
            completed: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::LinkSpeed {
                worker,
                bytes_per_sec,
            } => {
                self.speeds.insert(worker, bytes_per_sec);
            }
            ProgressEvent::Moved(n) => self.moved += n,
            ProgressEvent::FileCompleted { name } => {
                self.files_done += 1;
                self.completed.push(name);
            }
        }
    }

    /// Files completed since the last call, in completion order.
    pub fn take_completed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.completed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn moved(&self) -> u64 {
        self.moved
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let speed: u64 = self.speeds.values().sum();
        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            (self.moved as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        };
        let remaining = self.total_bytes.saturating_sub(self.moved);
        let eta = (speed > 0).then(|| Duration::from_secs(remaining / speed));
        ProgressSnapshot {
            files: self.files,
            files_done: self.files_done,
            total_bytes: self.total_bytes,
            moved: self.moved,
            bytes_per_sec: speed,
            percent,
            eta,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eta = self
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "transferring {} files ({}) at {}/s {:.2}% complete {} remaining",
            self.files,
            format_bytes(self.total_bytes),
            format_bytes(self.bytes_per_sec),
            self.percent,
            eta
        )
    }
}

/// Summary line printed once a transfer finishes.
pub fn summary(files: usize, bytes: u64, elapsed: Duration) -> String {
    format!(
        "{} file(s) ({}) transferred in {}",
        files,
        format_bytes(bytes),
        format_duration(elapsed)
    )
}

/// `1536` → `1.5 KiB`.
pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// `3725s` → `1h2m5s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else if secs > 0 {
        format!("{s}s")
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn snapshot_sums_link_speeds_and_estimates() {
        let mut agg = ProgressAggregator::new(2, 4096);
        agg.apply(ProgressEvent::LinkSpeed {
            worker: 0,
            bytes_per_sec: 512,
        });
        agg.apply(ProgressEvent::LinkSpeed {
            worker: 1,
            bytes_per_sec: 512,
        });
        // A newer sample replaces the worker's previous one.
        agg.apply(ProgressEvent::LinkSpeed {
            worker: 1,
            bytes_per_sec: 512,
        });
        agg.apply(ProgressEvent::Moved(1024));

        let snap = agg.snapshot();
        assert_eq!(snap.bytes_per_sec, 1024);
        assert_eq!(snap.percent, 25.0);
        assert_eq!(snap.eta, Some(Duration::from_secs(3)));
        assert_eq!(
            snap.to_string(),
            "transferring 2 files (4.0 KiB) at 1.0 KiB/s 25.00% complete 3s remaining"
        );
    }

    #[test]
    fn completed_files_are_reported_once() {
        let mut agg = ProgressAggregator::new(1, 10);
        agg.apply(ProgressEvent::FileCompleted { name: "a".into() });
        assert_eq!(agg.take_completed(), vec!["a".to_string()]);
        assert!(agg.take_completed().is_empty());
    }

    #[test]
    fn summary_line() {
        assert_eq!(
            summary(3, 2048, Duration::from_secs(2)),
            "3 file(s) (2.0 KiB) transferred in 2s"
        );
    }

    #[tokio::test]
    async fn flush_emits_speed_per_worker_and_moved_total() {
        let meters = vec![Arc::new(WorkerMeter::default()), Arc::new(WorkerMeter::default())];
        meters[0].add(100);
        meters[1].add(300);
        let (tx, mut rx) = mpsc::unbounded_channel();
        flush_meters(&meters, Duration::from_secs(1), &tx).unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                ProgressEvent::LinkSpeed {
                    worker: 0,
                    bytes_per_sec: 100
                },
                ProgressEvent::LinkSpeed {
                    worker: 1,
                    bytes_per_sec: 300
                },
                ProgressEvent::Moved(400),
            ]
        );
    }
}
