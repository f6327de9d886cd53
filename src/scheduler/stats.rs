//! What the workers of a pool did with the jobs they fetched.
//!
//! Every fetched job ends in exactly one `Disposition`. Only `Acked` jobs are
//! gone from the broker; the rest come back after their retry period.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Final state of one fetched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler returned and the broker confirmed the ack.
    Acked,
    /// The handler returned but the ack did not reach the broker.
    AckFailed,
    /// The handler returned an error or panicked.
    Failed,
    /// The payload could not be decoded or names no registered task.
    Rejected,
}

impl Disposition {
    const ALL: [Disposition; 4] = [Self::Acked, Self::AckFailed, Self::Failed, Self::Rejected];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Snapshot of a pool's job counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// In-process workers in the pool.
    pub num_workers: usize,
    /// Workers holding a job right now.
    pub busy_workers: usize,
    pub acked: u64,
    pub ack_failures: u64,
    pub failed: u64,
    pub rejected: u64,
    /// Time spent handling jobs, summed over all workers.
    pub busy_time: Duration,
}

impl PoolStats {
    pub fn count(&self, disposition: Disposition) -> u64 {
        match disposition {
            Disposition::Acked => self.acked,
            Disposition::AckFailed => self.ack_failures,
            Disposition::Failed => self.failed,
            Disposition::Rejected => self.rejected,
        }
    }

    /// Jobs fetched and handled, whatever their outcome.
    pub fn handled(&self) -> u64 {
        Disposition::ALL.iter().map(|d| self.count(*d)).sum()
    }

    /// Jobs the broker will deliver again.
    pub fn unacknowledged(&self) -> u64 {
        self.handled() - self.acked
    }

    pub fn mean_handling_time(&self) -> Duration {
        match self.handled() {
            0 => Duration::ZERO,
            n => Duration::from_micros((self.busy_time.as_micros() / u128::from(n)) as u64),
        }
    }
}

/// Counters updated by workers on any thread.
#[derive(Debug, Default)]
pub struct SharedPoolStats {
    outcomes: [AtomicU64; 4],
    busy_micros: AtomicU64,
    busy_workers: AtomicUsize,
}

impl SharedPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a worker busy until the returned guard is dropped.
    pub fn begin_job(self: &Arc<Self>) -> BusyGuard {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn record(&self, disposition: Disposition, elapsed: Duration) {
        self.outcomes[disposition.slot()].fetch_add(1, Ordering::SeqCst);
        self.busy_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn snapshot(&self, num_workers: usize) -> PoolStats {
        let count = |d: Disposition| self.outcomes[d.slot()].load(Ordering::SeqCst);
        PoolStats {
            num_workers,
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
            acked: count(Disposition::Acked),
            ack_failures: count(Disposition::AckFailed),
            failed: count(Disposition::Failed),
            rejected: count(Disposition::Rejected),
            busy_time: Duration::from_micros(self.busy_micros.load(Ordering::SeqCst)),
        }
    }
}

/// Keeps a worker counted as busy.
#[derive(Debug)]
pub struct BusyGuard {
    stats: Arc<SharedPoolStats>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.stats.busy_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
