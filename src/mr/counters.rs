use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Job-wide diagnostic counters, shared by every worker
///
/// These only feed logging and the monitor service, they never affect the
/// final counts.
#[derive(Debug, Default)]
pub struct Counters {
    /// Every record seen, whatever its type
    records_fetched: AtomicU64,
    /// Every `(token, count)` pair handed over for combining
    records_collected: AtomicU64,
}

/// A point-in-time copy of the counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub records_fetched: u64,
    pub records_collected: u64,
}

impl Counters {
    pub fn add_fetched(&self, n: u64) {
        self.records_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_collected(&self, n: u64) {
        self.records_collected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            records_collected: self.records_collected.load(Ordering::Relaxed),
        }
    }
}
