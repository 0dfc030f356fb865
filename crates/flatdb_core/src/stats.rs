//! Per-table operation counters and timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free operation counters for one table.
///
/// Counters are updated with relaxed ordering; a snapshot is a
/// statistical view, not a transactionally consistent one.
#[derive(Debug, Default)]
pub struct TableStats {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    selects: AtomicU64,
    flushes: AtomicU64,
    bytes_written: AtomicU64,
    insert_nanos: AtomicU64,
    update_nanos: AtomicU64,
    delete_nanos: AtomicU64,
    select_nanos: AtomicU64,
    flush_nanos: AtomicU64,
}

impl TableStats {
    /// Creates zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an insert batch of `rows` rows.
    pub fn record_insert(&self, rows: u64, elapsed: Duration) {
        self.inserts.fetch_add(rows, Ordering::Relaxed);
        self.insert_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records an update batch of `rows` rows.
    pub fn record_update(&self, rows: u64, elapsed: Duration) {
        self.updates.fetch_add(rows, Ordering::Relaxed);
        self.update_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records a delete batch of `rows` rows.
    pub fn record_delete(&self, rows: u64, elapsed: Duration) {
        self.deletes.fetch_add(rows, Ordering::Relaxed);
        self.delete_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records one select.
    pub fn record_select(&self, elapsed: Duration) {
        self.selects.fetch_add(1, Ordering::Relaxed);
        self.select_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Records one flush of `bytes` bytes.
    pub fn record_flush(&self, bytes: u64, elapsed: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.flush_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Returns a plain copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> TableStatsSnapshot {
        TableStatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            selects: self.selects.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            insert_time: Duration::from_nanos(self.insert_nanos.load(Ordering::Relaxed)),
            update_time: Duration::from_nanos(self.update_nanos.load(Ordering::Relaxed)),
            delete_time: Duration::from_nanos(self.delete_nanos.load(Ordering::Relaxed)),
            select_time: Duration::from_nanos(self.select_nanos.load(Ordering::Relaxed)),
            flush_time: Duration::from_nanos(self.flush_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a table's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatsSnapshot {
    /// Rows inserted.
    pub inserts: u64,
    /// Rows updated.
    pub updates: u64,
    /// Rows deleted.
    pub deletes: u64,
    /// Select operations served.
    pub selects: u64,
    /// Image flushes performed.
    pub flushes: u64,
    /// Total bytes written across flushes.
    pub bytes_written: u64,
    /// Cumulative time spent in inserts.
    pub insert_time: Duration,
    /// Cumulative time spent in updates.
    pub update_time: Duration,
    /// Cumulative time spent in deletes.
    pub delete_time: Duration,
    /// Cumulative time spent in selects.
    pub select_time: Duration,
    /// Cumulative time spent flushing.
    pub flush_time: Duration,
}
