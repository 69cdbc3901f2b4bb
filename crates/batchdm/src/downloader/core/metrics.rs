//! Transfer statistics
//!
//! Atomic counters updated by the engine and the scheduler, readable at any
//! time through [`DownloadMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one scheduler
#[derive(Debug, Default)]
pub struct DownloadMetrics {
    pub transfers_started: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub transfers_cancelled: AtomicU64,
    pub retries_attempted: AtomicU64,
    pub resumed: AtomicU64,
    pub restarted: AtomicU64,
    pub hash_mismatches: AtomicU64,
    pub already_present: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl DownloadMetrics {
    pub fn record_started(&self) {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.transfers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resumed(&self) {
        self.resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restarted(&self) {
        self.restarted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hash_mismatch(&self) {
        self.hash_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Destination was already present and valid
    pub fn record_already_present(&self) {
        self.already_present.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> DownloadMetricsSnapshot {
        DownloadMetricsSnapshot {
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_cancelled: self.transfers_cancelled.load(Ordering::Relaxed),
            retries_attempted: self.retries_attempted.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            restarted: self.restarted.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),
            already_present: self.already_present.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DownloadMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadMetricsSnapshot {
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_cancelled: u64,
    pub retries_attempted: u64,
    pub resumed: u64,
    pub restarted: u64,
    pub hash_mismatches: u64,
    pub already_present: u64,
    pub bytes_received: u64,
}

impl DownloadMetricsSnapshot {
    /// Completed share of finished transfers (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        let finished = self.transfers_completed + self.transfers_failed;
        if finished == 0 {
            0.0
        } else {
            self.transfers_completed as f64 / finished as f64
        }
    }
}
