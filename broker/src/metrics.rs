//! Ingestion counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestMetrics {
    /// Messages accepted into the queue.
    pub enqueued: u64,
    /// Messages applied without error.
    pub processed: u64,
    /// Messages abandoned with an error.
    pub failed: u64,
    /// Messages whose handler panicked.
    pub panicked: u64,
    /// Messages dropped because the worker had already stopped.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct IngestCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
}

impl IngestCounters {
    pub fn on_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestMetrics {
        IngestMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
