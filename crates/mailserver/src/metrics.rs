//! Archive metrics
//!
//! [`ArchiveMetrics`] is an owned handle injected into the archive service, so
//! separate service instances never share counters.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds (inclusive, bytes) of the envelope size histogram buckets
pub const ENVELOPE_SIZE_BUCKETS: &[u64] = &[64, 256, 1024, 4096, 16384, 65536, 262144, 1048576];

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// Uses [`Ordering::Relaxed`]; values are statistics, not synchronization.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Fixed-bucket histogram; the last bucket catches everything above the
/// largest bound
pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        let index = self.bounds.partition_point(|bound| *bound < value);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum: self.sum(),
            count: self.count(),
        }
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("count", &self.count())
            .field("sum", &self.sum())
            .finish()
    }
}

/// Point-in-time copy of a histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds: Vec<u64>,
    /// One more entry than `bounds`: the overflow bucket
    pub buckets: Vec<u64>,
    pub sum: u64,
    pub count: u64,
}

/// Counters and histograms owned by an archive service
#[derive(Debug)]
pub struct ArchiveMetrics {
    /// Successful saves, duplicates included
    pub archived_envelopes: Counter,
    /// Failed saves
    pub archive_errors: Counter,
    /// Envelope bytes written (header overhead included), new rows only
    pub archived_bytes: Counter,
    /// Sizes of saved envelopes
    pub envelope_size: Histogram,
}

impl ArchiveMetrics {
    pub fn new() -> Self {
        Self {
            archived_envelopes: Counter::new(),
            archive_errors: Counter::new(),
            archived_bytes: Counter::new(),
            envelope_size: Histogram::new(ENVELOPE_SIZE_BUCKETS),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            archived_envelopes: self.archived_envelopes.get(),
            archive_errors: self.archive_errors.get(),
            archived_bytes: self.archived_bytes.get(),
            envelope_size: self.envelope_size.snapshot(),
        }
    }
}

impl Default for ArchiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`ArchiveMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub archived_envelopes: u64,
    pub archive_errors: u64,
    pub archived_bytes: u64,
    pub envelope_size: HistogramSnapshot,
}
