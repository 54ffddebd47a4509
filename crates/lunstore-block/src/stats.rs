//! Per-LUN accounting
//!
//! Every completed command is counted once, by class and outcome, with its
//! bytes and its latency from admission to completion. Counters are relaxed
//! atomics; a [`StatsSnapshot`] is a consistent-enough copy for reporting.

use crate::command::IoClass;
use crate::error::Completion;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency buckets: bucket `i` holds samples below `2^(i+4)` µs
const BUCKETS: usize = 20;

/// Power-of-two latency histogram in microseconds
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    fn bucket_for(latency_us: u64) -> usize {
        let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
        bits.saturating_sub(4).min(BUCKETS - 1)
    }

    /// Upper bound of bucket `i`, in µs
    const fn bound(i: usize) -> u64 {
        1 << (i + 4)
    }

    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.buckets[Self::bucket_for(us)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_us(&self) -> u64 {
        match self.count() {
            0 => 0,
            n => self.sum_us.load(Ordering::Relaxed) / n,
        }
    }

    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Upper bucket bound at or below which `q` (0.0..=1.0) of samples fall
    pub fn quantile_us(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Self::bound(i);
            }
        }
        Self::bound(BUCKETS - 1)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one logical unit
#[derive(Debug, Default)]
pub struct LunStats {
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    deallocations: AtomicU64,
    others: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
    aborts: AtomicU64,
    miscompares: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl LunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one completed command.
    pub fn record(&self, class: IoClass, bytes: u64, latency: Duration, completion: &Completion) {
        match completion {
            Completion::Failed(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Aborted => {
                self.aborts.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Miscompare { .. } => {
                self.miscompares.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Ok | Completion::BlockStatus { .. } => {}
        }

        match class {
            IoClass::Read | IoClass::Compare => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                self.read_latency.record(latency);
            }
            IoClass::Write | IoClass::WriteSame | IoClass::WriteZeroes => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                self.write_latency.record(latency);
            }
            IoClass::Flush => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
            }
            IoClass::Unmap | IoClass::DatasetManagement => {
                self.deallocations.fetch_add(1, Ordering::Relaxed);
            }
            IoClass::GetBlockStatus | IoClass::Other => {
                self.others.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            reads: load(&self.reads),
            writes: load(&self.writes),
            flushes: load(&self.flushes),
            deallocations: load(&self.deallocations),
            others: load(&self.others),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            errors: load(&self.errors),
            aborts: load(&self.aborts),
            miscompares: load(&self.miscompares),
            read_latency: LatencySummary::of(&self.read_latency),
            write_latency: LatencySummary::of(&self.write_latency),
        }
    }
}

/// Latency figures in microseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub avg_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    fn of(histogram: &LatencyHistogram) -> Self {
        Self {
            avg_us: histogram.avg_us(),
            p50_us: histogram.quantile_us(0.50),
            p99_us: histogram.quantile_us(0.99),
            max_us: histogram.max_us(),
        }
    }
}

/// Point-in-time copy of [`LunStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub deallocations: u64,
    pub others: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub aborts: u64,
    pub miscompares: u64,
    pub read_latency: LatencySummary,
    pub write_latency: LatencySummary,
}
