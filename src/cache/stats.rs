//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.
//! Counters are atomic so readers holding only a shared permit can record.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Subset of misses that found an expired entry
    pub expired_reads: u64,
    /// Number of successful puts, including overwrites
    pub puts: u64,
    /// Number of puts that replaced an existing entry
    pub overwrites: u64,
    /// Number of entries removed by delete
    pub deletes: u64,
    /// Number of entries evicted to make room for new keys
    pub evictions: u64,
    /// Number of expired entries reaped by sweeps
    pub expirations: u64,
    /// Current number of entries in the cache, expired ones included
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    expired_reads: AtomicU64,
    puts: AtomicU64,
    overwrites: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired_read(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.expired_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self, overwrite: bool) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        if overwrite {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_reads: self.expired_reads.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            overwrites: self.overwrites.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            total_entries,
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = StatsRecorder::default().snapshot(0);
        assert_eq!(stats, CacheStats::default());
    }

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let recorder = StatsRecorder::default();
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        assert_eq!(recorder.snapshot(0).hit_rate(), 0.75);
    }

    #[test]
    fn test_expired_reads_count_as_misses() {
        let recorder = StatsRecorder::default();
        recorder.record_expired_read();
        recorder.record_miss();

        let stats = recorder.snapshot(0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expired_reads, 1);
    }

    #[test]
    fn test_put_and_removal_counters() {
        let recorder = StatsRecorder::default();
        recorder.record_put(false);
        recorder.record_put(true);
        recorder.record_delete();
        recorder.record_eviction();
        recorder.record_expirations(3);

        let stats = recorder.snapshot(7);
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.overwrites, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.expirations, 3);
        assert_eq!(stats.total_entries, 7);
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(CacheStats::default()).unwrap();
        assert_eq!(json["hits"], 0);
        assert_eq!(json["total_entries"], 0);
    }
}
