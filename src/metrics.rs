//! Metrics collection for the caching proxy
//!
//! Thread-safe counters using atomic operations. They track connections,
//! requests, cache hits/misses and how cache downloads ended.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every connection worker
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    // Connection statistics
    connections_accepted: AtomicU64,
    total_requests: AtomicU64,

    // Cache statistics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    duplicate_downloads: AtomicU64,

    // Download outcomes
    downloads_completed: AtomicU64,
    downloads_suspended: AtomicU64,
    downloads_discarded: AtomicU64,

    // Byte statistics
    bytes_from_cache: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub total_requests: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub duplicate_downloads: u64,

    pub downloads_completed: u64,
    pub downloads_suspended: u64,
    pub downloads_discarded: u64,

    pub bytes_from_cache: u64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served from a cache file of `bytes` length
    pub fn record_cache_hit(&self, bytes: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a request that had to go upstream
    ///
    /// # Arguments
    /// * `duplicate` - Whether another connection was already downloading it
    pub fn record_cache_miss(&self, duplicate: bool) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.duplicate_downloads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_download_completed(&self) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_suspended(&self) {
        self.downloads_suspended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_discarded(&self) {
        self.downloads_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Each counter is read independently, so the snapshot is not
    /// guaranteed to be consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            duplicate_downloads: self.duplicate_downloads.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_suspended: self.downloads_suspended.load(Ordering::Relaxed),
            downloads_discarded: self.downloads_discarded.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Calculate cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}
