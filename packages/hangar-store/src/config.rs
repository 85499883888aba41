//! Per-backend configuration.
//!
//! Plain structs with documented production defaults; tests override the
//! fields they care about. The shared `test_mode` flag is the teardown
//! guard: destructive wipes are refused unless it is set.

use std::path::PathBuf;

/// Configuration for [`CacheStore`](crate::CacheStore).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total cost budget in bytes (cost = encoded key + value length).
    pub max_bytes: u64,
    /// Estimated number of resident entries, used to size internal tables.
    pub estimated_items: usize,
    /// Fixed number of read workers for `get_many` fan-out.
    pub workers: usize,
    /// Bounded depth of each worker's job queue.
    pub queue_depth: usize,
    /// Enables `teardown()`.
    pub test_mode: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            estimated_items: 1_000_000,
            workers: 8,
            queue_depth: 64,
            test_mode: false,
        }
    }
}

/// Configuration for [`DurableStore`](crate::DurableStore).
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// Path of the database file.
    pub path: PathBuf,
    /// Fixed number of read workers for `get_many` fan-out.
    pub workers: usize,
    /// Bounded depth of each worker's job queue.
    pub queue_depth: usize,
    /// Enables `teardown()`.
    pub test_mode: bool,
}

impl DurableConfig {
    /// Config with production defaults for the given database file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workers: 8,
            queue_depth: 64,
            test_mode: false,
        }
    }
}

/// Configuration for [`MemStore`](crate::MemStore).
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Number of independent shards the key space is partitioned across.
    pub shards: usize,
    /// Interval between stats reporter ticks, in milliseconds.
    pub report_interval_ms: u64,
    /// Enables `teardown()`.
    pub test_mode: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            report_interval_ms: 10_000,
            test_mode: false,
        }
    }
}

/// Configuration for [`LayeredStore`](crate::LayeredStore).
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// Maximum key groups accumulated into one fill batch.
    pub fill_batch_size: usize,
    /// How long the fill consumer waits for a batch to fill up before
    /// flushing it anyway. This is also the store's staleness bound.
    pub fill_timeout_ms: u64,
    /// Fill queue capacity as a multiple of `fill_batch_size`. When the
    /// queue is full, producers block rather than drop requests.
    pub fill_queue_factor: usize,
}

impl Default for LayeredConfig {
    fn default() -> Self {
        Self {
            fill_batch_size: 128,
            fill_timeout_ms: 10,
            fill_queue_factor: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cache = CacheConfig::default();
        assert!(cache.max_bytes > 0);
        assert!(cache.workers > 0);
        assert!(!cache.test_mode);

        let layered = LayeredConfig::default();
        assert!(layered.fill_batch_size > 0);
        assert!(layered.fill_queue_factor > 0);
    }

    #[test]
    fn durable_config_carries_path() {
        let cfg = DurableConfig::new("/tmp/hangar.redb");
        assert_eq!(cfg.path, PathBuf::from("/tmp/hangar.redb"));
        assert!(!cfg.test_mode);
    }
}
