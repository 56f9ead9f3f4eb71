// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::btree::BPlusTreeConfig;
use crate::commitlog::CommitLogConfig;
use crate::compression::CompressionType;
use crate::manager::PartitionManager;
use crate::path::absolute_path;
use std::path::{Path, PathBuf};

const DEFAULT_DATA_FOLDER: &str = ".horizondb.data";

/// Storage engine configuration builder. This is the in-process
/// surface callers build programmatically; there is no config-file
/// loader.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root data directory.
    pub path: PathBuf,

    /// Width, in timestamp units, of a partition's range when one is
    /// created on first write to a time range not yet covered.
    pub partition_width: i64,

    /// Target uncompressed size a mem-series block seals at.
    pub target_block_size: usize,

    /// Slab allocator capacity backing one mem-series.
    pub slab_size: usize,

    /// A mem-series rotates once it holds this many sealed blocks.
    pub max_sealed_blocks: usize,

    /// Compression applied to sealed blocks.
    pub compression: CompressionType,

    /// Commit-log batching and replay tuning.
    pub commit_log: CommitLogConfig,

    /// Partition catalogue (B⁺-tree) page tuning.
    pub btree: BPlusTreeConfig,

    /// Total mem-series bytes above which new writes block until a
    /// flush brings usage back down.
    pub memory_soft_cap: usize,

    /// Total mem-series bytes above which new writes are rejected with
    /// [`crate::error::Error::OutOfMemory`] instead of blocking.
    pub memory_hard_cap: usize,

    /// Maximum number of partitions kept open at once; least-recently-used
    /// partitions with nothing pending flush are evicted beyond this.
    pub partition_cache_capacity: usize,

    /// Number of background threads draining the flush queue.
    pub flush_worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: absolute_path(Path::new(DEFAULT_DATA_FOLDER)),
            partition_width: 24 * 60 * 60 * 1_000,
            target_block_size: 4_096,
            slab_size: 1_024 * 1_024,
            max_sealed_blocks: 64,
            compression: CompressionType::None,
            commit_log: CommitLogConfig::default(),
            btree: BPlusTreeConfig::default(),
            memory_soft_cap: 256 * 1_024 * 1_024,
            memory_hard_cap: 512 * 1_024 * 1_024,
            partition_cache_capacity: 256,
            flush_worker_count: 2,
        }
    }
}

impl Config {
    /// Initializes a new config rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: absolute_path(path.as_ref()),
            ..Default::default()
        }
    }

    /// Sets the range width new partitions are created with.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not positive.
    #[must_use]
    pub fn partition_width(mut self, width: i64) -> Self {
        assert!(width > 0, "partition width must be positive");
        self.partition_width = width;
        self
    }

    /// Sets the target size a mem-series block seals at.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn target_block_size(mut self, size: usize) -> Self {
        assert!(size > 0, "target block size must be non-zero");
        self.target_block_size = size;
        self
    }

    /// Sets the slab allocator capacity backing one mem-series.
    ///
    /// # Panics
    ///
    /// Panics if `size` is smaller than `target_block_size`.
    #[must_use]
    pub fn slab_size(mut self, size: usize) -> Self {
        assert!(size >= self.target_block_size, "slab size must fit at least one target-sized block");
        self.slab_size = size;
        self
    }

    /// Sets how many sealed blocks a mem-series accumulates before rotation.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn max_sealed_blocks(mut self, count: usize) -> Self {
        assert!(count > 0, "max sealed blocks must be non-zero");
        self.max_sealed_blocks = count;
        self
    }

    /// Sets the block compression method.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets commit-log batching and replay tuning.
    #[must_use]
    pub fn commit_log(mut self, config: CommitLogConfig) -> Self {
        self.commit_log = config;
        self
    }

    /// Sets the partition catalogue's page tuning.
    #[must_use]
    pub fn btree(mut self, config: BPlusTreeConfig) -> Self {
        self.btree = config;
        self
    }

    /// Sets the soft and hard mem-series memory caps.
    ///
    /// # Panics
    ///
    /// Panics if `soft` is greater than `hard`.
    #[must_use]
    pub fn memory_caps(mut self, soft: usize, hard: usize) -> Self {
        assert!(soft <= hard, "soft cap must not exceed hard cap");
        self.memory_soft_cap = soft;
        self.memory_hard_cap = hard;
        self
    }

    /// Sets the open-partition cache capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn partition_cache_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "partition cache capacity must be non-zero");
        self.partition_cache_capacity = capacity;
        self
    }

    /// Sets the number of background flush worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn flush_worker_count(mut self, count: usize) -> Self {
        assert!(count > 0, "flush worker count must be non-zero");
        self.flush_worker_count = count;
        self
    }

    /// Opens the storage engine, replaying the commit log and restoring
    /// the partition catalogue.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be opened, the
    /// catalogue or commit log are corrupt, or replay fails under a
    /// strict [`crate::commitlog::ReplayPolicy`].
    pub fn open(self) -> crate::error::Result<PartitionManager> {
        PartitionManager::open(self)
    }
}
