// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The partition manager / scheduler.
//!
//! Owns the bounded cache of live [`TimeSeriesPartition`]s, a flush
//! worker pool, and the [`MemoryTracker`] backpressure gate. This is
//! the storage engine's top-level entry point: [`Config::open`]
//! returns one.

use crate::btree::BPlusTree;
use crate::commitlog::CommitLog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::field::Record;
use crate::partition::{PartitionConfig, PartitionId, TimeSeriesPartition};
use crate::range::{Range, RangeSet};
use crate::stop_signal::StopSignal;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

fn partition_config(config: &Config) -> PartitionConfig {
    PartitionConfig {
        slab_size: config.slab_size,
        target_block_size: config.target_block_size,
        max_sealed_blocks: config.max_sealed_blocks,
        compression: config.compression,
    }
}

/// Filesystem layout: `<data>/<database>/<series>-<rangeLowerMillis>.ts`.
fn partition_file_path(data_dir: &Path, id: &PartitionId) -> PathBuf {
    data_dir.join(&id.database).join(format!("{}-{}.ts", id.series, id.range.lower))
}

/// Atomic counter plus a blocking gate between the soft and hard caps.
struct MemoryTracker {
    used: Mutex<usize>,
    not_full: Condvar,
    soft_cap: usize,
    hard_cap: usize,
}

impl MemoryTracker {
    fn new(soft_cap: usize, hard_cap: usize) -> Self {
        Self { used: Mutex::new(0), not_full: Condvar::new(), soft_cap, hard_cap }
    }

    /// Blocks while usage is between the soft and hard cap; fails fast
    /// once usage reaches the hard cap.
    fn admit(&self) -> Result<()> {
        let mut used = self.used.lock().expect("lock is poisoned");

        loop {
            if *used < self.soft_cap {
                return Ok(());
            }
            if *used >= self.hard_cap {
                return Err(Error::OutOfMemory);
            }
            used = self.not_full.wait(used).expect("lock is poisoned");
        }
    }

    fn set_used(&self, bytes: usize) {
        *self.used.lock().expect("lock is poisoned") = bytes;
        self.not_full.notify_all();
    }
}

/// Bounded LRU cache of open partitions; eviction skips any partition
/// with mem-series data not yet flushed to disk.
struct PartitionCache {
    capacity: usize,
    order: VecDeque<PartitionId>,
    entries: HashMap<PartitionId, Arc<TimeSeriesPartition>>,
}

impl PartitionCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), entries: HashMap::new() }
    }

    fn get(&mut self, id: &PartitionId) -> Option<Arc<TimeSeriesPartition>> {
        let partition = self.entries.get(id).cloned()?;

        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.clone());

        Some(partition)
    }

    fn insert(&mut self, id: PartitionId, partition: Arc<TimeSeriesPartition>) {
        self.entries.insert(id.clone(), partition);
        self.order.push_back(id);
        self.evict_excess();
    }

    fn evict_excess(&mut self) {
        while self.entries.len() > self.capacity {
            let evictable = self.order.iter().position(|id| {
                self.entries.get(id).is_some_and(|p| p.first_segment_containing_non_persisted_data().is_none())
            });

            match evictable {
                Some(idx) => {
                    #[allow(clippy::expect_used)]
                    let id = self.order.remove(idx).expect("index came from this deque");
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn ids(&self) -> impl Iterator<Item = &PartitionId> {
        self.entries.keys()
    }

    fn values(&self) -> impl Iterator<Item = &Arc<TimeSeriesPartition>> {
        self.entries.values()
    }
}

struct Inner {
    config: Config,
    commit_log: CommitLog,
    catalogue: BPlusTree,
    cache: Mutex<PartitionCache>,
    memory: MemoryTracker,
    queued_flushes: Mutex<HashSet<PartitionId>>,
    stop: StopSignal,
}

impl Inner {
    fn total_mem_usage(&self) -> usize {
        self.cache.lock().expect("lock is poisoned").values().map(|p| p.mem_usage()).sum()
    }

    fn persist_meta(&self, id: &PartitionId, partition: &TimeSeriesPartition) -> Result<()> {
        self.catalogue.insert(id.clone(), partition.meta())
    }

    fn get_or_load(&self, id: &PartitionId) -> Result<Arc<TimeSeriesPartition>> {
        if let Some(partition) = self.cache.lock().expect("lock is poisoned").get(id) {
            return Ok(partition);
        }

        let recovered = self.catalogue.get(id)?;
        let path = partition_file_path(&self.config.path, id);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let partition = Arc::new(TimeSeriesPartition::open(id.clone(), path, partition_config(&self.config), recovered.as_ref())?);

        if recovered.is_none() {
            self.persist_meta(id, &partition)?;
        }

        self.cache.lock().expect("lock is poisoned").insert(id.clone(), Arc::clone(&partition));

        Ok(partition)
    }
}

const FLUSH_RETRY_ATTEMPTS: u32 = 5;
const FLUSH_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// Runs one flush, retrying transient I/O failures with bounded
/// exponential backoff; a checksum mismatch or any other non-I/O error
/// is treated as non-transient and surfaced immediately.
fn flush_with_retry(inner: &Inner, id: &PartitionId, partition: &TimeSeriesPartition, force: bool) -> Result<()> {
    let mut attempt = 0;

    loop {
        match partition.flush(force).and_then(|()| inner.persist_meta(id, partition)) {
            Ok(()) => return Ok(()),
            Err(Error::Io(e)) if attempt < FLUSH_RETRY_ATTEMPTS => {
                attempt += 1;
                log::warn!("transient I/O error flushing partition {id:?} (attempt {attempt}): {e}");
                std::thread::sleep(FLUSH_RETRY_BASE_DELAY * 2u32.pow(attempt - 1));
            }
            Err(e) => return Err(e),
        }
    }
}

fn flush_worker(inner: Arc<Inner>, receiver: Receiver<PartitionId>) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(id) => {
                if let Some(partition) = inner.cache.lock().expect("lock is poisoned").get(&id) {
                    if let Err(e) = flush_with_retry(&inner, &id, &partition, false) {
                        log::error!("flush of partition {id:?} failed: {e}");
                    } else {
                        inner.memory.set_used(inner.total_mem_usage());
                    }
                }

                inner.queued_flushes.lock().expect("lock is poisoned").remove(&id);
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.stop.is_stopped() && receiver.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// The storage engine's top-level handle.
pub struct PartitionManager {
    inner: Arc<Inner>,
    flush_sender: Sender<PartitionId>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl PartitionManager {
    /// Opens the storage engine: replays the commit log into the
    /// partitions it touches, then starts the flush worker pool.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let commit_log_dir = config.path.join("commitlog");
        let catalogue = BPlusTree::open(&config.path, config.btree)?;

        let mut replayed: HashMap<PartitionId, Arc<TimeSeriesPartition>> = HashMap::new();

        CommitLog::replay(&commit_log_dir, &config.commit_log, |partition_id, records, position| {
            let partition = match replayed.get(&partition_id) {
                Some(p) => Arc::clone(p),
                None => {
                    let recovered = catalogue.get(&partition_id)?;
                    let path = partition_file_path(&config.path, &partition_id);

                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }

                    let partition = Arc::new(TimeSeriesPartition::open(
                        partition_id.clone(),
                        path,
                        partition_config(&config),
                        recovered.as_ref(),
                    )?);

                    replayed.insert(partition_id.clone(), Arc::clone(&partition));
                    partition
                }
            };

            partition.replay_write(&records, position)
        })?;

        let commit_log = CommitLog::open(&commit_log_dir, config.commit_log.clone())?;

        let mut cache = PartitionCache::new(config.partition_cache_capacity);
        for (id, partition) in replayed {
            cache.insert(id, partition);
        }

        let inner = Arc::new(Inner {
            memory: MemoryTracker::new(config.memory_soft_cap, config.memory_hard_cap),
            cache: Mutex::new(cache),
            queued_flushes: Mutex::new(HashSet::new()),
            stop: StopSignal::default(),
            catalogue,
            commit_log,
            config,
        });

        let (flush_sender, flush_receiver) = crossbeam_channel::unbounded();

        let workers = (0..inner.config.flush_worker_count)
            .map(|_| {
                let inner = Arc::clone(&inner);
                let receiver = flush_receiver.clone();
                std::thread::Builder::new()
                    .name("horizondb-flush-worker".into())
                    .spawn(move || flush_worker(inner, receiver))
                    .map_err(std::io::Error::from)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { inner, flush_sender, workers })
    }

    /// Appends `records` to the partition covering their timestamps,
    /// creating it on first write, blocking under memory pressure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the hard memory cap is
    /// reached, or propagates the partition's write error.
    pub fn write(&self, id: &PartitionId, records: &[Record]) -> Result<()> {
        self.inner.memory.admit()?;

        let partition = self.inner.get_or_load(id)?;
        partition.write(&self.inner.commit_log, records)?;

        self.inner.memory.set_used(self.inner.total_mem_usage());

        Ok(())
    }

    /// Reads records from one partition, merging file and mem-series
    /// state.
    pub fn read(&self, id: &PartitionId, range_set: &RangeSet, record_type_filter: Option<u32>) -> Result<Vec<Record>> {
        self.inner.get_or_load(id)?.read(range_set, record_type_filter)
    }

    /// Lists the partitions of `(database, series)` overlapping
    /// `range_set`, via the catalogue, without loading them into the
    /// cache.
    pub fn partitions_for(&self, database: &str, series: &str, range_set: &RangeSet) -> Result<Vec<PartitionId>> {
        let lower = PartitionId::new(database, series, Range::new(i64::MIN, i64::MIN));
        let upper = PartitionId::new(database, series, Range::new(i64::MAX, i64::MAX));

        Ok(self
            .inner
            .catalogue
            .range(&lower, &upper)?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| range_set.overlaps(&id.range))
            .collect())
    }

    /// Enqueues a flush of `id`; a partition already queued is a no-op
    /// until the pending flush completes.
    pub fn flush(&self, id: PartitionId) {
        let mut queued = self.inner.queued_flushes.lock().expect("lock is poisoned");

        if queued.insert(id.clone()) {
            let _ = self.flush_sender.send(id);
        }
    }

    /// Synchronously force-flushes every cached partition whose
    /// `firstNonFlushedSegment ≤ segment_id`, then deletes commit-log
    /// segments no longer referenced by any live partition.
    ///
    /// # Errors
    ///
    /// Returns the first flush or catalogue-persist error encountered;
    /// already-flushed partitions remain flushed.
    pub fn force_flush(&self, segment_id: u64) -> Result<()> {
        let ids: Vec<PartitionId> = self.inner.cache.lock().expect("lock is poisoned").ids().cloned().collect();

        for id in &ids {
            let Some(partition) = self.inner.cache.lock().expect("lock is poisoned").get(id) else { continue };

            if partition.first_segment_containing_non_persisted_data().is_some_and(|s| s <= segment_id) {
                flush_with_retry(&self.inner, id, &partition, true)?;
            }
        }

        self.reclaim_segments()
    }

    fn reclaim_segments(&self) -> Result<()> {
        let min_referenced = {
            let cache = self.inner.cache.lock().expect("lock is poisoned");
            cache.values().filter_map(|p| p.first_segment_containing_non_persisted_data()).min()
        };

        let boundary = min_referenced.unwrap_or_else(|| self.inner.commit_log.active_segment_id());
        self.inner.commit_log.delete_segments_before(boundary)?;

        Ok(())
    }
}

impl Drop for PartitionManager {
    fn drop(&mut self) {
        self.inner.stop.send();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Field, TimeUnit};
    use test_log::test;

    fn record(ts: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(value)])
    }

    #[test]
    fn write_creates_partition_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Config::new(dir.path()).flush_worker_count(1).open().unwrap();

        let id = PartitionId::new("db", "temps", Range::new(0, 1_000_000));
        manager.write(&id, &[record(5, 1), record(1, 2)]).unwrap();

        let result = manager.read(&id, &RangeSet::all(), None).unwrap();
        assert_eq!(vec![record(1, 2), record(5, 1)], result);
    }

    #[test]
    fn force_flush_persists_metadata_and_reclaims_segments() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Config::new(dir.path()).flush_worker_count(1).open().unwrap();

        let id = PartitionId::new("db", "temps", Range::new(0, 1_000_000));
        manager.write(&id, &[record(1, 1)]).unwrap();
        manager.force_flush(u64::MAX).unwrap();

        let partitions = manager.partitions_for("db", "temps", &RangeSet::all()).unwrap();
        assert_eq!(vec![id], partitions);
    }

    #[test]
    fn reopening_replays_unflushed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let id = PartitionId::new("db", "temps", Range::new(0, 1_000_000));

        {
            let manager = Config::new(dir.path()).flush_worker_count(1).open().unwrap();
            manager.write(&id, &[record(1, 1), record(2, 2)]).unwrap();
        }

        let manager = Config::new(dir.path()).flush_worker_count(1).open().unwrap();
        let result = manager.read(&id, &RangeSet::all(), None).unwrap();
        assert_eq!(vec![record(1, 1), record(2, 2)], result);
    }
}
