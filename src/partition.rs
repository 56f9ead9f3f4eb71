// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The time-series partition.
//!
//! A partition is the only component that serialises writers. Readers
//! never block on writers: state is published through a single
//! `RwLock<Arc<TimeSeriesElements>>` atomically swappable cell, so a
//! reader holding an `Arc` clone sees a consistent snapshot even as
//! writers keep publishing new ones.

use crate::block::{self, Block};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::commitlog::CommitLog;
use crate::compression::CompressionType;
use crate::error::Result;
use crate::field::Record;
use crate::mem_series::MemTimeSeries;
use crate::range::{Range, RangeSet};
use crate::replay_position::ReplayPosition;
use crate::slab::SlabAllocator;
use crate::timeseries_file::TimeSeriesFile;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use varint_rs::{VarintReader, VarintWriter};

/// Identifies a partition: a time series, and the sub-range of its
/// timeline this partition owns.
///
/// Ordered lexicographically by `database`, then `series`, then
/// `range.lower` (ties on `range.lower` broken by `range.upper`),
/// matching the derive order of the fields below.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    /// Database this partition's time series belongs to.
    pub database: String,
    /// Name of the time series within the database.
    pub series: String,
    /// Timestamp range covered by this partition.
    pub range: Range,
}

impl PartitionId {
    #[must_use]
    /// Creates a new partition identifier.
    pub fn new(database: impl Into<String>, series: impl Into<String>, range: Range) -> Self {
        Self {
            database: database.into(),
            series: series.into(),
            range,
        }
    }
}

impl Encode for PartitionId {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32_varint(self.database.len() as u32)?;
        writer.write_all(self.database.as_bytes())?;
        writer.write_u32_varint(self.series.len() as u32)?;
        writer.write_all(self.series.as_bytes())?;
        self.range.encode_into(writer)?;
        Ok(())
    }
}

impl Decode for PartitionId {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let database = read_string(reader)?;
        let series = read_string(reader)?;
        let range = Range::decode_from(reader)?;
        Ok(Self { database, series, range })
    }
}

fn read_string<R: Read>(reader: &mut R) -> std::result::Result<String, DecodeError> {
    let len = reader.read_u32_varint()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidHeader("utf8 string"))
}

/// The catalogued state of one partition, the value type stored in the
/// B⁺-tree catalogue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionMetaData {
    /// Timestamp range covered by the file.
    pub range: Range,
    /// Size of the file on disk, in bytes.
    pub file_size: u64,
    /// Byte offsets of each sealed block, keyed by range.
    pub block_positions: BTreeMap<Range, (u64, u64)>,
    /// Last replay position durably reflected in this file.
    pub replay_position: ReplayPosition,
}

impl Encode for PartitionMetaData {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        self.range.encode_into(writer)?;
        writer.write_u64_varint(self.file_size)?;
        writer.write_u32_varint(self.block_positions.len() as u32)?;

        for (range, (offset, length)) in &self.block_positions {
            range.encode_into(writer)?;
            writer.write_u64_varint(*offset)?;
            writer.write_u64_varint(*length)?;
        }

        self.replay_position.encode_into(writer)?;
        Ok(())
    }
}

impl Decode for PartitionMetaData {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let range = Range::decode_from(reader)?;
        let file_size = reader.read_u64_varint()?;
        let block_count = reader.read_u32_varint()?;

        let mut block_positions = BTreeMap::new();
        for _ in 0..block_count {
            let block_range = Range::decode_from(reader)?;
            let offset = reader.read_u64_varint()?;
            let length = reader.read_u64_varint()?;
            block_positions.insert(block_range, (offset, length));
        }

        let replay_position = ReplayPosition::decode_from(reader)?;

        Ok(Self {
            range,
            file_size,
            block_positions,
            replay_position,
        })
    }
}

/// The composite on-disk/in-memory state of one partition, published
/// as a whole behind one atomic cell.
pub struct TimeSeriesElements {
    /// Durable, block-indexed file backing this partition.
    pub file: Arc<RwLock<TimeSeriesFile>>,
    /// Chain of mem-series snapshots not yet flushed to `file`.
    pub mems: Vec<Arc<MemTimeSeries>>,
}

impl TimeSeriesElements {
    fn replay_position(&self) -> ReplayPosition {
        self.mems
            .last()
            .map(|mem| mem.replay_position())
            .unwrap_or_else(|| self.file.read().expect("lock is poisoned").replay_position())
    }

    /// The oldest commit-log segment still needed to reconstruct data
    /// not yet durable in the file.
    fn first_non_persisted_segment(&self) -> Option<u64> {
        self.mems.first().map(|mem| mem.replay_position().segment_id)
    }
}

/// Tuning knobs a partition needs from the series' schema/configuration.
/// The schema catalog itself is out of scope here, but the storage
/// core still needs these numbers to size its buffers.
#[derive(Clone, Copy, Debug)]
pub struct PartitionConfig {
    /// Size of each mem-series slab allocation, in bytes.
    pub slab_size: usize,
    /// Target size of a sealed block before rotation.
    pub target_block_size: usize,
    /// Maximum number of sealed blocks kept before a flush.
    pub max_sealed_blocks: usize,
    /// Compression applied to newly sealed blocks.
    pub compression: CompressionType,
}

struct WriteState {
    allocators: Vec<SlabAllocator>,
}

/// The time-series partition: the only component that serialises
/// writers, and the unit the partition manager caches, evicts, and
/// flushes.
pub struct TimeSeriesPartition {
    id: PartitionId,
    config: PartitionConfig,
    write_mutex: Mutex<WriteState>,
    elements: RwLock<Arc<TimeSeriesElements>>,
}

impl TimeSeriesPartition {
    /// Opens (creating if necessary) the partition's file at `path`
    /// and restores the mem-series list to empty, ready to accept
    /// writes or replay.
    pub fn open(id: PartitionId, path: impl AsRef<Path>, config: PartitionConfig, recovered: Option<&PartitionMetaData>) -> Result<Self> {
        let mut file = TimeSeriesFile::open(&path, &id.database, &id.series, id.range)?;

        if let Some(meta) = recovered {
            file.restore_index(meta.block_positions.clone(), meta.replay_position);
        }

        let elements = TimeSeriesElements {
            file: Arc::new(RwLock::new(file)),
            mems: Vec::new(),
        };

        Ok(Self {
            id,
            config,
            write_mutex: Mutex::new(WriteState { allocators: Vec::new() }),
            elements: RwLock::new(Arc::new(elements)),
        })
    }

    #[must_use]
    /// Returns this partition's identifier.
    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// A point-in-time snapshot of this partition's state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TimeSeriesElements> {
        Arc::clone(&self.elements.read().expect("lock is poisoned"))
    }

    /// Appends `records`, durably, publishing a new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit-log append fails (the write is
    /// aborted, `elements` is left unchanged) or the slab allocator is
    /// out of space even after rotating to a fresh mem-series.
    pub fn write(&self, commit_log: &CommitLog, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let handle = commit_log.append(self.id.clone(), records)?;
        let replay_position = handle.wait()?;
        self.apply(records, replay_position, false)
    }

    /// Re-applies a commit-log frame during startup replay. Idempotent:
    /// ignored if `replay_position` is not after
    /// the partition's current durable position, the sole mechanism
    /// ensuring at-most-once effects after recovery.
    pub fn replay_write(&self, records: &[Record], replay_position: ReplayPosition) -> Result<()> {
        if records.is_empty() || replay_position <= self.snapshot().replay_position() {
            return Ok(());
        }

        self.apply(records, replay_position, true)
    }

    fn apply(&self, records: &[Record], replay_position: ReplayPosition, replay: bool) -> Result<()> {
        let mut state = self.write_mutex.lock().expect("lock is poisoned");
        let current = self.snapshot();

        if replay && replay_position <= current.replay_position() {
            return Ok(());
        }

        let mut mems = current.mems.clone();

        let needs_rotation = mems.last().is_none_or(|m| m.is_full());

        if needs_rotation {
            state.allocators.push(SlabAllocator::new(self.config.slab_size));
            mems.push(Arc::new(MemTimeSeries::new(
                self.config.target_block_size,
                self.config.max_sealed_blocks,
                self.config.compression,
            )));
        }

        let allocator = state.allocators.last_mut().expect("just ensured a mem-series exists");

        let updated = mems.last().expect("just ensured a mem-series exists").write(allocator, records, replay_position)?;
        let last_idx = mems.len() - 1;
        mems[last_idx] = Arc::new(updated);

        let new_elements = Arc::new(TimeSeriesElements {
            file: Arc::clone(&current.file),
            mems,
        });

        *self.elements.write().expect("lock is poisoned") = new_elements;

        Ok(())
    }

    /// Lock-free snapshot read: decodes and merges file-resident blocks
    /// with live mem-series snapshots, file first then mems in order.
    pub fn read(&self, range_set: &RangeSet, record_type_filter: Option<u32>) -> Result<Vec<Record>> {
        let elements = self.snapshot();
        let mut out = Vec::new();

        {
            let file = elements.file.read().expect("lock is poisoned");
            for block in file.new_input(range_set)? {
                let block = block?;
                decode_block_into(&block, record_type_filter, &mut out)?;
            }
        }

        for mem in &elements.mems {
            for block in mem.iterator(range_set) {
                decode_block_into(block, record_type_filter, &mut out)?;
            }
        }

        out.sort_by_key(Record::sort_key);

        Ok(out)
    }

    /// Flushes sealed mem-series into the file; if `force` is `true`,
    /// also seals and flushes the currently open mem-series.
    ///
    /// # Errors
    ///
    /// On failure, the partition's published state is left unchanged
    /// and the commit-log segments backing it remain retained.
    pub fn flush(&self, force: bool) -> Result<()> {
        let mut state = self.write_mutex.lock().expect("lock is poisoned");
        let current = self.snapshot();

        if current.mems.is_empty() {
            return Ok(());
        }

        let split_at = if force { current.mems.len() } else { current.mems.iter().filter(|m| m.is_full()).count() };

        if split_at == 0 {
            return Ok(());
        }

        let mut to_flush: Vec<MemTimeSeries> = current.mems[..split_at].iter().map(|m| (**m).clone()).collect();

        if force {
            if let Some(last) = to_flush.last_mut() {
                *last = last.seal();
            }
        }

        {
            let mut file = current.file.write().expect("lock is poisoned");
            file.append(&to_flush)?;
        }

        let remaining: Vec<Arc<MemTimeSeries>> = current.mems[split_at..].to_vec();

        state.allocators.drain(..split_at).for_each(|mut a| a.release());

        let new_elements = Arc::new(TimeSeriesElements {
            file: Arc::clone(&current.file),
            mems: remaining,
        });

        *self.elements.write().expect("lock is poisoned") = new_elements;

        Ok(())
    }

    /// The minimum segment id any live mem-series still depends on.
    #[must_use]
    pub fn first_segment_containing_non_persisted_data(&self) -> Option<u64> {
        self.snapshot().first_non_persisted_segment()
    }

    /// Total estimated mem-series memory footprint, for the manager's
    /// memory-pressure tracking.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.snapshot()
            .mems
            .iter()
            .map(|m| m.sealed_blocks().iter().map(|b| b.payload.len()).sum::<usize>())
            .sum()
    }

    /// Builds the catalogue entry to persist for this partition.
    #[must_use]
    pub fn meta(&self) -> PartitionMetaData {
        let elements = self.snapshot();
        let file = elements.file.read().expect("lock is poisoned");

        PartitionMetaData {
            range: self.id.range,
            file_size: file.file_size(),
            block_positions: file.block_positions().clone(),
            replay_position: elements.replay_position(),
        }
    }
}

fn decode_block_into(block: &Block, record_type_filter: Option<u32>, out: &mut Vec<Record>) -> Result<()> {
    let mut last_record_per_type = HashMap::new();

    for record in block::decode(block, &mut last_record_per_type)? {
        let record = record?;

        if record_type_filter.is_none_or(|t| t == record.record_type) {
            out.push(record);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{CommitLog, CommitLogConfig};
    use crate::field::{Field, TimeUnit};
    use test_log::test;

    fn config() -> PartitionConfig {
        PartitionConfig {
            slab_size: 1 << 20,
            target_block_size: 4096,
            max_sealed_blocks: 8,
            compression: CompressionType::None,
        }
    }

    fn record(ts: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(value)])
    }

    #[test]
    fn write_then_read_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let id = PartitionId::new("db", "temps", Range::new(0, 1_000_000));
        let partition = TimeSeriesPartition::open(id.clone(), dir.path().join("f.ts"), config(), None).unwrap();

        let log_dir = tempfile::tempdir().unwrap();
        let log = CommitLog::open(log_dir.path(), CommitLogConfig::default()).unwrap();

        partition.write(&log, &[record(300, 3), record(100, 1), record(200, 2)]).unwrap();

        let result = partition.read(&RangeSet::all(), None).unwrap();
        assert_eq!(vec![record(100, 1), record(200, 2), record(300, 3)], result);
    }

    #[test]
    fn force_flush_moves_mems_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = PartitionId::new("db", "temps", Range::new(0, 1_000_000));
        let partition = TimeSeriesPartition::open(id.clone(), dir.path().join("f.ts"), config(), None).unwrap();

        let log_dir = tempfile::tempdir().unwrap();
        let log = CommitLog::open(log_dir.path(), CommitLogConfig::default()).unwrap();

        partition.write(&log, &[record(1, 1)]).unwrap();
        partition.flush(true).unwrap();

        assert!(partition.snapshot().mems.is_empty());
        let result = partition.read(&RangeSet::all(), None).unwrap();
        assert_eq!(vec![record(1, 1)], result);
    }
}
