// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory, append-only record buffer for one partition.
//!
//! [`MemTimeSeries`] is an immutable snapshot: [`MemTimeSeries::write`]
//! never mutates `self`, it returns a new snapshot that shares already
//! sealed blocks with the old one via `Arc<Block>`, giving structural
//! sharing without a separate arena or index space.

use crate::block::{self, Block};
use crate::coding::Encode;
use crate::compression::CompressionType;
use crate::error::Result;
use crate::field::{Field, Record};
use crate::range::{Range, RangeSet};
use crate::replay_position::ReplayPosition;
use crate::slab::SlabAllocator;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

fn estimated_field_size(field: &Field) -> usize {
    match field {
        Field::Timestamp(..) | Field::Integer(_) => 9,
        Field::Decimal { .. } => 13,
        Field::Byte(bytes) => bytes.len() + 5,
    }
}

fn estimated_record_size(record: &Record) -> usize {
    4 + record.fields.iter().map(estimated_field_size).sum::<usize>()
}

/// An immutable snapshot of one mem-series.
#[derive(Clone, Debug)]
pub struct MemTimeSeries {
    sealed: Vec<Arc<Block>>,
    pending: Vec<Record>,
    pending_size: usize,
    last_record_per_type: HashMap<u32, Record>,
    replay_position: ReplayPosition,
    full: bool,
    target_block_size: usize,
    max_sealed_blocks: usize,
    compression: CompressionType,
}

impl MemTimeSeries {
    /// Creates an empty mem-series backed by `allocator`'s slab.
    #[must_use]
    pub fn new(target_block_size: usize, max_sealed_blocks: usize, compression: CompressionType) -> Self {
        Self {
            sealed: Vec::new(),
            pending: Vec::new(),
            pending_size: 0,
            last_record_per_type: HashMap::new(),
            replay_position: ReplayPosition::zero(),
            full: false,
            target_block_size,
            max_sealed_blocks,
            compression,
        }
    }

    /// `true` once the mem-series should no longer accept writes.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// The replay position of the most recently written record.
    #[must_use]
    pub fn replay_position(&self) -> ReplayPosition {
        self.replay_position
    }

    /// All sealed blocks, in timestamp order.
    #[must_use]
    pub fn sealed_blocks(&self) -> &[Arc<Block>] {
        &self.sealed
    }

    /// `true` if there is no data at all, sealed or pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.pending.is_empty()
    }

    /// Appends `records` to the in-flight block, sealing it into the
    /// slab first if it would exceed the target block size, and
    /// returns a new snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::OutOfSpace`] if the slab cannot
    /// hold the new records even after sealing the in-flight block;
    /// the caller must treat the mem-series as full and rotate.
    pub fn write(
        &self,
        allocator: &mut SlabAllocator,
        records: &[Record],
        replay_position: ReplayPosition,
    ) -> Result<Self> {
        let mut next = self.clone();
        next.replay_position = replay_position;

        for record in records {
            let size = estimated_record_size(record);

            if next.pending_size + size > next.target_block_size && !next.pending.is_empty() {
                next.seal_pending();
            }

            allocator.allocate(&vec![0u8; size])?;
            next.pending.push(record.clone());
            next.pending_size += size;
        }

        next.full = next.sealed.len() >= next.max_sealed_blocks || allocator.remaining() == 0;

        Ok(next)
    }

    fn seal_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let block = block::encode(&self.pending, &mut self.last_record_per_type, self.compression);
        self.sealed.push(Arc::new(block));
        self.pending.clear();
        self.pending_size = 0;
    }

    /// Forces the in-flight block closed, returning a fully sealed
    /// snapshot ready for [`MemTimeSeries::write_to`].
    #[must_use]
    pub fn seal(&self) -> Self {
        let mut next = self.clone();
        next.seal_pending();
        next.full = true;
        next
    }

    /// Persists every sealed block, in order, to `output`.
    pub fn write_to<W: Write>(&self, output: &mut W) -> Result<()> {
        for block in &self.sealed {
            block.encode_into(output)?;
        }
        Ok(())
    }

    /// Yields sealed blocks overlapping `range_set`, in timestamp order.
    pub fn iterator<'a>(&'a self, range_set: &'a RangeSet) -> impl Iterator<Item = &'a Arc<Block>> {
        self.sealed
            .iter()
            .filter(move |block| range_set.overlaps(&block.header.range))
    }

    /// The closed timestamp interval spanning sealed and pending data.
    #[must_use]
    pub fn range(&self) -> Option<Range> {
        let mut range = self.sealed.first().map(|b| b.header.range);

        for block in self.sealed.iter().skip(1) {
            range = range.map(|r| r.union(&block.header.range));
        }

        for record in &self.pending {
            let ts = record.timestamp();
            range = Some(range.map_or(Range::new(ts, ts), |r| r.union(&Range::new(ts, ts))));
        }

        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::TimeUnit;
    use test_log::test;

    fn record(ts: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(ts)])
    }

    #[test]
    fn write_returns_new_snapshot_sharing_sealed_blocks() {
        let mem = MemTimeSeries::new(16, 8, CompressionType::None);
        let mut allocator = SlabAllocator::new(4096);

        let next = mem
            .write(&mut allocator, &[record(1), record(2), record(3)], ReplayPosition::new(0, 10))
            .unwrap();

        assert!(!next.sealed.is_empty());
        let again = next.write(&mut allocator, &[record(4)], ReplayPosition::new(0, 20)).unwrap();
        assert_eq!(next.sealed.len(), again.sealed.len().min(next.sealed.len()));
        assert!(Arc::ptr_eq(&next.sealed[0], &again.sealed[0]));
    }

    #[test]
    fn seal_closes_the_in_flight_block() {
        let mem = MemTimeSeries::new(4096, 8, CompressionType::None);
        let mut allocator = SlabAllocator::new(4096);

        let written = mem.write(&mut allocator, &[record(1)], ReplayPosition::new(0, 1)).unwrap();
        assert!(written.sealed.is_empty());

        let sealed = written.seal();
        assert_eq!(1, sealed.sealed.len());
        assert!(sealed.is_full());
    }

    #[test]
    fn out_of_space_propagates_from_slab() {
        let mem = MemTimeSeries::new(16, 8, CompressionType::None);
        let mut allocator = SlabAllocator::new(4);

        let big = Record::new(
            0,
            vec![Field::Timestamp(TimeUnit::Millis, 1), Field::Byte(vec![0u8; 100].into())],
        );

        assert!(mem.write(&mut allocator, &[big], ReplayPosition::new(0, 1)).is_err());
    }
}
