// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The append-only on-disk time-series file.

use crate::block::Block;
use crate::checksum::{ChecksummedReader, ChecksummedWriter};
use crate::coding::{Decode, DecodeError, Encode};
use crate::error::{Error, Result};
use crate::mem_series::MemTimeSeries;
use crate::range::{Range, RangeSet};
use crate::replay_position::ReplayPosition;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use varint_rs::{VarintReader, VarintWriter};

/// Magic bytes identifying a HorizonDB time-series data file.
pub const MAGIC_BYTES: [u8; 4] = [b'H', b'Z', b'D', b'F'];
const VERSION: u16 = 1;

/// The leading, fixed-once-written header of a time-series file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileMetaData {
    /// Database this file's time series belongs to.
    pub database: String,
    /// Name of the time series within the database.
    pub series: String,
    /// Timestamp range covered by this file.
    pub range: Range,
}

impl FileMetaData {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut hashed = ChecksummedWriter::new(writer);
        hashed.write_all(&MAGIC_BYTES)?;
        hashed.write_u16::<BigEndian>(VERSION)?;
        hashed.write_u32_varint(self.database.len() as u32)?;
        hashed.write_all(self.database.as_bytes())?;
        hashed.write_u32_varint(self.series.len() as u32)?;
        hashed.write_all(self.series.as_bytes())?;
        self.range.encode_into(&mut hashed)?;

        let crc = hashed.checksum();
        let writer = hashed.into_inner();
        writer.write_u32::<BigEndian>(crc.into_u32())?;

        Ok(())
    }

    /// Parses a `FileMetaData` from the front of `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] if the trailing CRC does
    /// not match the preceding bytes.
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hashed = ChecksummedReader::new(reader);

        let mut magic = [0u8; 4];
        hashed.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("FileMetaData").into());
        }

        let version = hashed.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(DecodeError::InvalidVersion.into());
        }

        let database = read_string(&mut hashed)?;
        let series = read_string(&mut hashed)?;
        let range = Range::decode_from(&mut hashed)?;

        let computed = hashed.checksum();
        let stored = hashed.inner_mut().read_u32::<BigEndian>()?;
        computed.check(crate::checksum::Checksum::from_raw(stored))?;

        Ok(Self { database, series, range })
    }

    fn encoded_len(&self) -> u64 {
        let mut buf = Vec::new();
        #[allow(clippy::expect_used)]
        self.write_to(&mut buf).expect("writing to a Vec cannot fail");
        buf.len() as u64
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32_varint()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidHeader("utf8 string").into())
}

/// An append-only on-disk file holding one partition's sealed blocks.
pub struct TimeSeriesFile {
    path: PathBuf,
    meta: FileMetaData,
    header_len: u64,
    file_size: u64,
    block_positions: BTreeMap<Range, (u64, u64)>,
    replay_position: ReplayPosition,
}

impl TimeSeriesFile {
    /// Opens or creates the file at `path`.
    ///
    /// If the file already exists and is non-empty, its leading
    /// `FileMetaData` is parsed and must match `database`/`series`;
    /// otherwise a fresh header is written for `(database, series, range)`.
    pub fn open(path: impl AsRef<Path>, database: &str, series: &str, range: Range) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let meta = if file_len > 0 {
            file.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(&file);
            FileMetaData::read_from(&mut reader)?
        } else {
            let meta = FileMetaData {
                database: database.to_string(),
                series: series.to_string(),
                range,
            };
            meta.write_to(&mut file)?;
            file.sync_all()?;
            meta
        };

        let header_len = meta.encoded_len();

        Ok(Self {
            path,
            meta,
            header_len,
            file_size: file_len.max(header_len),
            block_positions: BTreeMap::new(),
            replay_position: ReplayPosition::zero(),
        })
    }

    #[must_use]
    /// Returns this file's metadata.
    pub fn meta(&self) -> &FileMetaData {
        &self.meta
    }

    #[must_use]
    /// Returns the size of the file on disk, in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    /// Returns the last replay position durably reflected in this file.
    pub fn replay_position(&self) -> ReplayPosition {
        self.replay_position
    }

    #[must_use]
    /// Returns the byte offsets of each sealed block, keyed by range.
    pub fn block_positions(&self) -> &BTreeMap<Range, (u64, u64)> {
        &self.block_positions
    }

    /// Seeds block positions and replay position recovered from the
    /// partition catalogue, so reads don't need to rescan the file.
    pub fn restore_index(&mut self, block_positions: BTreeMap<Range, (u64, u64)>, replay_position: ReplayPosition) {
        self.block_positions = block_positions;
        self.replay_position = replay_position;
    }

    /// Appends every sealed block of `mems`, in order, durably.
    ///
    /// Invariant: either this call fully succeeds and `file_size`
    /// advances, or the file is left exactly as it was;
    /// a short write partway through is followed by a truncate back
    /// to the previous `file_size` before the error is returned.
    pub fn append(&mut self, mems: &[MemTimeSeries]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(self.file_size))?;

        let start_size = self.file_size;
        let mut offset = self.file_size;
        let mut buf = Vec::new();

        for mem in mems {
            for block in mem.sealed_blocks() {
                buf.clear();
                if let Err(e) = block.encode_into(&mut buf) {
                    return Err(e.into());
                }

                if let Err(e) = file.write_all(&buf) {
                    file.set_len(start_size)?;
                    return Err(e.into());
                }

                self.block_positions.insert(block.header.range, (offset, buf.len() as u64));
                offset += buf.len() as u64;
            }
        }

        file.sync_data()?;
        self.file_size = offset;

        if let Some(last) = mems.last() {
            self.replay_position = last.replay_position();
        }

        Ok(())
    }

    /// Opens a reader yielding blocks whose range overlaps `range_set`,
    /// seeking directly to each via the in-memory block-position index.
    pub fn new_input(&self, range_set: &RangeSet) -> Result<FileBlockReader> {
        let file = File::open(&self.path)?;

        let mut positions: Vec<(Range, u64, u64)> = self
            .block_positions
            .iter()
            .filter(|(range, _)| range_set.overlaps(range))
            .map(|(range, (offset, len))| (*range, *offset, *len))
            .collect();

        positions.sort_by_key(|(_, offset, _)| *offset);

        Ok(FileBlockReader { file, positions, cursor: 0 })
    }
}

/// A seekable reader over a subset of a [`TimeSeriesFile`]'s blocks,
/// positioned directly via the block-position index.
pub struct FileBlockReader {
    file: File,
    positions: Vec<(Range, u64, u64)>,
    cursor: usize,
}

impl Iterator for FileBlockReader {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, offset, _) = *self.positions.get(self.cursor)?;
        self.cursor += 1;

        if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
            return Some(Err(Error::Io(e)));
        }

        let mut reader = BufReader::new(&self.file);
        Some(Block::decode_from(&mut reader).map_err(Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;
    use crate::field::{Field, Record, TimeUnit};
    use crate::slab::SlabAllocator;
    use test_log::test;

    fn record(ts: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(ts)])
    }

    #[test]
    fn open_creates_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series-0.ts");

        let file = TimeSeriesFile::open(&path, "db", "temps", Range::new(0, 1_000)).unwrap();
        assert_eq!("db", file.meta().database);
        assert_eq!(file.header_len, file.file_size());

        let reopened = TimeSeriesFile::open(&path, "db", "temps", Range::new(0, 1_000)).unwrap();
        assert_eq!(file.meta().range, reopened.meta().range);
    }

    #[test]
    fn append_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series-0.ts");
        let mut file = TimeSeriesFile::open(&path, "db", "temps", Range::new(0, 1_000)).unwrap();

        let mut allocator = SlabAllocator::new(4096);
        let mem = MemTimeSeries::new(16, 8, CompressionType::None);
        let mem = mem.write(&mut allocator, &[record(1), record(2)], ReplayPosition::new(0, 1)).unwrap();
        let mem = mem.seal();

        file.append(std::slice::from_ref(&mem)).unwrap();

        let blocks: Result<Vec<_>> = file.new_input(&RangeSet::all()).unwrap().collect();
        let blocks = blocks.unwrap();
        assert!(!blocks.is_empty());
    }

    #[test]
    fn corrupt_header_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series-0.ts");
        TimeSeriesFile::open(&path, "db", "temps", Range::new(0, 1_000)).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[5] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = TimeSeriesFile::open(&path, "db", "temps", Range::new(0, 1_000));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }
}
