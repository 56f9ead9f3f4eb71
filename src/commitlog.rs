// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The segmented write-ahead log.
//!
//! A single writer thread owns the active segment file and batches
//! pending appends; completion is a single-fire handle backed by a
//! oneshot channel. [`AppendHandle::wait`] blocks the caller until its
//! batch has been written and fsynced.

use crate::error::{Error, Result};
use crate::field::Record;
use crate::partition::PartitionId;
use crate::coding::{Decode, Encode};
use crate::replay_position::ReplayPosition;
use crate::stop_signal::StopSignal;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use varint_rs::{VarintReader, VarintWriter};

const SEGMENT_MAGIC: [u8; 4] = [b'H', b'Z', b'W', b'L'];
const SEGMENT_VERSION: u16 = 1;
const SEGMENT_HEADER_LEN: u64 = 6;

/// What to do when replay hits a corrupt frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ReplayPolicy {
    /// Fail the whole database start.
    #[default]
    Strict,
    /// Discard the tail from the first bad frame onward and log a warning.
    TruncateTail,
}

/// Commit-log tuning: group-commit batching knobs plus replay policy.
#[derive(Clone, Debug)]
pub struct CommitLogConfig {
    /// Segment file rotates once it would exceed this size.
    pub segment_size: u64,
    /// Maximum records batched into one fsync.
    pub batch_max_records: usize,
    /// Maximum buffered bytes before forcing a flush.
    pub batch_max_bytes: usize,
    /// How long the writer waits for more requests before flushing
    /// whatever it has.
    pub batch_linger: Duration,
    /// Behavior when replay encounters a corrupt frame.
    pub replay_policy: ReplayPolicy,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            batch_max_records: 256,
            batch_max_bytes: 1024 * 1024,
            batch_linger: Duration::from_millis(5),
            replay_policy: ReplayPolicy::Strict,
        }
    }
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:06}.log"))
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some(stem) = name.strip_suffix(".log") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

fn create_segment(dir: &Path, segment_id: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(segment_path(dir, segment_id))?;

    file.write_all(&SEGMENT_MAGIC)?;
    file.write_u16::<BigEndian>(SEGMENT_VERSION)?;
    file.sync_all()?;

    Ok(file)
}

fn build_frame(partition: &PartitionId, records: &[Record]) -> Vec<u8> {
    let mut payload = Vec::new();
    #[allow(clippy::expect_used)]
    {
        partition.encode_into(&mut payload).expect("writing to a Vec cannot fail");
        payload.write_u32_varint(records.len() as u32).expect("writing to a Vec cannot fail");
        for record in records {
            record.encode_into(&mut payload).expect("writing to a Vec cannot fail");
        }
    }

    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(payload.len() + 9);
    #[allow(clippy::expect_used)]
    frame.write_u32_varint(payload.len() as u32).expect("writing to a Vec cannot fail");
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

fn decode_frame(payload: &[u8]) -> Result<(PartitionId, Vec<Record>)> {
    let mut cursor = Cursor::new(payload);
    let partition_id = PartitionId::decode_from(&mut cursor)?;
    let count = cursor.read_u32_varint()?;

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(Record::decode_from(&mut cursor)?);
    }

    Ok((partition_id, records))
}

/// Reads one length-prefixed, CRC-protected frame from `cursor`.
fn try_read_frame(cursor: &mut Cursor<&[u8]>) -> std::result::Result<Vec<u8>, ()> {
    let len = cursor.read_u32_varint().map_err(|_| ())? as usize;
    let mut payload = vec![0u8; len];
    cursor.read_exact(&mut payload).map_err(|_| ())?;
    let stored_crc = cursor.read_u32::<BigEndian>().map_err(|_| ())?;

    if crc32fast::hash(&payload) != stored_crc {
        return Err(());
    }

    Ok(payload)
}

enum Message {
    Append(AppendRequest),
    Sync(Sender<()>),
}

struct AppendRequest {
    partition: PartitionId,
    records: Vec<Record>,
    reply: Sender<Result<ReplayPosition>>,
}

/// A single-fire handle resolving to the [`ReplayPosition`] assigned
/// to an append once its batch is durable.
pub struct AppendHandle {
    receiver: crossbeam_channel::Receiver<Result<ReplayPosition>>,
}

impl AppendHandle {
    /// Blocks until the append's batch has been written and fsynced.
    pub fn wait(self) -> Result<ReplayPosition> {
        self.receiver.recv().map_err(|_| Error::CommitLogClosed)?
    }
}

/// Segmented, group-committing write-ahead log.
pub struct CommitLog {
    dir: PathBuf,
    sender: Sender<Message>,
    active_segment: Arc<AtomicU64>,
    writer_thread: Option<std::thread::JoinHandle<()>>,
    stop: StopSignal,
}

impl CommitLog {
    /// Opens the log directory, resuming the highest-numbered segment,
    /// or creating segment zero if the directory is empty.
    ///
    /// Does not replay; call [`CommitLog::replay`] first during
    /// startup to recover partitions and to truncate any corrupt tail.
    pub fn open(dir: impl AsRef<Path>, config: CommitLogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let ids = list_segment_ids(&dir)?;

        let (segment_id, file, offset) = if let Some(&last) = ids.last() {
            let path = segment_path(&dir, last);
            let len = std::fs::metadata(&path)?.len();
            let file = OpenOptions::new().append(true).open(&path)?;
            (last, file, len.max(SEGMENT_HEADER_LEN))
        } else {
            let file = create_segment(&dir, 0)?;
            (0, file, SEGMENT_HEADER_LEN)
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        let stop = StopSignal::default();
        let active_segment = Arc::new(AtomicU64::new(segment_id));

        let thread_stop = stop.clone();
        let thread_dir = dir.clone();
        let thread_active_segment = Arc::clone(&active_segment);

        let writer_thread = std::thread::Builder::new()
            .name("horizondb-commitlog-writer".into())
            .spawn(move || writer_loop(receiver, thread_stop, thread_dir, config, segment_id, file, offset, thread_active_segment))
            .map_err(std::io::Error::from)?;

        Ok(Self {
            dir,
            sender,
            active_segment,
            writer_thread: Some(writer_thread),
            stop,
        })
    }

    /// Replays every segment in `dir`, in id order, calling `sink` for
    /// each decoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReplayCorruption`] on a CRC mismatch, unless
    /// `config.replay_policy` is [`ReplayPolicy::TruncateTail`], in
    /// which case the segment is truncated at the bad frame and
    /// replay of later segments is skipped (a torn write can only
    /// ever be the very last thing appended).
    pub fn replay(
        dir: impl AsRef<Path>,
        config: &CommitLogConfig,
        mut sink: impl FnMut(PartitionId, Vec<Record>, ReplayPosition) -> Result<()>,
    ) -> Result<()> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(());
        }

        for segment_id in list_segment_ids(dir)? {
            let path = segment_path(dir, segment_id);
            let bytes = std::fs::read(&path)?;

            if bytes.len() < SEGMENT_HEADER_LEN as usize || bytes[..4] != SEGMENT_MAGIC {
                continue;
            }

            let version = u16::from_be_bytes([bytes[4], bytes[5]]);
            if version != SEGMENT_VERSION {
                return Err(Error::ReplayCorruption { segment: segment_id, offset: 0 });
            }

            let mut cursor = Cursor::new(&bytes[..]);
            cursor.set_position(SEGMENT_HEADER_LEN);

            let mut truncated = false;

            loop {
                let frame_start = cursor.position();
                if frame_start >= bytes.len() as u64 {
                    break;
                }

                match try_read_frame(&mut cursor) {
                    Ok(payload) => {
                        let (partition_id, records) = decode_frame(&payload)?;
                        sink(partition_id, records, ReplayPosition::new(segment_id, frame_start))?;
                    }
                    Err(()) => match config.replay_policy {
                        ReplayPolicy::Strict => {
                            return Err(Error::ReplayCorruption { segment: segment_id, offset: frame_start });
                        }
                        ReplayPolicy::TruncateTail => {
                            log::warn!("truncating commit log tail at segment {segment_id} offset {frame_start}");
                            OpenOptions::new().write(true).open(&path)?.set_len(frame_start)?;
                            truncated = true;
                            break;
                        }
                    },
                }
            }

            if truncated {
                break;
            }
        }

        Ok(())
    }

    /// Appends `records` on behalf of `partition`; the returned handle
    /// resolves once the batch containing them is durable.
    pub fn append(&self, partition: PartitionId, records: &[Record]) -> Result<AppendHandle> {
        let (reply, receiver) = crossbeam_channel::bounded(1);

        self.sender
            .send(Message::Append(AppendRequest {
                partition,
                records: records.to_vec(),
                reply,
            }))
            .map_err(|_| Error::CommitLogClosed)?;

        Ok(AppendHandle { receiver })
    }

    /// Blocks until every append queued before this call is durable.
    pub fn sync(&self) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.sender.send(Message::Sync(tx)).map_err(|_| Error::CommitLogClosed)?;
        rx.recv().map_err(|_| Error::CommitLogClosed)
    }

    /// The segment currently being written to.
    #[must_use]
    pub fn active_segment_id(&self) -> u64 {
        self.active_segment.load(Ordering::Acquire)
    }

    /// Deletes every segment strictly older than `min_segment_id`; the
    /// caller (the partition manager) computes `min_segment_id` as the
    /// minimum `firstSegmentContainingNonPersistedData` across live
    /// partitions.
    pub fn delete_segments_before(&self, min_segment_id: u64) -> Result<Vec<u64>> {
        let mut deleted = Vec::new();

        for id in list_segment_ids(&self.dir)? {
            if id >= min_segment_id || id == self.active_segment_id() {
                break;
            }

            std::fs::remove_file(segment_path(&self.dir, id))?;
            deleted.push(id);
        }

        Ok(deleted)
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        self.stop.send();

        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn writer_loop(
    receiver: Receiver<Message>,
    stop: StopSignal,
    dir: PathBuf,
    config: CommitLogConfig,
    mut segment_id: u64,
    mut file: File,
    mut offset: u64,
    active_segment: Arc<AtomicU64>,
) {
    loop {
        let mut batch = Vec::new();
        let mut sync_waiters = Vec::new();

        match receiver.recv_timeout(config.batch_linger) {
            Ok(Message::Append(req)) => batch.push(req),
            Ok(Message::Sync(tx)) => sync_waiters.push(tx),
            Err(RecvTimeoutError::Timeout) => {
                if stop.is_stopped() && receiver.is_empty() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut batch_bytes = 0usize;

        while batch.len() < config.batch_max_records && batch_bytes < config.batch_max_bytes {
            match receiver.try_recv() {
                Ok(Message::Append(req)) => {
                    batch_bytes += req.records.len();
                    batch.push(req);
                }
                Ok(Message::Sync(tx)) => sync_waiters.push(tx),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let mut buf = Vec::new();
            let mut positions = Vec::with_capacity(batch.len());

            for req in &batch {
                let frame = build_frame(&req.partition, &req.records);

                if offset + buf.len() as u64 + frame.len() as u64 > config.segment_size
                    && offset + buf.len() as u64 > SEGMENT_HEADER_LEN
                {
                    if !buf.is_empty() {
                        let _ = file.write_all(&buf).and_then(|()| file.sync_data());
                        offset += buf.len() as u64;
                        buf.clear();
                    }

                    segment_id += 1;
                    active_segment.store(segment_id, Ordering::Release);

                    match create_segment(&dir, segment_id) {
                        Ok(new_file) => file = new_file,
                        Err(_) => {
                            for req in batch.drain(..) {
                                let _ = req.reply.send(Err(Error::CommitLogClosed));
                            }
                            return;
                        }
                    }

                    offset = SEGMENT_HEADER_LEN;
                }

                positions.push(ReplayPosition::new(segment_id, offset + buf.len() as u64));
                buf.extend_from_slice(&frame);
            }

            let write_result = file.write_all(&buf).and_then(|()| file.sync_data());
            offset += buf.len() as u64;

            for (req, position) in batch.into_iter().zip(positions) {
                let result = match &write_result {
                    Ok(()) => Ok(position),
                    Err(e) => Err(Error::Io(std::io::Error::new(e.kind(), e.to_string()))),
                };
                let _ = req.reply.send(result);
            }
        }

        for tx in sync_waiters {
            let _ = tx.send(());
        }

        if stop.is_stopped() && receiver.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Field, TimeUnit};
    use crate::range::Range;
    use test_log::test;

    fn partition_id() -> PartitionId {
        PartitionId::new("db", "temps", Range::new(0, 1_000))
    }

    fn record(ts: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(ts)])
    }

    #[test]
    fn append_resolves_a_replay_position() {
        let dir = tempfile::tempdir().unwrap();
        let log = CommitLog::open(dir.path(), CommitLogConfig::default()).unwrap();

        let handle = log.append(partition_id(), &[record(1)]).unwrap();
        let position = handle.wait().unwrap();
        assert_eq!(0, position.segment_id);
    }

    #[test]
    fn replay_recovers_appended_frames() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = CommitLog::open(dir.path(), CommitLogConfig::default()).unwrap();
            log.append(partition_id(), &[record(1), record(2)]).unwrap().wait().unwrap();
            log.sync().unwrap();
        }

        let mut recovered = Vec::new();
        CommitLog::replay(dir.path(), &CommitLogConfig::default(), |pid, records, pos| {
            recovered.push((pid, records, pos));
            Ok(())
        })
        .unwrap();

        assert_eq!(1, recovered.len());
        assert_eq!(2, recovered[0].1.len());
    }

    #[test]
    fn truncate_tail_policy_discards_corrupt_frame() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = CommitLog::open(dir.path(), CommitLogConfig::default()).unwrap();
            log.append(partition_id(), &[record(1)]).unwrap().wait().unwrap();
            log.sync().unwrap();
        }

        let path = dir.path().join("000000.log");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let config = CommitLogConfig {
            replay_policy: ReplayPolicy::TruncateTail,
            ..CommitLogConfig::default()
        };

        let mut recovered = Vec::new();
        CommitLog::replay(dir.path(), &config, |pid, records, pos| {
            recovered.push((pid, records, pos));
            Ok(())
        })
        .unwrap();

        assert!(recovered.is_empty());
    }
}
