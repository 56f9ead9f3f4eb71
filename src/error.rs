// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::checksum::Checksum;
use crate::coding::{DecodeError, EncodeError};

/// Errors that can occur in the HorizonDB storage engine core.
///
/// Variants correspond to the error conditions surfaced to callers,
/// plus the lower-level encode/decode/I/O errors that get wrapped at
/// the point they're raised.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Deserialization failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A block, file header, commit-log frame, or B+-tree manifest's
    /// checksum did not match its payload.
    #[error("checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch {
        /// Checksum recorded in the header/trailer.
        expected: Checksum,
        /// Checksum recomputed over the payload.
        got: Checksum,
    },

    /// The referenced database does not exist.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// The referenced time series does not exist.
    #[error("unknown time series: {0}.{1}")]
    UnknownTimeSeries(String, String),

    /// A database with this name already exists.
    #[error("duplicate database: {0}")]
    DuplicateDatabase(String),

    /// A time series with this name already exists in the database.
    #[error("duplicate time series: {0}.{1}")]
    DuplicateTimeSeries(String, String),

    /// A record failed schema or range validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The mem-series slab allocator has no space left for the
    /// requested allocation; the mem-series must be rotated.
    #[error("slab allocator out of space")]
    OutOfSpace,

    /// The process-wide memory hard cap was exceeded and the request
    /// could not be admitted even after backpressure.
    #[error("out of memory")]
    OutOfMemory,

    /// The commit log (or a partition depending on it) has been closed.
    #[error("commit log closed")]
    CommitLogClosed,

    /// Commit-log replay hit a corrupt frame and no truncate-tail
    /// policy was configured.
    #[error("commit log corrupt at segment {segment}, offset {offset}")]
    ReplayCorruption {
        /// Segment id containing the bad frame.
        segment: u64,
        /// Byte offset of the bad frame within the segment.
        offset: u64,
    },

    /// A catalogue node's encoded bytes did not fit within one
    /// fixed-size page.
    #[error("catalogue page overflow: node needs {needed} bytes, page is {page_size}")]
    CatalogPageOverflow {
        /// Bytes the node needed.
        needed: usize,
        /// Configured page size.
        page_size: usize,
    },
}

/// Storage engine result.
pub type Result<T> = std::result::Result<T, Error>;
