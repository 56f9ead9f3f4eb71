// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A storage engine core for a write-ahead-logged time-series database.
//!
//! ##### NOTE
//!
//! > This crate implements the storage layer only: partitions, the
//! > commit log, and the partition catalogue. Query planning, the
//! > wire protocol, and the schema catalog live above this crate.
//!
//! ##### About
//!
//! A time series is split into fixed-width [`partition::PartitionId`]
//! ranges. Each [`partition::TimeSeriesPartition`] holds its durable,
//! block-indexed [`timeseries_file::TimeSeriesFile`] plus a chain of
//! copy-on-write [`mem_series::MemTimeSeries`] snapshots covering
//! writes not yet flushed to that file.
//!
//! Writes first go through the segmented [`commitlog::CommitLog`],
//! which batches concurrent appends into group-committed, checksummed
//! frames; only once a write's batch is fsynced does it get applied to
//! the partition's mem-series chain. On restart, the commit log is
//! replayed from the last durable partition state recorded in the
//! on-disk [`btree::BPlusTree`] catalogue.
//!
//! [`manager::PartitionManager`] ties these together: it opens (or
//! recovers) the catalogue and commit log, keeps a bounded cache of
//! live partitions, runs the background flush worker pool, and
//! enforces the mem-series memory caps.
//!
//! # Example usage
//!
//! ```
//! use horizondb_storage::{Config, Range, RangeSet};
//! use horizondb_storage::field::{Field, Record, TimeUnit};
//! use horizondb_storage::partition::PartitionId;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let manager = Config::new(folder.path()).open()?;
//!
//! let id = PartitionId::new("sensors", "temperature", Range::new(0, 86_400_000));
//! let record = Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, 1_000), Field::Integer(21)]);
//!
//! manager.write(&id, &[record.clone()])?;
//!
//! let rows = manager.read(&id, &RangeSet::all(), None)?;
//! assert_eq!(vec![record], rows);
//! #
//! # Ok::<(), horizondb_storage::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

/// Binary search helpers over sorted slices.
pub mod binary_search;
pub mod block;
pub mod btree;
pub mod checksum;
/// CRC32 checksum wrapper and streaming reader/writer helpers.
pub mod coding;
pub mod commitlog;
mod compression;
mod config;
mod error;
pub mod field;
pub mod manager;
pub mod mem_series;
pub mod partition;
mod path;
pub mod range;
pub mod replay_position;
pub mod slab;
mod slice;
mod stop_signal;
pub mod timeseries_file;

pub use {
    btree::{BPlusTree, BPlusTreeConfig},
    commitlog::{CommitLog, CommitLogConfig, ReplayPolicy},
    compression::CompressionType,
    config::Config,
    error::{Error, Result},
    manager::PartitionManager,
    range::{Range, RangeSet},
    slice::Slice,
};
