// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The on-disk partition catalogue.
//!
//! Copy-on-write, fixed branching factor. Nodes live one-per-page in
//! a fixed-size-page data file (`catalog.btree`); a manifest file
//! (`catalog.manifest`) records successive root publications as
//! appended trailers, the latest valid one (scanning from EOF
//! backwards) winning on open.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use crate::partition::{PartitionId, PartitionMetaData};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

const PAGE_TAG_LEAF: u8 = 0;
const PAGE_TAG_INTERNAL: u8 = 1;
const PAGE_TAG_FREE_LIST: u8 = 2;
const NONE_SENTINEL: u64 = u64::MAX;
const TRAILER_LEN: u64 = 28;

/// Tuning for the on-disk catalogue.
#[derive(Copy, Clone, Debug)]
pub struct BPlusTreeConfig {
    /// Maximum children an internal node may have (maximum keys in a
    /// leaf before it splits is `order - 1`).
    pub order: usize,
    /// Fixed page size every node occupies. A node whose encoded
    /// entries don't fit in one page
    /// fails the insert with [`Error::CatalogPageOverflow`]; the
    /// catalogue's values (`PartitionMetaData`) are expected to stay
    /// small relative to this, since a partition with very many
    /// sealed blocks would otherwise need overflow pages, which this
    /// catalogue does not implement.
    pub page_size: usize,
}

impl Default for BPlusTreeConfig {
    fn default() -> Self {
        Self { order: 64, page_size: 64 * 1024 }
    }
}

enum Node {
    Leaf { keys: Vec<PartitionId>, values: Vec<PartitionMetaData> },
    Internal { keys: Vec<PartitionId>, children: Vec<u64> },
}

impl Node {
    fn encode_payload(&self) -> std::result::Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();

        match self {
            Self::Leaf { keys, values } => {
                for (key, value) in keys.iter().zip(values) {
                    key.encode_into(&mut buf)?;
                    value.encode_into(&mut buf)?;
                }
            }
            Self::Internal { keys, children } => {
                for key in keys {
                    key.encode_into(&mut buf)?;
                }
                for child in children {
                    buf.write_u64::<BigEndian>(*child)?;
                }
            }
        }

        Ok(buf)
    }

    fn keys(&self) -> &[PartitionId] {
        match self {
            Self::Leaf { keys, .. } | Self::Internal { keys, .. } => keys,
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }
}

/// Writes `node` into a freshly allocated page-sized buffer: `tag:1 |
/// keyCount:2 | payload...` zero-padded, `crc32:4` over everything but
/// the trailing checksum itself.
fn encode_page(node: &Node, page_size: usize) -> Result<Vec<u8>> {
    let payload = node.encode_payload()?;
    let header_len = 3;
    let needed = header_len + payload.len() + 4;

    if needed > page_size {
        return Err(Error::CatalogPageOverflow { needed, page_size });
    }

    let mut page = vec![0u8; page_size];
    page[0] = if node.is_leaf() { PAGE_TAG_LEAF } else { PAGE_TAG_INTERNAL };
    page[1..3].copy_from_slice(&(node.keys().len() as u16).to_be_bytes());
    page[3..3 + payload.len()].copy_from_slice(&payload);

    let crc = crc32fast::hash(&page[..page_size - 4]);
    page[page_size - 4..].copy_from_slice(&crc.to_be_bytes());

    Ok(page)
}

fn decode_page(page: &[u8]) -> Result<Node> {
    let page_size = page.len();
    let stored_crc = u32::from_be_bytes(page[page_size - 4..].try_into().expect("4 bytes"));
    let computed = crc32fast::hash(&page[..page_size - 4]);

    if computed != stored_crc {
        return Err(Error::ChecksumMismatch {
            expected: crate::checksum::Checksum::from_raw(stored_crc),
            got: crate::checksum::Checksum::from_raw(computed),
        });
    }

    let tag = page[0];
    let key_count = u16::from_be_bytes([page[1], page[2]]) as usize;
    let mut cursor = &page[3..page_size - 4];

    match tag {
        PAGE_TAG_LEAF => {
            let mut keys = Vec::with_capacity(key_count);
            let mut values = Vec::with_capacity(key_count);

            for _ in 0..key_count {
                keys.push(PartitionId::decode_from(&mut cursor)?);
                values.push(PartitionMetaData::decode_from(&mut cursor)?);
            }

            Ok(Node::Leaf { keys, values })
        }
        PAGE_TAG_INTERNAL => {
            let mut keys = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                keys.push(PartitionId::decode_from(&mut cursor)?);
            }

            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..=key_count {
                children.push(cursor.read_u64::<BigEndian>()?);
            }

            Ok(Node::Internal { keys, children })
        }
        tag => Err(DecodeError::InvalidTag(("CatalogPage", tag)).into()),
    }
}

fn encode_free_list(pages: &[u64], page_size: usize) -> Vec<u8> {
    let capacity = (page_size - 3 - 4 - 4) / 8;
    let kept = &pages[..pages.len().min(capacity)];

    let mut page = vec![0u8; page_size];
    page[0] = PAGE_TAG_FREE_LIST;
    page[3..7].copy_from_slice(&(kept.len() as u32).to_be_bytes());

    let mut offset = 7;
    for p in kept {
        page[offset..offset + 8].copy_from_slice(&p.to_be_bytes());
        offset += 8;
    }

    let crc = crc32fast::hash(&page[..page_size - 4]);
    page[page_size - 4..].copy_from_slice(&crc.to_be_bytes());
    page
}

fn decode_free_list(page: &[u8]) -> Result<Vec<u64>> {
    let page_size = page.len();
    let stored_crc = u32::from_be_bytes(page[page_size - 4..].try_into().expect("4 bytes"));
    let computed = crc32fast::hash(&page[..page_size - 4]);

    if computed != stored_crc {
        return Err(Error::ChecksumMismatch {
            expected: crate::checksum::Checksum::from_raw(stored_crc),
            got: crate::checksum::Checksum::from_raw(computed),
        });
    }

    let count = u32::from_be_bytes(page[3..7].try_into().expect("4 bytes")) as usize;
    let mut pages = Vec::with_capacity(count);
    let mut offset = 7;

    for _ in 0..count {
        pages.push(u64::from_be_bytes(page[offset..offset + 8].try_into().expect("8 bytes")));
        offset += 8;
    }

    Ok(pages)
}

struct ManifestTrailer {
    root_page: Option<u64>,
    free_list_page: Option<u64>,
    generation: u64,
}

impl ManifestTrailer {
    fn encode(&self) -> [u8; TRAILER_LEN as usize] {
        let mut buf = [0u8; TRAILER_LEN as usize];
        buf[0..8].copy_from_slice(&self.root_page.unwrap_or(NONE_SENTINEL).to_be_bytes());
        buf[8..16].copy_from_slice(&self.free_list_page.unwrap_or(NONE_SENTINEL).to_be_bytes());
        buf[16..24].copy_from_slice(&self.generation.to_be_bytes());
        let crc = crc32fast::hash(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; TRAILER_LEN as usize]) -> Option<Self> {
        let stored_crc = u32::from_be_bytes(buf[24..28].try_into().expect("4 bytes"));
        if crc32fast::hash(&buf[..24]) != stored_crc {
            return None;
        }

        let root = u64::from_be_bytes(buf[0..8].try_into().expect("8 bytes"));
        let free_list = u64::from_be_bytes(buf[8..16].try_into().expect("8 bytes"));
        let generation = u64::from_be_bytes(buf[16..24].try_into().expect("8 bytes"));

        Some(Self {
            root_page: (root != NONE_SENTINEL).then_some(root),
            free_list_page: (free_list != NONE_SENTINEL).then_some(free_list),
            generation,
        })
    }
}

/// Finds the last structurally valid trailer in `manifest`, scanning
/// backward from EOF to the last CRC-valid one.
fn read_last_valid_trailer(manifest: &mut File) -> Result<Option<ManifestTrailer>> {
    let len = manifest.metadata()?.len();
    let mut slot = len / TRAILER_LEN;

    while slot > 0 {
        slot -= 1;
        manifest.seek(SeekFrom::Start(slot * TRAILER_LEN))?;

        let mut buf = [0u8; TRAILER_LEN as usize];
        if manifest.read_exact(&mut buf).is_err() {
            continue;
        }

        if let Some(trailer) = ManifestTrailer::decode(&buf) {
            return Ok(Some(trailer));
        }
    }

    Ok(None)
}

struct TreeState {
    root_page: Option<u64>,
    free_pages: Vec<u64>,
    generation: u64,
    next_page: u64,
}

/// The on-disk partition catalogue: `PartitionId → PartitionMetaData`.
pub struct BPlusTree {
    data_path: PathBuf,
    manifest_path: PathBuf,
    config: BPlusTreeConfig,
    write_mutex: Mutex<()>,
    state: RwLock<TreeState>,
}

enum InsertOutcome {
    Written(u64),
    Split { left: u64, split_key: PartitionId, right: u64 },
}

impl BPlusTree {
    /// Opens (creating if necessary) the catalogue under `dir`.
    pub fn open(dir: impl AsRef<Path>, config: BPlusTreeConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let data_path = dir.join("catalog.btree");
        let manifest_path = dir.join("catalog.manifest");

        OpenOptions::new().create(true).write(true).read(true).open(&data_path)?;
        let mut manifest = OpenOptions::new().create(true).read(true).append(true).open(&manifest_path)?;

        let trailer = read_last_valid_trailer(&mut manifest)?;

        let state = if let Some(trailer) = trailer {
            let data_file = OpenOptions::new().read(true).open(&data_path)?;
            let next_page = data_file.metadata()?.len() / config.page_size as u64;

            let free_pages = if let Some(flp) = trailer.free_list_page {
                let mut page = vec![0u8; config.page_size];
                let mut data_file = data_file;
                data_file.seek(SeekFrom::Start(flp * config.page_size as u64))?;
                data_file.read_exact(&mut page)?;
                decode_free_list(&page)?
            } else {
                Vec::new()
            };

            TreeState {
                root_page: trailer.root_page,
                free_pages,
                generation: trailer.generation,
                next_page,
            }
        } else {
            TreeState { root_page: None, free_pages: Vec::new(), generation: 0, next_page: 0 }
        };

        Ok(Self {
            data_path,
            manifest_path,
            config,
            write_mutex: Mutex::new(()),
            state: RwLock::new(state),
        })
    }

    fn read_page(&self, data_file: &mut File, page: u64) -> Result<Node> {
        let mut buf = vec![0u8; self.config.page_size];
        data_file.seek(SeekFrom::Start(page * self.config.page_size as u64))?;
        data_file.read_exact(&mut buf)?;
        decode_page(&buf)
    }

    /// Looks up `key`, returning its catalogued metadata if present.
    pub fn get(&self, key: &PartitionId) -> Result<Option<PartitionMetaData>> {
        let root_page = { self.state.read().expect("lock is poisoned").root_page };
        let Some(mut page) = root_page else { return Ok(None) };

        let mut data_file = OpenOptions::new().read(true).open(&self.data_path)?;

        loop {
            match self.read_page(&mut data_file, page)? {
                Node::Leaf { keys, values } => {
                    return Ok(keys.iter().position(|k| k == key).map(|i| values[i].clone()));
                }
                Node::Internal { keys, children } => {
                    let idx = crate::binary_search::partition_point(&keys, |k| k <= key);
                    page = children[idx];
                }
            }
        }
    }

    /// In-order keys/values whose key falls in `[lower, upper]`.
    pub fn range(&self, lower: &PartitionId, upper: &PartitionId) -> Result<Vec<(PartitionId, PartitionMetaData)>> {
        let root_page = { self.state.read().expect("lock is poisoned").root_page };
        let mut out = Vec::new();

        let Some(root_page) = root_page else { return Ok(out) };

        let mut data_file = OpenOptions::new().read(true).open(&self.data_path)?;
        self.collect_range(&mut data_file, root_page, lower, upper, &mut out)?;
        Ok(out)
    }

    fn collect_range(
        &self,
        data_file: &mut File,
        page: u64,
        lower: &PartitionId,
        upper: &PartitionId,
        out: &mut Vec<(PartitionId, PartitionMetaData)>,
    ) -> Result<()> {
        match self.read_page(data_file, page)? {
            Node::Leaf { keys, values } => {
                for (key, value) in keys.into_iter().zip(values) {
                    if &key >= lower && &key <= upper {
                        out.push((key, value));
                    }
                }
            }
            Node::Internal { children, .. } => {
                for child in children {
                    self.collect_range(data_file, child, lower, upper, out)?;
                }
            }
        }

        Ok(())
    }

    /// Inserts or replaces the value for `key`.
    pub fn insert(&self, key: PartitionId, value: PartitionMetaData) -> Result<()> {
        let _write_guard = self.write_mutex.lock().expect("lock is poisoned");

        let (root_page, mut free_pages, generation, mut next_page) = {
            let state = self.state.read().expect("lock is poisoned");
            (state.root_page, state.free_pages.clone(), state.generation, state.next_page)
        };

        let mut data_file = OpenOptions::new().read(true).write(true).open(&self.data_path)?;
        let mut orphaned = Vec::new();

        let mut allocate = |free_pages: &mut Vec<u64>, next_page: &mut u64| -> u64 {
            free_pages.pop().unwrap_or_else(|| {
                let page = *next_page;
                *next_page += 1;
                page
            })
        };

        let new_root = match root_page {
            None => {
                let page = allocate(&mut free_pages, &mut next_page);
                self.write_page(&mut data_file, page, &Node::Leaf { keys: vec![key], values: vec![value] })?;
                page
            }
            Some(root_page) => {
                match self.insert_into(&mut data_file, root_page, key, value, &mut free_pages, &mut next_page, &mut orphaned)? {
                    InsertOutcome::Written(page) => page,
                    InsertOutcome::Split { left, split_key, right } => {
                        let page = allocate(&mut free_pages, &mut next_page);
                        self.write_page(
                            &mut data_file,
                            page,
                            &Node::Internal { keys: vec![split_key], children: vec![left, right] },
                        )?;
                        page
                    }
                }
            }
        };

        free_pages.extend(orphaned);

        let free_list_page = if free_pages.is_empty() {
            None
        } else {
            let page = allocate(&mut free_pages, &mut next_page);
            let bytes = encode_free_list(&free_pages, self.config.page_size);
            data_file.seek(SeekFrom::Start(page * self.config.page_size as u64))?;
            data_file.write_all(&bytes)?;
            Some(page)
        };

        data_file.sync_data()?;

        let generation = generation + 1;
        let trailer = ManifestTrailer { root_page: Some(new_root), free_list_page, generation };

        let mut manifest = OpenOptions::new().append(true).open(&self.manifest_path)?;
        manifest.write_all(&trailer.encode())?;
        manifest.sync_data()?;

        let mut state = self.state.write().expect("lock is poisoned");
        state.root_page = Some(new_root);
        state.free_pages = free_pages;
        state.generation = generation;
        state.next_page = next_page;

        Ok(())
    }

    fn write_page(&self, data_file: &mut File, page: u64, node: &Node) -> Result<()> {
        let bytes = encode_page(node, self.config.page_size)?;
        data_file.seek(SeekFrom::Start(page * self.config.page_size as u64))?;
        data_file.write_all(&bytes)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_into(
        &self,
        data_file: &mut File,
        page: u64,
        key: PartitionId,
        value: PartitionMetaData,
        free_pages: &mut Vec<u64>,
        next_page: &mut u64,
        orphaned: &mut Vec<u64>,
    ) -> Result<InsertOutcome> {
        let mut allocate = |free_pages: &mut Vec<u64>, next_page: &mut u64| -> u64 {
            free_pages.pop().unwrap_or_else(|| {
                let p = *next_page;
                *next_page += 1;
                p
            })
        };

        let node = self.read_page(data_file, page)?;
        orphaned.push(page);

        match node {
            Node::Leaf { mut keys, mut values } => {
                match keys.binary_search(&key) {
                    Ok(idx) => values[idx] = value,
                    Err(idx) => {
                        keys.insert(idx, key);
                        values.insert(idx, value);
                    }
                }

                if keys.len() < self.config.order {
                    let new_page = allocate(free_pages, next_page);
                    self.write_page(data_file, new_page, &Node::Leaf { keys, values })?;
                    Ok(InsertOutcome::Written(new_page))
                } else {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_values = values.split_off(mid);
                    let split_key = right_keys[0].clone();

                    let left_page = allocate(free_pages, next_page);
                    self.write_page(data_file, left_page, &Node::Leaf { keys, values })?;

                    let right_page = allocate(free_pages, next_page);
                    self.write_page(data_file, right_page, &Node::Leaf { keys: right_keys, values: right_values })?;

                    Ok(InsertOutcome::Split { left: left_page, split_key, right: right_page })
                }
            }
            Node::Internal { mut keys, mut children } => {
                let idx = crate::binary_search::partition_point(&keys, |k| k <= &key);

                match self.insert_into(data_file, children[idx], key, value, free_pages, next_page, orphaned)? {
                    InsertOutcome::Written(new_child) => {
                        children[idx] = new_child;
                        let new_page = allocate(free_pages, next_page);
                        self.write_page(data_file, new_page, &Node::Internal { keys, children })?;
                        Ok(InsertOutcome::Written(new_page))
                    }
                    InsertOutcome::Split { left, split_key, right } => {
                        children[idx] = left;
                        children.insert(idx + 1, right);
                        keys.insert(idx, split_key);

                        if children.len() <= self.config.order {
                            let new_page = allocate(free_pages, next_page);
                            self.write_page(data_file, new_page, &Node::Internal { keys, children })?;
                            Ok(InsertOutcome::Written(new_page))
                        } else {
                            let mid = keys.len() / 2;
                            let split_key = keys[mid].clone();

                            let right_keys = keys.split_off(mid + 1);
                            keys.truncate(mid);
                            let right_children = children.split_off(mid + 1);

                            let left_page = allocate(free_pages, next_page);
                            self.write_page(data_file, left_page, &Node::Internal { keys, children })?;

                            let right_page = allocate(free_pages, next_page);
                            self.write_page(data_file, right_page, &Node::Internal { keys: right_keys, children: right_children })?;

                            Ok(InsertOutcome::Split { left: left_page, split_key, right: right_page })
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Range;
    use std::collections::BTreeMap;
    use test_log::test;

    fn pid(n: i64) -> PartitionId {
        PartitionId::new("db", "temps", Range::new(n, n + 1))
    }

    fn meta(n: i64) -> PartitionMetaData {
        PartitionMetaData {
            range: Range::new(n, n + 1),
            file_size: n as u64,
            block_positions: BTreeMap::new(),
            replay_position: crate::replay_position::ReplayPosition::new(0, n as u64),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = BPlusTreeConfig { order: 4, page_size: 4096 };
        let tree = BPlusTree::open(dir.path(), config).unwrap();

        tree.insert(pid(1), meta(1)).unwrap();
        tree.insert(pid(2), meta(2)).unwrap();

        assert_eq!(Some(meta(1)), tree.get(&pid(1)).unwrap());
        assert_eq!(Some(meta(2)), tree.get(&pid(2)).unwrap());
        assert_eq!(None, tree.get(&pid(3)).unwrap());
    }

    #[test]
    fn insert_enough_keys_to_force_a_split() {
        let dir = tempfile::tempdir().unwrap();
        let config = BPlusTreeConfig { order: 4, page_size: 4096 };
        let tree = BPlusTree::open(dir.path(), config).unwrap();

        for n in 0..50 {
            tree.insert(pid(n), meta(n)).unwrap();
        }

        for n in 0..50 {
            assert_eq!(Some(meta(n)), tree.get(&pid(n)).unwrap());
        }
    }

    #[test]
    fn range_yields_ascending_keys_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let config = BPlusTreeConfig { order: 4, page_size: 4096 };
        let tree = BPlusTree::open(dir.path(), config).unwrap();

        for n in 0..20 {
            tree.insert(pid(n), meta(n)).unwrap();
        }

        let results = tree.range(&pid(5), &pid(10)).unwrap();
        let keys: Vec<_> = results.iter().map(|(k, _)| k.range.lower).collect();
        assert_eq!(vec![5, 6, 7, 8, 9, 10], keys);
    }

    #[test]
    fn reopening_recovers_the_published_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = BPlusTreeConfig { order: 4, page_size: 4096 };

        {
            let tree = BPlusTree::open(dir.path(), config).unwrap();
            for n in 0..10 {
                tree.insert(pid(n), meta(n)).unwrap();
            }
        }

        let reopened = BPlusTree::open(dir.path(), config).unwrap();
        for n in 0..10 {
            assert_eq!(Some(meta(n)), reopened.get(&pid(n)).unwrap());
        }
    }
}
