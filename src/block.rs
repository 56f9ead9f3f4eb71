// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The block codec.
//!
//! A block is a sealed, CRC-protected, optionally compressed run of
//! records ordered by `(timestamp, recordType)`. Records after the
//! first of a given record type are delta-encoded against the running
//! "last record per type" vector the caller threads through
//! [`encode`] and [`decode`].

use crate::checksum::Checksum;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::compression::{self, CompressionType};
use crate::error::{Error, Result};
use crate::field::{self, Field, Record, TimeUnit};
use crate::range::Range;
use crate::slice::Slice;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Self-describing header preceding a block's payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Closed interval of timestamps covered by this block.
    pub range: Range,
    /// Size of the record payload before compression.
    pub uncompressed_size: u32,
    /// Size of the record payload as stored (after compression).
    pub compressed_size: u32,
    /// Number of records in this block.
    pub record_count: u32,
    /// Compression applied to the stored payload.
    pub compression: CompressionType,
    /// CRC32 of the stored (possibly compressed) payload.
    pub crc32: Checksum,
}

impl Encode for BlockHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32_varint(self.record_count)?;
        writer.write_u32_varint(self.uncompressed_size)?;
        writer.write_u32_varint(self.compressed_size)?;
        self.compression.encode_into(writer)?;
        self.range.encode_into(writer)?;
        writer.write_u32::<BigEndian>(self.crc32.into_u32())?;
        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let record_count = reader.read_u32_varint()?;
        let uncompressed_size = reader.read_u32_varint()?;
        let compressed_size = reader.read_u32_varint()?;
        let compression = CompressionType::decode_from(reader)?;
        let range = Range::decode_from(reader)?;
        let crc32 = Checksum::from_raw(reader.read_u32::<BigEndian>()?);

        Ok(Self {
            range,
            uncompressed_size,
            compressed_size,
            record_count,
            compression,
            crc32,
        })
    }
}

/// A sealed, self-contained run of records.
///
/// Immutable once constructed by [`encode`]; `payload` holds the bytes
/// exactly as stored on disk (compressed, if `header.compression` says
/// so).
#[derive(Clone, Debug)]
pub struct Block {
    /// Decoded record payload of a sealed block.
    pub header: BlockHeader,
    /// Stored (possibly compressed) payload bytes.
    pub payload: Slice,
}

impl Encode for Block {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        self.header.encode_into(writer)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }
}

impl Decode for Block {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(reader)?;
        let mut payload = vec![0u8; header.compressed_size as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| DecodeError::UnexpectedEof("Block::payload"))?;
        Ok(Self {
            header,
            payload: Slice::from(payload),
        })
    }
}

/// Sorts and delta-encodes `records` into a sealed [`Block`].
///
/// `last_record_per_type` is updated in place so a subsequent call
/// encoding the next block continues the delta chain.
///
/// # Panics
///
/// Panics if `records` is empty; callers are expected to seal a block
/// only once it holds at least one record.
pub fn encode(
    records: &[Record],
    last_record_per_type: &mut HashMap<u32, Record>,
    compression: CompressionType,
) -> Block {
    assert!(!records.is_empty(), "cannot encode an empty block");

    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by_key(|r| r.sort_key());

    let mut uncompressed = Vec::new();

    for record in &sorted {
        let last = last_record_per_type.get(&record.record_type);
        encode_record(record, last, &mut uncompressed);
        last_record_per_type.insert(record.record_type, (*record).clone());
    }

    let lower = sorted.first().expect("non-empty").timestamp();
    let upper = sorted.last().expect("non-empty").timestamp();
    let range = Range::new(lower, upper);

    let uncompressed_size = uncompressed.len() as u32;
    let payload = compression::compress(compression, &uncompressed);
    let compressed_size = payload.len() as u32;
    let crc32 = Checksum::of(&payload);

    Block {
        header: BlockHeader {
            range,
            uncompressed_size,
            compressed_size,
            record_count: sorted.len() as u32,
            compression,
            crc32,
        },
        payload: Slice::from(payload),
    }
}

fn encode_record(record: &Record, last: Option<&Record>, out: &mut Vec<u8>) {
    out.write_u32_varint(record.record_type).expect("writing to a Vec cannot fail");

    for (idx, field) in record.fields.iter().enumerate() {
        let last_field = last.and_then(|r| r.fields.get(idx));
        encode_field(field, last_field, out).expect("writing to a Vec cannot fail");
    }
}

fn encode_field<W: Write>(field: &Field, last: Option<&Field>, writer: &mut W) -> std::io::Result<()> {
    writer.write_u8(field.tag())?;

    if last == Some(field) {
        writer.write_u8(0)?;
        return Ok(());
    }

    writer.write_u8(1)?;

    match field {
        Field::Timestamp(unit, value) => {
            writer.write_u8((*unit).into())?;
            let base = match last {
                Some(Field::Timestamp(_, v)) => *v,
                _ => 0,
            };
            writer.write_i64_varint(value - base)?;
        }
        Field::Integer(value) => {
            let base = match last {
                Some(Field::Integer(v)) => *v,
                _ => 0,
            };
            writer.write_i64_varint(value - base)?;
        }
        Field::Decimal { mantissa, exponent } => {
            let (base_m, base_e) = match last {
                Some(Field::Decimal { mantissa, exponent }) => (*mantissa, *exponent),
                _ => (0, 0),
            };
            writer.write_i64_varint(mantissa - base_m)?;
            writer.write_i32_varint(exponent - base_e)?;
        }
        Field::Byte(bytes) => {
            writer.write_u32_varint(bytes.len() as u32)?;
            writer.write_all(bytes)?;
        }
    }

    Ok(())
}

/// Decodes `block`, verifying its CRC before yielding any record.
///
/// Decoding is strictly streaming: the only buffer held is the
/// block's own (decompressed) payload.
///
/// # Errors
///
/// Returns [`Error::ChecksumMismatch`] if the stored CRC does not
/// match the payload. Errors from a malformed record invalidate the
/// rest of the block; the returned iterator's `next()` call will
/// surface the same error on the call where the corruption was found
/// and yield `None` afterwards.
pub fn decode<'a>(
    block: &Block,
    last_record_per_type: &'a mut HashMap<u32, Record>,
) -> Result<BlockRecords<'a>> {
    block.header.crc32.check(Checksum::of(&block.payload))?;

    let decompressed = compression::decompress(block.header.compression, &block.payload)?;

    Ok(BlockRecords {
        cursor: Cursor::new(decompressed),
        remaining: block.header.record_count,
        last_record_per_type,
        poisoned: false,
    })
}

/// Streaming iterator over the records of a decoded block.
pub struct BlockRecords<'a> {
    cursor: Cursor<Vec<u8>>,
    remaining: u32,
    last_record_per_type: &'a mut HashMap<u32, Record>,
    poisoned: bool,
}

impl Iterator for BlockRecords<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;

        match decode_record(&mut self.cursor, self.last_record_per_type) {
            Ok(record) => {
                self.last_record_per_type
                    .insert(record.record_type, record.clone());
                Some(Ok(record))
            }
            Err(e) => {
                self.poisoned = true;
                Some(Err(e.into()))
            }
        }
    }
}

fn decode_record<R: Read>(
    reader: &mut R,
    last_record_per_type: &HashMap<u32, Record>,
) -> std::result::Result<Record, DecodeError> {
    let record_type = reader.read_u32_varint()?;
    let last = last_record_per_type.get(&record_type);

    // A record's field count is implied by its type's schema, which
    // lives outside this crate; we instead rely on the previous
    // record of the same type to know how many fields to expect, and
    // fall back to exactly one (the timestamp) for a type's first
    // occurrence, decoding further fields lazily is not supported.
    let field_count = last.map_or(1, |r| r.fields.len());

    let mut fields = Vec::with_capacity(field_count);

    for idx in 0..field_count {
        let last_field = last.and_then(|r| r.fields.get(idx));
        fields.push(decode_field(reader, last_field)?);
    }

    Ok(Record { record_type, fields })
}

fn decode_field<R: Read>(reader: &mut R, last: Option<&Field>) -> std::result::Result<Field, DecodeError> {
    let tag = reader.read_u8()?;
    let marker = reader.read_u8()?;

    if marker == 0 {
        return last
            .cloned()
            .ok_or(DecodeError::MissingDeltaBase("Field"));
    }

    match tag {
        field::TAG_TIMESTAMP => {
            let unit_byte = reader.read_u8()?;
            let unit = TimeUnit::try_from(unit_byte).map_err(|_| DecodeError::InvalidTag(("TimeUnit", unit_byte)))?;
            let base = match last {
                Some(Field::Timestamp(_, v)) => *v,
                _ => 0,
            };
            let delta = reader.read_i64_varint()?;
            Ok(Field::Timestamp(unit, base + delta))
        }
        field::TAG_INTEGER => {
            let base = match last {
                Some(Field::Integer(v)) => *v,
                _ => 0,
            };
            let delta = reader.read_i64_varint()?;
            Ok(Field::Integer(base + delta))
        }
        field::TAG_DECIMAL => {
            let (base_m, base_e) = match last {
                Some(Field::Decimal { mantissa, exponent }) => (*mantissa, *exponent),
                _ => (0, 0),
            };
            let delta_m = reader.read_i64_varint()?;
            let delta_e = reader.read_i32_varint()?;
            Ok(Field::Decimal {
                mantissa: base_m + delta_m,
                exponent: base_e + delta_e,
            })
        }
        field::TAG_BYTE => {
            let len = reader.read_u32_varint()? as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            Ok(Field::Byte(Slice::from(bytes)))
        }
        tag => Err(DecodeError::InvalidTag(("Field", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn record(ts: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(value)])
    }

    #[test]
    fn encode_decode_roundtrip_preserves_order_and_values() {
        let records = vec![record(300, 3), record(100, 1), record(200, 2)];

        let mut last = HashMap::new();
        let block = encode(&records, &mut last, CompressionType::None);

        assert_eq!(3, block.header.record_count);
        assert_eq!(Range::new(100, 300), block.header.range);

        let mut last = HashMap::new();
        let decoded: Result<Vec<Record>> = decode(&block, &mut last).unwrap().collect();
        let decoded = decoded.unwrap();

        assert_eq!(vec![record(100, 1), record(200, 2), record(300, 3)], decoded);
    }

    #[test]
    fn decode_fails_on_tampered_payload() {
        let records = vec![record(1, 1)];
        let mut last = HashMap::new();
        let mut block = encode(&records, &mut last, CompressionType::None);

        let mut payload = block.payload.to_vec();
        payload[0] ^= 0xFF;
        block.payload = Slice::from(payload);

        let mut last = HashMap::new();
        assert!(matches!(decode(&block, &mut last), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn unchanged_fields_encode_smaller_than_changed_ones() {
        let a = record(1, 42);
        let b = record(2, 42);

        let mut last_unchanged = HashMap::new();
        last_unchanged.insert(0u32, a.clone());
        let unchanged_block = encode(&[b.clone()], &mut last_unchanged.clone(), CompressionType::None);

        let c = record(2, 43);
        let changed_block = encode(&[c], &mut last_unchanged, CompressionType::None);

        assert!(unchanged_block.header.uncompressed_size <= changed_block.header.uncompressed_size);
    }
}
