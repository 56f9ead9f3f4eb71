// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The record data model.
//!
//! A [`Record`] is a fixed-schema tuple of [`Field`]s whose first field
//! is always a timestamp. The timestamp is the sole partitioning key;
//! every other field type is comparable only within its own type,
//! matching the schema/definition catalog that lives outside this
//! crate's scope.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::slice::Slice;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Unit a timestamp [`Field`] is expressed in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TimeUnit {
    /// Milliseconds since the Unix epoch.
    Millis,
    /// Microseconds since the Unix epoch.
    Micros,
    /// Nanoseconds since the Unix epoch.
    Nanos,
}

impl TryFrom<u8> for TimeUnit {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Millis),
            1 => Ok(Self::Micros),
            2 => Ok(Self::Nanos),
            _ => Err(()),
        }
    }
}

impl From<TimeUnit> for u8 {
    fn from(value: TimeUnit) -> Self {
        match value {
            TimeUnit::Millis => 0,
            TimeUnit::Micros => 1,
            TimeUnit::Nanos => 2,
        }
    }
}

/// A typed field value.
///
/// Timestamps are the only field type used for partitioning and block
/// range bounds; all comparisons are only ever performed within a
/// single field type (the schema catalog, out of scope here, is
/// responsible for guaranteeing type-consistent columns).
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    /// A timestamp, carrying its unit.
    Timestamp(TimeUnit, i64),
    /// A signed 64-bit integer.
    Integer(i64),
    /// A decimal expressed as `mantissa * 10^exponent`.
    Decimal {
        /// The decimal's mantissa.
        mantissa: i64,
        /// The decimal's base-10 exponent.
        exponent: i32,
    },
    /// An opaque byte payload.
    Byte(Slice),
}

/// Tag byte identifying a [`Field`] variant on the wire.
pub(crate) const TAG_TIMESTAMP: u8 = 0;
pub(crate) const TAG_INTEGER: u8 = 1;
pub(crate) const TAG_DECIMAL: u8 = 2;
pub(crate) const TAG_BYTE: u8 = 3;

impl Field {
    /// Returns the wire tag for this field's variant.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Timestamp(..) => TAG_TIMESTAMP,
            Self::Integer(_) => TAG_INTEGER,
            Self::Decimal { .. } => TAG_DECIMAL,
            Self::Byte(_) => TAG_BYTE,
        }
    }

    /// Returns the raw timestamp value, if this is a [`Field::Timestamp`].
    #[must_use]
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Self::Timestamp(_, value) => Some(*value),
            _ => None,
        }
    }
}

/// Full (non-delta) wire encoding, used by commit-log frames, which
/// must be self-describing and independent of any delta chain, unlike
/// the delta encoding blocks use.
impl Encode for Field {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(self.tag())?;

        match self {
            Self::Timestamp(unit, value) => {
                writer.write_u8((*unit).into())?;
                writer.write_i64_varint(*value)?;
            }
            Self::Integer(value) => writer.write_i64_varint(*value)?,
            Self::Decimal { mantissa, exponent } => {
                writer.write_i64_varint(*mantissa)?;
                writer.write_i32_varint(*exponent)?;
            }
            Self::Byte(bytes) => {
                writer.write_u32_varint(bytes.len() as u32)?;
                writer.write_all(bytes)?;
            }
        }

        Ok(())
    }
}

impl Decode for Field {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            TAG_TIMESTAMP => {
                let unit_byte = reader.read_u8()?;
                let unit = TimeUnit::try_from(unit_byte).map_err(|()| DecodeError::InvalidTag(("TimeUnit", unit_byte)))?;
                let value = reader.read_i64_varint()?;
                Ok(Self::Timestamp(unit, value))
            }
            TAG_INTEGER => Ok(Self::Integer(reader.read_i64_varint()?)),
            TAG_DECIMAL => {
                let mantissa = reader.read_i64_varint()?;
                let exponent = reader.read_i32_varint()?;
                Ok(Self::Decimal { mantissa, exponent })
            }
            TAG_BYTE => {
                let len = reader.read_u32_varint()? as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                Ok(Self::Byte(Slice::from(bytes)))
            }
            tag => Err(DecodeError::InvalidTag(("Field", tag))),
        }
    }
}

/// A single fixed-schema data point.
///
/// `fields[0]` is always the timestamp. `record_type` identifies the
/// schema this record belongs to, used both for per-type delta
/// encoding and for read-side filtering by record type.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Identifies which schema/type this record's fields follow.
    pub record_type: u32,
    /// Field values, first of which is always the timestamp.
    pub fields: Vec<Field>,
}

impl Record {
    /// Builds a record from a type tag and its fields.
    ///
    /// # Panics
    ///
    /// Panics if `fields` is empty or its first field is not a timestamp.
    #[must_use]
    pub fn new(record_type: u32, fields: Vec<Field>) -> Self {
        assert!(!fields.is_empty(), "record must have at least a timestamp field");
        assert!(
            matches!(fields[0], Field::Timestamp(..)),
            "record's first field must be a timestamp"
        );
        Self { record_type, fields }
    }

    /// Returns this record's timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the record was constructed without going through
    /// [`Record::new`]'s invariant check.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        #[allow(clippy::expect_used)]
        self.fields
            .first()
            .and_then(Field::as_timestamp)
            .expect("record's first field must be a timestamp")
    }

    /// Orders two records the way a flushed block stores them:
    /// `(timestamp, record_type)` ascending.
    #[must_use]
    pub fn sort_key(&self) -> (i64, u32) {
        (self.timestamp(), self.record_type)
    }
}

impl Encode for Record {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32_varint(self.record_type)?;
        writer.write_u32_varint(self.fields.len() as u32)?;

        for field in &self.fields {
            field.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for Record {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let record_type = reader.read_u32_varint()?;
        let field_count = reader.read_u32_varint()?;

        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(Field::decode_from(reader)?);
        }

        Ok(Self { record_type, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn record_timestamp_is_first_field() {
        let record = Record::new(
            7,
            vec![Field::Timestamp(TimeUnit::Nanos, 42), Field::Integer(1)],
        );
        assert_eq!(42, record.timestamp());
        assert_eq!((42, 7), record.sort_key());
    }

    #[test]
    #[should_panic(expected = "timestamp")]
    fn record_without_timestamp_panics() {
        Record::new(0, vec![Field::Integer(1)]);
    }

    #[test]
    fn record_roundtrips_through_full_encode_decode() {
        let record = Record::new(
            3,
            vec![
                Field::Timestamp(TimeUnit::Micros, -7),
                Field::Decimal { mantissa: 150, exponent: -2 },
                Field::Byte(Slice::from(b"payload".as_slice())),
            ],
        );

        let bytes = record.encode_into_vec();
        let decoded = Record::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(record, decoded);
    }
}
