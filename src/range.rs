// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Timestamp ranges.
//!
//! [`Range`] is used both for partition boundaries (half-open,
//! `PartitionId`) and block boundaries (closed, `Block::header`).
//! [`RangeSet`] is the query-side union of ranges a read or block
//! lookup filters against.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A closed interval `[lower, upper]` of timestamps.
///
/// Partition ranges are conventionally treated as half-open
/// (`[lower, upper)`) by the code that constructs them; `Range` itself
/// just stores the two bounds and leaves open/closed semantics to the
/// caller, matching how block ranges (always closed) and partition
/// ranges share the same wire shape (`lower:8][upper:8`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range {
    /// Inclusive lower bound of the range.
    pub lower: i64,
    /// Inclusive upper bound of the range.
    pub upper: i64,
}

impl Range {
    #[must_use]
    /// Creates a new range from `lower` to `upper`.
    pub fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    /// `true` if `ts` falls within `[lower, upper]`.
    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.lower && ts <= self.upper
    }

    /// `true` if the closed intervals `self` and `other` share any point.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    /// The smallest range containing both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(self.lower.min(other.lower), self.upper.max(other.upper))
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

impl Encode for Range {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64::<BigEndian>(self.lower)?;
        writer.write_i64::<BigEndian>(self.upper)?;
        Ok(())
    }
}

impl Decode for Range {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let lower = reader.read_i64::<BigEndian>()?;
        let upper = reader.read_i64::<BigEndian>()?;
        Ok(Self::new(lower, upper))
    }
}

/// A union of timestamp ranges used to filter reads.
///
/// An inverted query bound (`lower > upper`) is handled by
/// [`RangeSet::from_bounds`] discarding it and yielding the empty set
/// rather than treating it as an error.
#[derive(Clone, Debug, Default)]
pub struct RangeSet(Vec<Range>);

impl RangeSet {
    /// The empty range set; matches nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// The range set covering every timestamp.
    #[must_use]
    pub fn all() -> Self {
        Self(vec![Range::new(i64::MIN, i64::MAX)])
    }

    /// Builds a single-range set from `[lower, upper]`.
    ///
    /// If `lower > upper` (an inverted query bound), returns the empty
    /// set instead of erroring.
    #[must_use]
    pub fn from_bounds(lower: i64, upper: i64) -> Self {
        if lower > upper {
            Self::empty()
        } else {
            Self(vec![Range::new(lower, upper)])
        }
    }

    /// Adds `range` to the set.
    pub fn push(&mut self, range: Range) {
        self.0.push(range);
    }

    /// `true` if `range` overlaps any range in this set.
    #[must_use]
    pub fn overlaps(&self, range: &Range) -> bool {
        self.0.iter().any(|r| r.overlaps(range))
    }

    /// `true` if `ts` falls in any range in this set.
    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        self.0.iter().any(|r| r.contains(ts))
    }

    /// `true` if the set contains no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the underlying ranges.
    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn range_overlap_is_symmetric_and_inclusive() {
        let a = Range::new(0, 10);
        let b = Range::new(10, 20);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&Range::new(11, 20)));
    }

    #[test]
    fn inverted_bounds_produce_empty_range_set() {
        let set = RangeSet::from_bounds(20, 10);
        assert!(set.is_empty());
        assert!(!set.contains(15));
    }

    #[test]
    fn range_roundtrips_through_encode_decode() {
        let range = Range::new(-5, 5);
        let bytes = range.encode_into_vec();
        let decoded = Range::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(range, decoded);
    }
}
