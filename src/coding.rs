// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic bytes or structural header did not match what was expected.
    #[error("invalid header for {0}")]
    InvalidHeader(&'static str),

    /// Version byte is not a version this build understands.
    #[error("invalid version")]
    InvalidVersion,

    /// An enum tag byte had no matching variant.
    #[error("invalid tag for {}: {}", .0.0, .0.1)]
    InvalidTag((&'static str, u8)),

    /// Reader ended before the expected structure was fully read.
    #[error("unexpected end of input while decoding {0}")]
    UnexpectedEof(&'static str),

    /// A zero-delta field marker was read with no preceding record of
    /// that type to copy the value from.
    #[error("delta field in {0} has no base record")]
    MissingDeltaBase(&'static str),
}

/// Trait to serialize stuff.
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        #[allow(clippy::expect_used)]
        self.encode_into(&mut v).expect("writing to a Vec cannot fail");
        v
    }
}

/// Trait to deserialize stuff.
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
