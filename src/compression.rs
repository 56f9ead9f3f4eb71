// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm used for a block's payload, stored as a
/// single tag byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression.
    None,

    /// LZ4 compression.
    ///
    /// Recommended for use cases with a focus on speed over
    /// compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(0)?,

            #[cfg(feature = "lz4")]
            Self::Lz4 => writer.write_u8(1)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

/// Compresses `payload` under `kind`.
pub fn compress(kind: CompressionType, payload: &[u8]) -> Vec<u8> {
    match kind {
        CompressionType::None => payload.to_vec(),

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(payload),
    }
}

/// Decompresses `payload`, previously compressed under `kind`.
pub fn decompress(kind: CompressionType, payload: &[u8]) -> crate::error::Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(payload.to_vec()),

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| crate::error::Error::InvalidRecord(format!("lz4 decompress: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_serialize_none() {
        let serialized = CompressionType::None.encode_into_vec();
        assert_eq!(1, serialized.len());
        assert_eq!(CompressionType::None, CompressionType::decode_from(&mut &serialized[..]).unwrap());
    }

    #[cfg(feature = "lz4")]
    mod lz4 {
        use super::*;
        use test_log::test;

        #[test]
        fn lz4_roundtrip() {
            let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
            let compressed = compress(CompressionType::Lz4, payload);
            let decompressed = decompress(CompressionType::Lz4, &compressed).unwrap();
            assert_eq!(payload.as_slice(), decompressed.as_slice());
        }
    }
}
