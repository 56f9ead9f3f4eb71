// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CRC32 checksums.
//!
//! Block headers, file trailers, commit-log frames, and the B+-tree
//! manifest all carry a 4-byte CRC field, so checksums here are plain
//! CRC32-IEEE via `crc32fast` rather than a wider hash.

use crate::error::Error;

/// A 32-bit checksum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(u32);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Checksum {
    /// Wraps a checksum value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw 32-bit integer.
    #[must_use]
    pub fn into_u32(self) -> u32 {
        self.0
    }

    /// Computes the checksum of `bytes` directly.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(crc32fast::hash(bytes))
    }

    pub(crate) fn check(&self, expected: Self) -> crate::error::Result<()> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                expected,
                got: *self,
            })
        }
    }
}

/// A [`std::io::Write`] wrapper that CRC32-hashes everything written
/// through it, so the checksum can be finalized once the writer is
/// done without a separate buffering pass.
pub struct ChecksummedWriter<W: std::io::Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: std::io::Write> ChecksummedWriter<W> {
    /// Wraps `writer` in a new checksumming writer.
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Returns the checksum of all bytes written so far.
    pub fn checksum(&self) -> Checksum {
        Checksum::from_raw(self.hasher.clone().finalize())
    }

    /// Returns a mutable reference to the wrapped writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consumes this wrapper, returning the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: std::io::Write> std::io::Write for ChecksummedWriter<W> {
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.inner.write(buf)
    }
}

/// A [`std::io::Read`] wrapper that CRC32-hashes everything read
/// through it, for verifying a trailing checksum against the bytes
/// that preceded it without buffering them separately.
pub struct ChecksummedReader<R: std::io::Read> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: std::io::Read> ChecksummedReader<R> {
    /// Wraps `reader` in a new checksumming reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: reader,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Returns the checksum of all bytes read so far.
    pub fn checksum(&self) -> Checksum {
        Checksum::from_raw(self.hasher.clone().finalize())
    }

    /// Reads directly from the inner reader, bypassing the hasher;
    /// used to consume the trailing checksum field itself.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: std::io::Read> std::io::Read for ChecksummedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use test_log::test;

    #[test]
    fn checksum_matches_direct_hash() {
        let mut buf = Vec::new();
        let mut writer = ChecksummedWriter::new(&mut buf);
        writer.write_all(b"hello horizon").unwrap();
        assert_eq!(Checksum::of(b"hello horizon"), writer.checksum());
    }

    #[test]
    fn checksummed_reader_matches_writer() {
        let mut buf = Vec::new();
        ChecksummedWriter::new(&mut buf).write_all(b"round trip").unwrap();

        let mut reader = ChecksummedReader::new(&buf[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(b"round trip".to_vec(), out);
        assert_eq!(Checksum::of(b"round trip"), reader.checksum());
    }

    #[test]
    fn check_rejects_mismatch() {
        let a = Checksum::of(b"a");
        let b = Checksum::of(b"b");
        assert!(a.check(a).is_ok());
        assert!(a.check(b).is_err());
    }
}
