// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A growable read-ahead byte cache fronting a connection's socket.
//!
//! `FastStream` is the single place that turns "I need N more bytes" into
//! socket reads. The chunk protocol (`rtmpkit_proto::chunk`) consumes bytes
//! through [`FastStream::read_slice`]/[`FastStream::bytes`] without copying,
//! including the rewind needed to probe an ambiguous type-3 extended
//! timestamp. One instance per connection, single-consumer — it carries no
//! internal locking. The handshake reads fixed-size blocks directly off the
//! socket instead: every field it reads has a size known in advance, so it
//! never needs read-ahead or rewind.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default capacity (bytes) a fresh [`FastStream`] allocates.
pub const DEFAULT_CAPACITY: usize = 128 * 1024;

/// Hard cap on how large the buffer is allowed to grow, regardless of how
/// large a caller asks `grow` for.
pub const MAX_CAPACITY: usize = 256 * 1024;

/// Grow-on-demand read cache. Bytes flow in at the tail (via `grow`) and are
/// consumed from the head (via `read_slice`/`skip`).
pub struct FastStream {
    buf: Vec<u8>,
    /// Index of the first unconsumed byte.
    pos: usize,
    /// Index one past the last filled byte.
    filled: usize,
    max_capacity: usize,
}

impl FastStream {
    /// Creates a buffer with the default initial capacity and hard cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, MAX_CAPACITY)
    }

    /// Creates a buffer with an explicit initial capacity and hard cap.
    #[must_use]
    pub fn with_capacity(initial: usize, max_capacity: usize) -> Self {
        Self { buf: vec![0; initial], pos: 0, filled: 0, max_capacity }
    }

    /// Number of unconsumed bytes currently cached.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.filled - self.pos
    }

    /// Borrow of the unconsumed bytes, for schema-sniffing (e.g. probing the
    /// proxy prologue or extended-timestamp bytes) without consuming them.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    /// Consumes and returns a slice of `size` bytes. The caller must have
    /// already ensured at least `size` bytes are available via [`Self::grow`].
    ///
    /// # Panics
    /// Panics if fewer than `size` bytes are cached; callers must `grow`
    /// first, mirroring the original's "assert buffer already grow(size)".
    pub fn read_slice(&mut self, size: usize) -> &[u8] {
        assert!(self.size() >= size, "read_slice({size}) without a prior grow");
        let start = self.pos;
        self.pos += size;
        &self.buf[start..start + size]
    }

    /// Moves the read cursor by `delta` bytes, which may be negative to
    /// rewind (used by the chunk protocol's extended-timestamp probing).
    /// Never consumes past the filled region or before the start of buffer.
    pub fn skip(&mut self, delta: isize) {
        let new_pos = self.pos as isize + delta;
        assert!(new_pos >= 0 && (new_pos as usize) <= self.filled, "skip out of bounds");
        self.pos = new_pos as usize;
    }

    /// Ensures at least `required` unconsumed bytes are cached, reading from
    /// `reader` as needed. Compacts (moves residual bytes to the front) when
    /// there isn't enough trailing free space but total capacity suffices;
    /// grows the backing `Vec` when even that isn't enough, up to
    /// `max_capacity`.
    ///
    /// # Errors
    /// Returns [`Error::Resource`] if `required` exceeds `max_capacity`.
    pub async fn grow<R: AsyncRead + Unpin>(&mut self, reader: &mut R, required: usize) -> Result<()> {
        if required > self.max_capacity {
            return Err(Error::Resource(format!(
                "required {required} bytes exceeds buffer cap {}",
                self.max_capacity
            )));
        }

        while self.size() < required {
            self.ensure_tail_space(required)?;
            let n = reader.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed while filling buffer",
                )));
            }
            self.filled += n;
        }
        Ok(())
    }

    /// Makes sure there is room to read more bytes into the tail without
    /// exceeding `max_capacity`: compacts first, then grows the `Vec` if
    /// compaction alone isn't enough.
    fn ensure_tail_space(&mut self, required: usize) -> Result<()> {
        let needed_extra = required.saturating_sub(self.size());
        if self.buf.len() - self.filled >= needed_extra {
            return Ok(());
        }

        // Compact: slide unconsumed bytes to the front to reclaim leading space.
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }

        if self.buf.len() - self.filled < needed_extra {
            let needed_total = self.filled + needed_extra;
            if needed_total > self.max_capacity {
                return Err(Error::Resource(format!(
                    "buffer would need to grow to {needed_total} bytes, exceeding cap {}",
                    self.max_capacity
                )));
            }
            let new_len = needed_total.max(self.buf.len() * 2).min(self.max_capacity);
            self.buf.resize(new_len, 0);
        }
        Ok(())
    }
}

impl Default for FastStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_grow_and_read_slice() {
        let mut fs = FastStream::new();
        let mut reader = Cursor::new(vec![1u8, 2, 3, 4, 5]);
        fs.grow(&mut reader, 3).await.unwrap();
        assert_eq!(fs.read_slice(3), &[1, 2, 3]);
        fs.grow(&mut reader, 2).await.unwrap();
        assert_eq!(fs.read_slice(2), &[4, 5]);
    }

    #[tokio::test]
    async fn test_grow_compacts_before_growing_capacity() {
        let mut fs = FastStream::with_capacity(8, 256 * 1024);
        let data: Vec<u8> = (0..20).collect();
        let mut reader = Cursor::new(data.clone());
        fs.grow(&mut reader, 5).await.unwrap();
        let _ = fs.read_slice(5);
        fs.grow(&mut reader, 10).await.unwrap();
        assert_eq!(fs.read_slice(10), &data[5..15]);
    }

    #[tokio::test]
    async fn test_overflow_rejected_at_cap() {
        let mut fs = FastStream::with_capacity(16, 32);
        let mut reader = Cursor::new(vec![0u8; 64]);
        let err = fs.grow(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn test_grow_up_to_cap_succeeds() {
        let mut fs = FastStream::with_capacity(16, 32);
        let mut reader = Cursor::new(vec![7u8; 32]);
        fs.grow(&mut reader, 32).await.unwrap();
        assert_eq!(fs.size(), 32);
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_io_error() {
        let mut fs = FastStream::new();
        let mut reader = Cursor::new(vec![1u8, 2]);
        let err = fs.grow(&mut reader, 5).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_skip_negative_rewinds() {
        let mut fs = FastStream::with_capacity(16, 32);
        fs.buf[0..4].copy_from_slice(&[1, 2, 3, 4]);
        fs.filled = 4;
        fs.pos = 4;
        fs.skip(-4);
        assert_eq!(fs.read_slice(4), &[1, 2, 3, 4]);
    }
}
