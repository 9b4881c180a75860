// Licensed under the Apache-2.0 license

//! Chunk-boundary-safe package reading
//!
//! The parser never sees the caller's chunk boundaries. [`ChunkReader`]
//! persists the partial state of whichever field is currently being
//! read: `gather` accumulates small fields into a staging buffer across
//! any number of `feed` calls, `skip` discards ignored bytes without
//! storing them, and `span` hands large payload runs through without
//! copying. Every byte consumed by any of the three is folded into the
//! running package CRC in stream order.

use crc32fast::Hasher;

/// Staging capacity; the largest field ever gathered in one piece.
pub const VALUE_SCRATCH: usize = 1024;

pub struct ChunkReader {
    staging: [u8; VALUE_SCRATCH],
    /// Bytes accumulated toward the field being gathered.
    filled: usize,
    /// Bytes discarded toward the field being skipped.
    skipped: usize,
    crc: Hasher,
    /// Absolute package offset of the next unconsumed byte.
    offset: u64,
}

impl ChunkReader {
    pub fn new() -> Self {
        ChunkReader {
            staging: [0; VALUE_SCRATCH],
            filled: 0,
            skipped: 0,
            crc: Hasher::new(),
            offset: 0,
        }
    }

    /// Forget all progress; the next byte fed is package offset zero.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.skipped = 0;
        self.crc = Hasher::new();
        self.offset = 0;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes held toward a field that has not completed yet.
    pub fn pending(&self) -> usize {
        self.filled + self.skipped
    }

    /// CRC-32 of every byte consumed so far.
    pub fn crc_snapshot(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Begin consuming one caller chunk.
    pub fn feed<'r, 'i>(&'r mut self, input: &'i [u8]) -> Feed<'r, 'i> {
        Feed {
            reader: self,
            input,
            pos: 0,
        }
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        ChunkReader::new()
    }
}

/// Cursor over one caller chunk. Dropping it mid-field is fine; the
/// reader resumes the field on the next chunk.
pub struct Feed<'r, 'i> {
    reader: &'r mut ChunkReader,
    input: &'i [u8],
    pos: usize,
}

impl<'r, 'i> Feed<'r, 'i> {
    /// Accumulate a field of `needed` bytes (at most [`VALUE_SCRATCH`]).
    /// Returns the completed field, or `None` when the chunk ran out
    /// first; the partial bytes are kept for the next chunk.
    pub fn gather(&mut self, needed: usize) -> Option<&[u8]> {
        let want = needed - self.reader.filled;
        let take = want.min(self.input.len() - self.pos);
        let src = &self.input[self.pos..self.pos + take];
        self.reader.staging[self.reader.filled..self.reader.filled + take].copy_from_slice(src);
        self.consume(take);
        self.reader.filled += take;
        if self.reader.filled == needed {
            self.reader.filled = 0;
            Some(&self.reader.staging[..needed])
        } else {
            None
        }
    }

    /// Discard a field of `needed` bytes without storing it. Returns true
    /// once the whole field has been consumed.
    pub fn skip(&mut self, needed: usize) -> bool {
        let want = needed - self.reader.skipped;
        let take = want.min(self.input.len() - self.pos);
        self.consume(take);
        self.reader.skipped += take;
        if self.reader.skipped == needed {
            self.reader.skipped = 0;
            true
        } else {
            false
        }
    }

    /// Take up to `max` bytes straight out of the chunk, without copying.
    /// May return an empty slice when the chunk is exhausted.
    pub fn span(&mut self, max: usize) -> &'i [u8] {
        let take = max.min(self.input.len() - self.pos);
        let out = &self.input[self.pos..self.pos + take];
        self.consume(take);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.input.len()
    }

    /// Bytes consumed from this chunk so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// CRC-32 of everything consumed up to this point, including from
    /// earlier chunks.
    pub fn crc_snapshot(&self) -> u32 {
        self.reader.crc_snapshot()
    }

    fn consume(&mut self, take: usize) {
        self.reader
            .crc
            .update(&self.input[self.pos..self.pos + take]);
        self.pos += take;
        self.reader.offset += take as u64;
    }
}
