//! Per-transaction chunked record storage.
//!
//! Records belonging to one transaction arrive interleaved with everybody
//! else's. The store keeps them as up to `chunks_per_tx` direct references
//! into the producer's ring ("chunks"), avoiding any copy for transactions
//! that complete while their words are still inside the ring window. When a
//! reference can no longer be trusted, or the chunk budget runs out, the
//! store promotes to a private buffer grown by doubling.
//!
//! Invariant: once any word lives in the private buffer, every later append
//! goes to the buffer too. Chunks and buffer never interleave.

use crate::record::Record;

/// A direct reference into the producer ring.
///
/// `offset` is the cumulative word offset of this chunk within the
/// transaction, i.e. the sum of all prior chunk lengths.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    start: *const u32,
    len: usize,
    offset: usize,
}

/// Iteration state over a [`RecordStore`]; also the persistent scan position
/// of the assembler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StorePos {
    pub chunk: usize,
    pub offset: usize,
}

/// Record words of one transaction, in insertion order.
#[derive(Debug, Default)]
pub(crate) struct RecordStore {
    chunks: Vec<Chunk>,
    buf: Vec<u32>,
    len_words: usize,
}

impl RecordStore {
    /// Total stored length in words.
    #[inline]
    pub fn len_words(&self) -> usize {
        self.len_words
    }

    /// True while at least one chunk still references the ring.
    #[inline]
    pub fn has_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// The record heading the oldest chunk, used by the eviction guard.
    pub fn first_chunk_record(&self) -> Option<Record> {
        // SAFETY: chunk spans start at a record header; validity is probed
        // by the caller before any dereference.
        self.chunks
            .first()
            .map(|c| unsafe { Record::from_ptr(c.start) })
    }

    /// Appends a span of `len` words starting at `rec`.
    ///
    /// With `must_copy` unset and chunk budget left, the span is kept as a
    /// ring reference; otherwise it is copied into the private buffer,
    /// promoting any existing chunks first. Returns `true` when this append
    /// created the store's first chunk (the transaction now references the
    /// ring and belongs on the ring-referencing queue).
    pub fn append(
        &mut self,
        rec: Record,
        len: usize,
        must_copy: bool,
        max_chunks: usize,
        min_buffer_words: usize,
    ) -> bool {
        if len == 0 {
            return false;
        }

        // Can't mix buffer and ring references
        let copy = must_copy || (self.len_words > 0 && self.chunks.is_empty());

        if !copy && self.chunks.len() < max_chunks {
            let first = self.chunks.is_empty();
            self.chunks.push(Chunk {
                start: rec.as_ptr(),
                len,
                offset: self.len_words,
            });
            self.len_words += len;
            return first;
        }

        self.reserve_buf(self.len_words + len, min_buffer_words);
        if !self.chunks.is_empty() {
            self.copy_chunks_into_buf();
        }
        debug_assert!(self.chunks.is_empty());
        // SAFETY: the dispatcher appends spans straight off the cursor, whose
        // eviction guard just probed them readable.
        unsafe {
            self.buf
                .extend_from_slice(std::slice::from_raw_parts(rec.as_ptr(), len));
        }
        self.len_words += len;
        false
    }

    /// Copies every chunk into the private buffer and drops the ring
    /// references. Idempotent.
    pub fn promote_to_buffer(&mut self, min_buffer_words: usize) {
        if self.chunks.is_empty() {
            return;
        }
        self.reserve_buf(self.len_words, min_buffer_words);
        self.copy_chunks_into_buf();
    }

    fn copy_chunks_into_buf(&mut self) {
        debug_assert!(self.buf.is_empty());
        for i in 0..self.chunks.len() {
            let Chunk { start, len, offset } = self.chunks[i];
            debug_assert_eq!(offset, self.buf.len());
            // SAFETY: promotion runs while the guard still reports the chunk
            // readable (OverwriteImminent at worst, never Lost).
            unsafe {
                self.buf
                    .extend_from_slice(std::slice::from_raw_parts(start, len));
            }
        }
        self.chunks.clear();
        debug_assert_eq!(self.buf.len(), self.len_words);
    }

    /// Grows the buffer capacity by doubling from `min_buffer_words` until
    /// it holds `need` words.
    fn reserve_buf(&mut self, need: usize, min_buffer_words: usize) {
        let mut size = self.buf.capacity();
        if size >= need {
            return;
        }
        if size == 0 {
            size = min_buffer_words.max(1);
        }
        while size < need {
            size *= 2;
        }
        self.buf.reserve_exact(size - self.buf.len());
    }

    /// Yields the record at `pos` and advances. Records are returned in
    /// insertion order; batch headers advance by their header only so the
    /// enclosed records follow one by one.
    pub fn next_record(&self, pos: &mut StorePos) -> Option<Record> {
        debug_assert!(pos.offset <= self.len_words);
        if pos.offset >= self.len_words {
            return None;
        }

        let rec = if self.chunks.is_empty() {
            debug_assert!(pos.offset < self.buf.len());
            // SAFETY: offset < buf.len() and every stored span starts at a
            // record header.
            unsafe { Record::from_ptr(self.buf.as_ptr().add(pos.offset)) }
        } else {
            let mut chunk = &self.chunks[pos.chunk];
            debug_assert!(pos.offset >= chunk.offset);
            if pos.offset == chunk.offset + chunk.len {
                pos.chunk += 1;
                chunk = &self.chunks[pos.chunk];
            }
            // SAFETY: offset lies inside this chunk's span; the eviction
            // guard keeps chunk references readable for the duration of a
            // scan or callback.
            unsafe { Record::from_ptr(chunk.start.add(pos.offset - chunk.offset)) }
        };
        pos.offset += rec.next_words();
        debug_assert!(pos.offset <= self.len_words);
        Some(rec)
    }

    /// Words currently held as ring references.
    pub fn chunk_words(&self) -> usize {
        self.chunks.iter().map(|c| c.len).sum()
    }

    /// Words currently held in the private buffer.
    pub fn buffered_words(&self) -> usize {
        self.buf.len()
    }

    /// Resets the store for shell reuse; the buffer keeps its capacity.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buf.clear();
        self.len_words = 0;
    }
}
