//! Prefill chunking.
//!
//! A prompt segment is decoded in fixed-size chunks so peak engine memory is
//! bounded by the chunk size rather than the prompt length. Only the globally
//! last token requests output logits; that is the one the first sample reads.

use llama_engine::{Batch, TokenId};

/// Default chunk size. Small enough for memory-constrained devices.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// A contiguous run of prompt tokens and where it lands in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub tokens: &'a [TokenId],
    pub start_pos: usize,
    /// Set only on the chunk holding the final token.
    pub output_last: bool,
}

impl Chunk<'_> {
    /// Clear `batch` and refill it with this chunk.
    pub fn load_into(&self, batch: &mut Batch) {
        batch.fill(self.tokens, self.start_pos, self.output_last);
    }

    /// One past the last position this chunk occupies.
    pub fn end_pos(&self) -> usize {
        self.start_pos + self.tokens.len()
    }
}

/// Lazy iterator over the chunks of one prompt segment.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    inner: std::slice::Chunks<'a, TokenId>,
    next_pos: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        let tokens = self.inner.next()?;
        let start_pos = self.next_pos;
        self.next_pos += tokens.len();
        Some(Chunk {
            tokens,
            start_pos,
            output_last: self.inner.len() == 0,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Split `tokens` into chunks of at most `chunk_size`, positioned from
/// `start_pos`. A `chunk_size` of 0 is treated as 1.
pub fn chunks(tokens: &[TokenId], start_pos: usize, chunk_size: usize) -> Chunks<'_> {
    Chunks {
        inner: tokens.chunks(chunk_size.max(1)),
        next_pos: start_pos,
    }
}
