//! Character-boundary assembly for streamed token pieces.
//!
//! Engines hand back raw bytes per token, and a multi-byte character is often
//! split across two or more tokens. [`Utf8Assembler`] holds bytes back until the
//! buffer ends on a character boundary, so a consumer never sees half a
//! character.

/// Whether `bytes` ends on a complete UTF-8 character.
///
/// Scans at most the last four bytes, walking back over continuation bytes
/// until a lead byte is found. A lead byte is complete only when exactly the
/// number of continuation bytes it announces follows it. ASCII, invalid lead
/// bytes, and a run of continuation bytes with no lead in reach all count as
/// complete, so malformed input cannot be buffered forever.
pub fn is_complete_utf8(bytes: &[u8]) -> bool {
    for (i, &b) in bytes.iter().rev().take(4).enumerate() {
        if b & 0xC0 == 0x80 {
            continue;
        }
        return if b & 0xE0 == 0xC0 {
            i == 1
        } else if b & 0xF0 == 0xE0 {
            i == 2
        } else if b & 0xF8 == 0xF0 {
            i == 3
        } else {
            true
        };
    }
    true
}

/// Accumulates byte fragments and releases them on character boundaries.
///
/// Invariant: between emissions the buffer holds at most the trailing bytes of
/// one partial character (plus whatever malformed input preceded it).
#[derive(Debug, Clone, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `fragment`; return the whole buffer if it now ends on a boundary.
    pub fn accept(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(fragment);
        if self.pending.is_empty() || !is_complete_utf8(&self.pending) {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Return and clear the buffer regardless of completeness.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
