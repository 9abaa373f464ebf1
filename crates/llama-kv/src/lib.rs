//! # llama-kv
//!
//! KV cache bookkeeping for llama.rs sessions.
//!
//! The engine owns the cache memory. This crate owns the session's view of it:
//! - **Prefix matching**: how much of a new prompt is already resident
//! - **Context shift**: when the cache must make room, and which span to evict
//! - **Token history**: the mirror of what the cache holds, position by position
//!
//! Everything here is pure and deterministic, so the eviction arithmetic can be
//! tested without an engine.

use llama_engine::TokenId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error type for cache bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("Eviction window [{start}, {end}) exceeds history length {len}")]
    WindowOutOfRange { start: usize, end: usize, len: usize },

    #[error("{len} resident + {additional} new tokens exceed cache capacity {capacity}")]
    CapacityExceeded {
        len: usize,
        additional: usize,
        capacity: usize,
    },
}

pub type KVResult<T> = std::result::Result<T, KVError>;

/// Length of the longest common prefix of `old` and `new`.
///
/// Symmetric, and never larger than the shorter input.
pub fn common_prefix_len<T: PartialEq>(old: &[T], new: &[T]) -> usize {
    old.iter().zip(new).take_while(|(a, b)| a == b).count()
}

// ---------------------------------------------------------------------------
// CacheWindow
// ---------------------------------------------------------------------------

/// One context shift: keep `[0, keep)`, evict `[keep, keep + discard_count)`,
/// and slide everything after the evicted span down by `discard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheWindow {
    /// Leading positions that are never evicted.
    pub keep: usize,
    /// First evicted position (always equal to `keep`).
    pub discard_start: usize,
    /// Number of evicted positions.
    pub discard_count: usize,
    /// Position delta applied to the surviving tail (`-discard_count`).
    pub shift_amount: isize,
}

impl CacheWindow {
    pub fn new(keep: usize, discard_count: usize) -> Self {
        Self {
            keep,
            discard_start: keep,
            discard_count,
            shift_amount: -(discard_count as isize),
        }
    }

    /// One past the last evicted position.
    pub fn discard_end(&self) -> usize {
        self.discard_start + self.discard_count
    }

    /// Length of a sequence of `old_len` after this window is applied.
    pub fn remaining_len(&self, old_len: usize) -> usize {
        old_len.saturating_sub(self.discard_count.min(old_len.saturating_sub(self.keep)))
    }

    /// New position of the entry at `pos`, or `None` if it is evicted.
    pub fn remap(&self, pos: usize) -> Option<usize> {
        if pos < self.discard_start {
            Some(pos)
        } else if pos < self.discard_end() {
            None
        } else {
            Some(pos - self.discard_count)
        }
    }
}

impl fmt::Display for CacheWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[keep:{}, discard:{}..{}, shift:{}]",
            self.keep,
            self.discard_start,
            self.discard_end(),
            self.shift_amount
        )
    }
}

// ---------------------------------------------------------------------------
// ShiftPolicy
// ---------------------------------------------------------------------------

pub const DEFAULT_SAFETY_MARGIN: usize = 64;
pub const DEFAULT_MIN_DISCARD: usize = 128;
pub const DEFAULT_RESERVED_FOR_GENERATION: usize = 128;

/// When to shift the context, and how much to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftPolicy {
    /// Positions kept free below capacity before a shift is forced.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,

    /// Smallest eviction worth the cost of a shift.
    #[serde(default = "default_min_discard")]
    pub min_discard: usize,

    /// Positions a prompt leaves free for the response.
    #[serde(default = "default_reserved_for_generation")]
    pub reserved_for_generation: usize,
}

fn default_safety_margin() -> usize {
    DEFAULT_SAFETY_MARGIN
}
fn default_min_discard() -> usize {
    DEFAULT_MIN_DISCARD
}
fn default_reserved_for_generation() -> usize {
    DEFAULT_RESERVED_FOR_GENERATION
}

impl Default for ShiftPolicy {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            min_discard: DEFAULT_MIN_DISCARD,
            reserved_for_generation: DEFAULT_RESERVED_FOR_GENERATION,
        }
    }
}

impl ShiftPolicy {
    /// Whether appending `new_tokens` to `past` resident positions would cross
    /// `capacity - safety_margin`.
    pub fn needs_shift(&self, past: usize, new_tokens: usize, capacity: usize) -> bool {
        past + new_tokens > capacity.saturating_sub(self.safety_margin)
    }

    /// Eviction for a cache holding `past` positions whose first `keep` must
    /// survive.
    ///
    /// Evicts half the stale region, at least `min_discard`, never more than
    /// the stale region itself. `None` when nothing is stale.
    pub fn plan(&self, past: usize, keep: usize) -> Option<CacheWindow> {
        let stale = past.saturating_sub(keep);
        if stale == 0 {
            return None;
        }
        let discard = (stale / 2).max(self.min_discard).min(stale);
        Some(CacheWindow::new(keep, discard))
    }

    /// Longest prompt accepted for a cache of `capacity`. Always at least 1.
    pub fn max_prompt_len(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.reserved_for_generation).max(1)
    }
}

// ---------------------------------------------------------------------------
// TokenHistory
// ---------------------------------------------------------------------------

/// The tokens resident in the cache, in position order.
///
/// Invariant: `tokens[p]` is the token at cache position `p`, and the cache
/// holds nothing past `len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenHistory {
    tokens: Vec<TokenId>,
}

impl TokenHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    pub fn extend_from_slice(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    pub fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// Number of leading tokens shared with `prompt`.
    pub fn common_prefix(&self, prompt: &[TokenId]) -> usize {
        common_prefix_len(&self.tokens, prompt)
    }

    /// Mirror a context shift: drop the evicted span and close the gap.
    pub fn apply(&mut self, window: &CacheWindow) -> KVResult<()> {
        let end = window.discard_end();
        if end > self.tokens.len() {
            return Err(KVError::WindowOutOfRange {
                start: window.discard_start,
                end,
                len: self.tokens.len(),
            });
        }
        self.tokens.drain(window.discard_start..end);
        Ok(())
    }

    /// Check that `additional` more tokens fit a cache of `capacity`.
    pub fn check_capacity(&self, additional: usize, capacity: usize) -> KVResult<()> {
        if self.tokens.len().saturating_add(additional) > capacity {
            return Err(KVError::CapacityExceeded {
                len: self.tokens.len(),
                additional,
                capacity,
            });
        }
        Ok(())
    }
}

impl fmt::Display for TokenHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenHistory(len={})", self.tokens.len())
    }
}
