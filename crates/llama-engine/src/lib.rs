//! # llama-engine
//!
//! The "narrow waist" of the llama.rs session stack. Defines the capability
//! contract a session needs from an inference engine ([`LlamaBackend`] and
//! [`LlamaContext`]) and the types shared by every other crate. Implementations
//! can swap llama.cpp FFI, CPU reference, or mock backends without changing
//! session code.
//!
//! ## Design Notes
//!
//! ### Backend vs. context
//! A [`LlamaBackend`] is a factory: it turns [`LoadParams`] into a loaded model
//! plus inference context. The context owns the KV cache and is the only thing
//! a session talks to while generating. Dropping the context releases the
//! engine resources.
//!
//! ### Positions
//! Cache positions are `usize` and packed from 0. Range ends are `Option<usize>`
//! where `None` means "to the end of the sequence".
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

use serde::{Deserialize, Serialize};

pub use llama_sampling::SamplerChain;

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Sequence ID inside a context. Sessions use a single sequence.
pub type SeqId = i32;

/// The sequence every session writes to.
pub const MAIN_SEQ: SeqId = 0;

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context creation failed: {0}")]
    ContextInit(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Sampling failed: {0}")]
    Sampling(String),
    #[error("KV cache operation failed: {0}")]
    Cache(String),
}

impl From<llama_sampling::SamplingError> for LlamaError {
    fn from(e: llama_sampling::SamplingError) -> Self {
        LlamaError::Sampling(e.to_string())
    }
}

/// Storage type for the K and V caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheType {
    F16,
    Q8_0,
}

/// Specification for loading a model and creating its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    /// Path to the model file.
    #[serde(default)]
    pub model_path: String,

    /// Memory-map the model file instead of reading it.
    #[serde(default = "default_true")]
    pub use_mmap: bool,

    /// Pin the model in RAM.
    #[serde(default = "default_true")]
    pub use_mlock: bool,

    /// Threads for decode and batch decode.
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,

    /// Context size; becomes the session's cache capacity.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Largest batch the context accepts in one decode call.
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    #[serde(default = "default_kv_cache_type")]
    pub kv_cache_type: KvCacheType,
}

fn default_true() -> bool {
    true
}
fn default_n_threads() -> usize {
    4
}
fn default_n_ctx() -> usize {
    2048
}
fn default_n_batch() -> usize {
    512
}
fn default_kv_cache_type() -> KvCacheType {
    KvCacheType::Q8_0
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            use_mmap: default_true(),
            use_mlock: default_true(),
            n_threads: default_n_threads(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            kv_cache_type: default_kv_cache_type(),
        }
    }
}

impl LoadParams {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_context_size(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }
}

/// Input to one decode call: tokens, their cache positions, their sequence,
/// and whether each one needs output logits.
///
/// Owned and reusable: [`Batch::fill`] and [`Batch::single`] clear and refill
/// the same buffers, so a session allocates once.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<usize>,
    seq_ids: Vec<SeqId>,
    logits: Vec<bool>,
}

impl Batch {
    pub fn with_capacity(n_tokens: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(n_tokens),
            positions: Vec::with_capacity(n_tokens),
            seq_ids: Vec::with_capacity(n_tokens),
            logits: Vec::with_capacity(n_tokens),
        }
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.seq_ids.clear();
        self.logits.clear();
    }

    pub fn push(&mut self, token: TokenId, pos: usize, seq: SeqId, logits: bool) {
        self.tokens.push(token);
        self.positions.push(pos);
        self.seq_ids.push(seq);
        self.logits.push(logits);
    }

    /// Refill with a contiguous run of `tokens` starting at `start_pos` on the
    /// main sequence. Only the last token requests logits, and only when
    /// `output_last` is set.
    pub fn fill(&mut self, tokens: &[TokenId], start_pos: usize, output_last: bool) {
        self.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            self.push(token, start_pos + i, MAIN_SEQ, output_last && i == last);
        }
    }

    /// Refill with one token that requests logits.
    pub fn single(&mut self, token: TokenId, pos: usize) {
        self.clear();
        self.push(token, pos, MAIN_SEQ, true);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn seq_ids(&self) -> &[SeqId] {
        &self.seq_ids
    }

    pub fn logits(&self) -> &[bool] {
        &self.logits
    }

    /// Number of entries that request output logits.
    pub fn n_outputs(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }
}

/// Factory for loaded contexts.
pub trait LlamaBackend: Send + Sync {
    type Context: LlamaContext;

    /// Load the model and create its inference context.
    ///
    /// On error nothing is retained: partially constructed resources are
    /// released before returning.
    fn load(&self, params: &LoadParams) -> Result<Self::Context>;
}

/// A loaded model plus its inference context and KV cache.
///
/// Methods that touch the cache take `&mut self`; a session serializes all
/// calls behind its own lock.
pub trait LlamaContext: Send {
    /// Maximum number of cache positions.
    fn n_ctx(&self) -> usize;

    /// Convert text into token IDs.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Run the forward pass over a batch, writing its tokens into the cache.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Select the next token from the logits of the last decoded output.
    fn sample(&mut self, chain: &mut SamplerChain) -> Result<TokenId>;

    /// Raw bytes for one token. May end mid-character.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    /// Whether `token` signals the end of generation.
    fn is_eog(&self, token: TokenId) -> bool;

    /// Remove cache entries of `seq` with positions in `[start, end)`.
    fn cache_remove(&mut self, seq: SeqId, start: usize, end: Option<usize>) -> Result<()>;

    /// Add `delta` to the position of every entry of `seq` in `[start, end)`.
    fn cache_shift(&mut self, seq: SeqId, start: usize, end: Option<usize>, delta: isize)
        -> Result<()>;
}
