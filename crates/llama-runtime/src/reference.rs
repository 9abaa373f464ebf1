//! CPU reference engine.
//!
//! A deterministic stand-in for a real llama.cpp context. It keeps a genuine
//! position-indexed KV cache with llama.cpp's remove/shift semantics, but the
//! "model" is a hash: the logits after a decode are a pure function of the
//! model file and the tokens resident at or before the output position.
//!
//! That makes the engine useful for two things:
//! - Running the session and CLI end to end without model weights
//! - Checking cache bookkeeping: any stale or misplaced cell changes the
//!   logits, so a session that mismanages the cache produces different text

use std::collections::BTreeMap;
use std::sync::Arc;

use llama_engine::{
    Batch, LlamaBackend, LlamaContext, LlamaError, LoadParams, Result, SamplerChain, SeqId,
    TokenId, MAIN_SEQ,
};
use llama_tokenizer::{ByteTokenizer, Tokenizer};
use tracing::{debug, info};

use crate::counters::EngineCounters;

/// Spread of generated logits.
const LOGIT_SCALE: f32 = 8.0;

/// Subtracted from the end-of-generation logit so responses are not cut
/// short on most prompts.
const EOS_PENALTY: f32 = 3.0;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Loads [`ReferenceContext`]s from any readable file.
///
/// The file's bytes seed the hash, so two different files behave like two
/// different models.
#[derive(Debug, Default)]
pub struct ReferenceBackend {
    counters: Arc<EngineCounters>,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters shared by every context this backend loads.
    pub fn counters(&self) -> Arc<EngineCounters> {
        Arc::clone(&self.counters)
    }
}

impl LlamaBackend for ReferenceBackend {
    type Context = ReferenceContext;

    fn load(&self, params: &LoadParams) -> Result<ReferenceContext> {
        if params.model_path.is_empty() {
            return Err(LlamaError::ModelLoad("model path is empty".to_string()));
        }
        let bytes = std::fs::read(&params.model_path)
            .map_err(|e| LlamaError::ModelLoad(format!("{}: {}", params.model_path, e)))?;

        if params.n_ctx == 0 {
            return Err(LlamaError::ContextInit("n_ctx must be > 0".to_string()));
        }
        if params.n_batch == 0 {
            return Err(LlamaError::ContextInit("n_batch must be > 0".to_string()));
        }

        self.counters.record_load();
        info!(
            model = %params.model_path,
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            "reference context loaded"
        );

        Ok(ReferenceContext {
            tokenizer: ByteTokenizer::new(),
            seed: fnv1a(FNV_OFFSET, &bytes),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            cells: BTreeMap::new(),
            logits: None,
            counters: Arc::clone(&self.counters),
        })
    }
}

/// A loaded reference model with its KV cache.
#[derive(Debug)]
pub struct ReferenceContext {
    tokenizer: ByteTokenizer,
    seed: u64,
    n_ctx: usize,
    n_batch: usize,
    /// Position -> token for the main sequence.
    cells: BTreeMap<usize, TokenId>,
    /// Logits of the most recent output entry.
    logits: Option<Vec<f32>>,
    counters: Arc<EngineCounters>,
}

impl ReferenceContext {
    /// Tokens resident in the cache, in position order.
    pub fn resident(&self) -> Vec<TokenId> {
        self.cells.values().copied().collect()
    }

    /// Occupied positions, ascending.
    pub fn positions(&self) -> Vec<usize> {
        self.cells.keys().copied().collect()
    }

    /// Logits of the last decoded output, if any.
    pub fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    /// Position the next decoded token must occupy.
    fn next_pos(&self) -> usize {
        self.cells.keys().next_back().map_or(0, |&p| p + 1)
    }

    fn check_seq(seq: SeqId) -> Result<()> {
        if seq != MAIN_SEQ {
            return Err(LlamaError::Cache(format!("unknown sequence {}", seq)));
        }
        Ok(())
    }

    fn compute_logits(&self, upto: usize) -> Vec<f32> {
        let hash = self
            .cells
            .range(..=upto)
            .fold(self.seed, |h, (_, &t)| fnv1a(h, &t.to_le_bytes()));

        (0..ByteTokenizer::VOCAB_SIZE as TokenId)
            .map(|id| {
                let printable = (0x20..0x7F).contains(&id);
                if !printable && id != ByteTokenizer::EOS {
                    return f32::NEG_INFINITY;
                }
                let x = splitmix64(hash ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let logit = (x >> 40) as f32 / (1u64 << 24) as f32 * LOGIT_SCALE;
                if id == ByteTokenizer::EOS {
                    logit - EOS_PENALTY
                } else {
                    logit
                }
            })
            .collect()
    }
}

impl LlamaContext for ReferenceContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        self.tokenizer
            .encode(text, add_special, parse_special)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Err(LlamaError::Decode("empty batch".to_string()));
        }
        if batch.len() > self.n_batch {
            return Err(LlamaError::Decode(format!(
                "batch of {} exceeds n_batch {}",
                batch.len(),
                self.n_batch
            )));
        }

        let start = self.next_pos();
        for (i, (&pos, &seq)) in batch.positions().iter().zip(batch.seq_ids()).enumerate() {
            Self::check_seq(seq)?;
            if pos >= self.n_ctx {
                return Err(LlamaError::Decode(format!(
                    "position {} outside context of {}",
                    pos, self.n_ctx
                )));
            }
            if pos != start + i {
                return Err(LlamaError::Decode(format!(
                    "position {} is not contiguous (expected {})",
                    pos,
                    start + i
                )));
            }
        }

        for (&token, &pos) in batch.tokens().iter().zip(batch.positions()) {
            self.cells.insert(pos, token);
        }

        let last_output = batch
            .positions()
            .iter()
            .zip(batch.logits())
            .filter(|(_, wants)| **wants)
            .map(|(&pos, _)| pos)
            .last();
        if let Some(pos) = last_output {
            self.logits = Some(self.compute_logits(pos));
        }

        self.counters.record_decode(batch.len());
        Ok(())
    }

    fn sample(&mut self, chain: &mut SamplerChain) -> Result<TokenId> {
        let logits = self.logits.as_deref().ok_or_else(|| {
            LlamaError::Sampling("no logits: decode a batch with output first".to_string())
        })?;
        let token = chain.sample(logits)? as TokenId;
        self.counters.record_sample();
        Ok(token)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        self.tokenizer
            .token_to_piece(token)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.tokenizer.is_eog(token)
    }

    fn cache_remove(&mut self, seq: SeqId, start: usize, end: Option<usize>) -> Result<()> {
        Self::check_seq(seq)?;
        let end = end.unwrap_or(usize::MAX);
        if start > end {
            return Err(LlamaError::Cache(format!("invalid range [{}, {})", start, end)));
        }
        self.cells.retain(|&pos, _| pos < start || pos >= end);
        self.counters.record_remove();
        Ok(())
    }

    fn cache_shift(&mut self, seq: SeqId, start: usize, end: Option<usize>, delta: isize) -> Result<()> {
        Self::check_seq(seq)?;
        let end = end.unwrap_or(usize::MAX);
        if start > end {
            return Err(LlamaError::Cache(format!("invalid range [{}, {})", start, end)));
        }

        let moved: Vec<(usize, TokenId)> = self
            .cells
            .range(start..end)
            .map(|(&pos, &token)| (pos, token))
            .collect();

        let mut shifted = Vec::with_capacity(moved.len());
        for &(pos, token) in &moved {
            let new_pos = pos.checked_add_signed(delta).ok_or_else(|| {
                LlamaError::Cache(format!("shift of {} moves position {} below zero", delta, pos))
            })?;
            let collides = (new_pos < start || new_pos >= end) && self.cells.contains_key(&new_pos);
            if collides {
                return Err(LlamaError::Cache(format!(
                    "shift of {} moves position {} onto occupied {}",
                    delta, pos, new_pos
                )));
            }
            shifted.push((new_pos, token));
        }

        for (pos, _) in &moved {
            self.cells.remove(pos);
        }
        self.cells.extend(shifted);

        debug!(start, delta, moved = moved.len(), "cache shifted");
        self.counters.record_shift();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    fn load(n_ctx: usize) -> (ReferenceContext, tempfile::NamedTempFile) {
        let file = model_file(b"reference model");
        let params = LoadParams::new(file.path().to_string_lossy()).with_context_size(n_ctx);
        let ctx = ReferenceBackend::new().load(&params).unwrap();
        (ctx, file)
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = ReferenceBackend::new()
            .load(&LoadParams::new("/nonexistent/model.gguf"))
            .unwrap_err();
        assert!(matches!(err, LlamaError::ModelLoad(_)));
    }

    #[test]
    fn load_rejects_zero_context() {
        let file = model_file(b"m");
        let params = LoadParams::new(file.path().to_string_lossy()).with_context_size(0);
        let err = ReferenceBackend::new().load(&params).unwrap_err();
        assert!(matches!(err, LlamaError::ContextInit(_)));
    }

    #[test]
    fn decode_requires_contiguous_positions() {
        let (mut ctx, _f) = load(32);
        let mut batch = Batch::with_capacity(4);
        batch.fill(&[1, 2], 0, true);
        ctx.decode(&batch).unwrap();

        batch.single(3, 5);
        assert!(matches!(ctx.decode(&batch), Err(LlamaError::Decode(_))));
        assert_eq!(ctx.resident(), vec![1, 2]);
    }

    #[test]
    fn decode_rejects_position_past_context() {
        let (mut ctx, _f) = load(2);
        let mut batch = Batch::with_capacity(3);
        batch.fill(&[1, 2, 3], 0, true);
        assert!(matches!(ctx.decode(&batch), Err(LlamaError::Decode(_))));
        assert!(ctx.resident().is_empty());
    }

    #[test]
    fn sample_without_logits_errors() {
        let (mut ctx, _f) = load(8);
        let mut chain = SamplerChain::from_params(&llama_sampling::SamplingParams::greedy());
        assert!(matches!(ctx.sample(&mut chain), Err(LlamaError::Sampling(_))));
    }

    #[test]
    fn sampled_tokens_are_printable_or_eos() {
        let (mut ctx, _f) = load(64);
        let mut batch = Batch::with_capacity(8);
        batch.fill(&[ByteTokenizer::BOS, 104, 105], 0, true);
        ctx.decode(&batch).unwrap();

        let mut chain = SamplerChain::from_params(&llama_sampling::SamplingParams::default());
        for _ in 0..20 {
            let token = ctx.sample(&mut chain).unwrap();
            assert!((0x20..0x7F).contains(&token) || token == ByteTokenizer::EOS);
        }
    }

    #[test]
    fn logits_depend_on_model_file() {
        let a = model_file(b"model a");
        let b = model_file(b"model b");
        let backend = ReferenceBackend::new();
        let mut ctx_a = backend
            .load(&LoadParams::new(a.path().to_string_lossy()))
            .unwrap();
        let mut ctx_b = backend
            .load(&LoadParams::new(b.path().to_string_lossy()))
            .unwrap();

        let mut batch = Batch::with_capacity(2);
        batch.fill(&[1, 2], 0, true);
        ctx_a.decode(&batch).unwrap();
        ctx_b.decode(&batch).unwrap();
        assert_ne!(ctx_a.logits(), ctx_b.logits());
        assert_eq!(backend.counters().snapshot().loads, 2);
    }

    #[test]
    fn shift_onto_occupied_cell_errors() {
        let (mut ctx, _f) = load(16);
        let mut batch = Batch::with_capacity(4);
        batch.fill(&[1, 2, 3, 4], 0, true);
        ctx.decode(&batch).unwrap();

        let err = ctx.cache_shift(MAIN_SEQ, 2, None, -1).unwrap_err();
        assert!(matches!(err, LlamaError::Cache(_)));
        assert_eq!(ctx.positions(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn other_sequences_are_rejected() {
        let (mut ctx, _f) = load(16);
        assert!(ctx.cache_remove(1, 0, None).is_err());
        assert!(ctx.cache_shift(1, 0, None, -1).is_err());
    }
}
