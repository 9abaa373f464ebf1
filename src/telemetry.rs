//! Per-turn timing.
//!
//! [`InferenceTimer`] records when prefill ends and each token is produced,
//! and turns that into the [`GenerationStats`] attached to every
//! [`Generation`](crate::Generation).

use std::time::Instant;

/// Work and timing for one generation turn.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    /// Prompt length after tokenization and truncation.
    pub prompt_tokens: usize,
    /// Prompt tokens already resident in the cache and not decoded again.
    pub reused_tokens: usize,
    /// Prompt tokens decoded during prefill.
    pub prefilled_tokens: usize,
    /// Tokens sampled and decoded during the loop.
    pub generated_tokens: usize,
    /// Wall time from the start of the turn to the end of prefill.
    pub prefill_ms: f64,
    /// Wall time of the autoregressive loop.
    pub decode_ms: f64,
    /// Decode throughput. Excludes prefill.
    pub tokens_per_second: f64,
}

/// Records timestamps during a turn to compute [`GenerationStats`].
///
/// Usage:
/// 1. [`InferenceTimer::start`] when the request is accepted
/// 2. [`InferenceTimer::mark_prefill_complete`] after the last prefill chunk
/// 3. [`InferenceTimer::mark_token`] after each successful decode step
/// 4. [`InferenceTimer::finish`] to compute the stats
#[derive(Debug)]
pub struct InferenceTimer {
    start: Instant,
    prefill_end: Option<Instant>,
    prompt_tokens: usize,
    reused_tokens: usize,
    prefilled_tokens: usize,
    token_count: usize,
}

impl InferenceTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            prefill_end: None,
            prompt_tokens: 0,
            reused_tokens: 0,
            prefilled_tokens: 0,
            token_count: 0,
        }
    }

    /// Record the prompt split: `reused` positions kept, `prefilled` decoded.
    pub fn set_prompt(&mut self, prompt_tokens: usize, reused: usize, prefilled: usize) {
        self.prompt_tokens = prompt_tokens;
        self.reused_tokens = reused;
        self.prefilled_tokens = prefilled;
    }

    pub fn mark_prefill_complete(&mut self) {
        self.prefill_end = Some(Instant::now());
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
    }

    pub fn generated(&self) -> usize {
        self.token_count
    }

    pub fn finish(&self) -> GenerationStats {
        let total_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let prefill_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(total_ms);

        let decode_ms = (total_ms - prefill_ms).max(0.0);
        let tokens_per_second = if decode_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_ms / 1000.0)
        } else {
            0.0
        };

        GenerationStats {
            prompt_tokens: self.prompt_tokens,
            reused_tokens: self.reused_tokens,
            prefilled_tokens: self.prefilled_tokens,
            generated_tokens: self.token_count,
            prefill_ms,
            decode_ms,
            tokens_per_second,
        }
    }
}
