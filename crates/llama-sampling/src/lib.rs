//! # llama-sampling
//!
//! Sampler chain configuration for llama.rs sessions.
//!
//! A [`SamplerChain`] is an ordered list of [`SamplerStage`]s assembled from the
//! per-request [`SamplingParams`]. The stage order is fixed and changes the
//! output distribution if altered:
//!
//! 1. Top-k filtering
//! 2. Top-p (nucleus) filtering
//! 3. Temperature scaling
//! 4. Repetition penalty over a window of recent tokens
//! 5. Categorical draw from a seeded RNG
//!
//! Engines that own their own sampler primitives only need the declarative
//! [`SamplerChain::stages`]. Engines without one (the reference CPU engine, test
//! mocks) can run the chain directly with [`SamplerChain::sample`].

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Seed used when a request does not pick one.
pub const DEFAULT_SEED: u64 = 0xFFFF_FFFF;

/// How many previously sampled tokens the repetition penalty looks back over.
pub const DEFAULT_PENALTY_LAST_N: usize = 64;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be >= 0 (got {0})")]
    InvalidTemperature(f32),
    #[error("top_p must be in (0, 1] (got {0})")]
    InvalidTopP(f32),
    #[error("Repeat penalty must be > 0 (got {0})")]
    InvalidPenalty(f32),
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 keeps only the most likely token.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-K: restrict to the K most likely tokens. 0 = unbounded.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Top-P (nucleus): smallest set whose cumulative probability reaches P. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repetition penalty (1.0 = none). Values > 1.0 discourage repetition.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Number of recently sampled tokens the penalty considers.
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: usize,

    /// Seed for the final categorical draw.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_penalty_last_n() -> usize {
    DEFAULT_PENALTY_LAST_N
}
fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            penalty_last_n: default_penalty_last_n(),
            seed: default_seed(),
        }
    }
}

impl SamplingParams {
    /// Greedy decoding: temperature 0, no filtering, no penalty.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repeat_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check that every value lies in the domain the stages accept.
    ///
    /// Sessions do not call this; out-of-domain values are the caller's
    /// responsibility. Front ends (the CLI) validate before submitting.
    pub fn validate(&self) -> SamplingResult<()> {
        if !(self.temperature >= 0.0) {
            return Err(SamplingError::InvalidTemperature(self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidTopP(self.top_p));
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(SamplingError::InvalidPenalty(self.repeat_penalty));
        }
        Ok(())
    }
}

/// One stage of a sampler chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    /// Keep the `k` highest logits. 0 = unbounded.
    TopK(usize),
    /// Keep the smallest prefix reaching cumulative probability `p`, at least `min_keep` tokens.
    TopP { p: f32, min_keep: usize },
    /// Divide logits by the temperature; `<= 0` keeps only the argmax.
    Temperature(f32),
    /// Penalize tokens seen in the last `last_n` sampled tokens.
    Penalties {
        last_n: usize,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    /// Draw from the resulting distribution.
    Dist { seed: u64 },
}

impl SamplerStage {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerStage::TopK(_) => "top-k",
            SamplerStage::TopP { .. } => "top-p",
            SamplerStage::Temperature(_) => "temp",
            SamplerStage::Penalties { .. } => "penalties",
            SamplerStage::Dist { .. } => "dist",
        }
    }
}

/// A token still eligible for selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: usize,
    pub logit: f32,
    pub p: f32,
}

/// Ordered, stateful sampler chain.
///
/// State: the RNG of the final draw and the window of recently accepted tokens
/// used by the penalty stage. One chain lives for one generation request.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    rng: SeededRng,
    recent: VecDeque<usize>,
    window: usize,
}

impl SamplerChain {
    /// Build a chain from explicit stages. The RNG is seeded from the first `Dist` stage.
    pub fn new(stages: Vec<SamplerStage>) -> Self {
        let seed = stages
            .iter()
            .find_map(|s| match s {
                SamplerStage::Dist { seed } => Some(*seed),
                _ => None,
            })
            .unwrap_or(DEFAULT_SEED);
        let window = stages
            .iter()
            .find_map(|s| match s {
                SamplerStage::Penalties { last_n, .. } => Some(*last_n),
                _ => None,
            })
            .unwrap_or(0);

        Self {
            stages,
            rng: SeededRng::new(seed),
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Assemble the fixed-order chain for a request.
    ///
    /// Frequency and presence penalties are held at zero.
    pub fn from_params(params: &SamplingParams) -> Self {
        Self::new(vec![
            SamplerStage::TopK(params.top_k),
            SamplerStage::TopP {
                p: params.top_p,
                min_keep: 1,
            },
            SamplerStage::Temperature(params.temperature),
            SamplerStage::Penalties {
                last_n: params.penalty_last_n,
                repeat: params.repeat_penalty,
                frequency: 0.0,
                presence: 0.0,
            },
            SamplerStage::Dist { seed: params.seed },
        ])
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Tokens currently inside the penalty window, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = usize> + '_ {
        self.recent.iter().copied()
    }

    /// Record a token in the penalty window.
    pub fn accept(&mut self, token: usize) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Forget the penalty window.
    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// Run every stage over `logits` and return the selected token index.
    ///
    /// The selected token is accepted into the penalty window.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate { id, logit, p: 0.0 })
            .collect();
        let mut drawn = None;

        let Self {
            stages,
            rng,
            recent,
            ..
        } = self;

        for stage in stages.iter() {
            match *stage {
                SamplerStage::TopK(k) => apply_top_k(&mut candidates, k),
                SamplerStage::TopP { p, min_keep } => apply_top_p(&mut candidates, p, min_keep),
                SamplerStage::Temperature(t) => apply_temperature(&mut candidates, t),
                SamplerStage::Penalties {
                    repeat,
                    frequency,
                    presence,
                    ..
                } => apply_penalties(&mut candidates, recent, repeat, frequency, presence),
                SamplerStage::Dist { .. } => {
                    drawn = Some(draw(&mut candidates, rng)?);
                }
            }
        }

        let token = match drawn {
            Some(token) => token,
            None => argmax(&candidates).ok_or(SamplingError::NoValidTokens)?,
        };
        self.accept(token);
        Ok(token)
    }
}

fn sort_descending(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.logit
            .partial_cmp(&a.logit)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Fill `p` with the softmax of the candidate logits.
pub fn softmax(candidates: &mut [Candidate]) {
    let max_logit = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);

    if !max_logit.is_finite() {
        let uniform = 1.0 / candidates.len().max(1) as f32;
        for c in candidates.iter_mut() {
            c.p = uniform;
        }
        return;
    }

    let mut sum = 0.0f32;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max_logit).exp();
        sum += c.p;
    }
    for c in candidates.iter_mut() {
        c.p /= sum;
    }
}

fn apply_top_k(candidates: &mut Vec<Candidate>, k: usize) {
    if k == 0 || k >= candidates.len() {
        return;
    }
    sort_descending(candidates);
    candidates.truncate(k);
}

fn apply_top_p(candidates: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    sort_descending(candidates);
    softmax(candidates);

    let mut cumsum = 0.0;
    let mut keep = candidates.len();
    for (idx, c) in candidates.iter().enumerate() {
        cumsum += c.p;
        if cumsum >= p && idx + 1 >= min_keep {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep);
}

fn apply_temperature(candidates: &mut Vec<Candidate>, temperature: f32) {
    if temperature <= 0.0 {
        if let Some(best) = argmax(candidates) {
            candidates.retain(|c| c.id == best);
        }
        return;
    }
    for c in candidates.iter_mut() {
        c.logit /= temperature;
    }
}

/// For tokens in the window, divide positive logits by the penalty and multiply
/// negative ones, so repeats always become less likely regardless of sign.
fn apply_penalties(
    candidates: &mut [Candidate],
    recent: &VecDeque<usize>,
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    let disabled = (repeat - 1.0).abs() < f32::EPSILON && frequency == 0.0 && presence == 0.0;
    if disabled || recent.is_empty() {
        return;
    }

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for &token in recent {
        *counts.entry(token).or_insert(0) += 1;
    }

    for c in candidates.iter_mut() {
        let Some(&count) = counts.get(&c.id) else {
            continue;
        };
        if c.logit > 0.0 {
            c.logit /= repeat;
        } else {
            c.logit *= repeat;
        }
        c.logit -= count as f32 * frequency + presence;
    }
}

fn argmax(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.logit
                .partial_cmp(&b.logit)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.id)
}

fn draw(candidates: &mut [Candidate], rng: &mut SeededRng) -> SamplingResult<usize> {
    if candidates.is_empty() {
        return Err(SamplingError::NoValidTokens);
    }
    softmax(candidates);

    let r = rng.next_f32();
    let mut cumsum = 0.0;
    for c in candidates.iter() {
        cumsum += c.p;
        if r < cumsum {
            return Ok(c.id);
        }
    }

    // Rounding left r above the final cumulative sum.
    candidates
        .iter()
        .rev()
        .find(|c| c.p > 0.0)
        .map(|c| c.id)
        .ok_or(SamplingError::NoValidTokens)
}
