//! Multi-turn generation session.
//!
//! A [`Session`] owns one loaded engine context and the [`TokenHistory`] that
//! mirrors its KV cache. Each [`Session::generate`] call reuses whatever prefix
//! of the new prompt is already resident, shifts the context when the cache is
//! close to full, prefills the rest in chunks, and then samples token by token
//! while streaming complete UTF-8 text to a callback.
//!
//! # Locking
//!
//! `load`, `generate`, and `unload` hold the session lock for their whole
//! duration, so they run strictly one at a time. The cancel flag and the
//! observable [`SessionState`] live outside the lock: a caller can cancel an
//! in-flight generation or poll the state without waiting.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use llama_engine::{Batch, LlamaBackend, LlamaContext, LlamaError, LoadParams, TokenId, MAIN_SEQ};
use llama_kv::{CacheWindow, ShiftPolicy, TokenHistory};
use llama_sampling::{SamplerChain, SamplingParams};
use llama_tokenizer::Utf8Assembler;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::batch::chunks;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::telemetry::{GenerationStats, InferenceTimer};

/// Default response length for [`GenerationRequest::new`].
pub const DEFAULT_MAX_TOKENS: usize = 256;

/// One turn of input.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Full conversation text. Earlier turns are matched against the cache.
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-generation token.
    Stop,
    /// `max_tokens` were generated.
    Length,
    /// The cancel flag was observed.
    Cancelled,
    /// The cache has no free position left.
    ContextFull,
    /// A decode or sample call failed. Output up to the failure is kept.
    DecodeFailed,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Cancelled => "cancelled",
            FinishReason::ContextFull => "context_full",
            FinishReason::DecodeFailed => "decode_failed",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Everything produced this turn, decoded lossily as UTF-8.
    pub text: String,
    pub finish_reason: FinishReason,
    /// The prompt did not fit and its tail was dropped.
    pub truncated: bool,
    /// Context shift performed before prefill, if any.
    pub shift: Option<CacheWindow>,
    pub stats: GenerationStats,
}

/// Lifecycle state, readable without the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Unloaded = 0,
    Loading = 1,
    Ready = 2,
    Generating = 3,
    Unloading = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Loading,
            2 => SessionState::Ready,
            3 => SessionState::Generating,
            4 => SessionState::Unloading,
            _ => SessionState::Unloaded,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// Cancels the session's current generation from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Engine context plus the session's view of its cache.
struct Loaded<C> {
    ctx: C,
    history: TokenHistory,
    /// Reused for every decode call.
    batch: Batch,
    /// Prefill chunk size: the configured batch size capped by the engine's `n_batch`.
    chunk_size: usize,
}

impl<C: LlamaContext> Loaded<C> {
    /// Drop every cache cell past the end of `history`.
    fn discard_past_history(&mut self) {
        let len = self.history.len();
        if let Err(e) = self.ctx.cache_remove(MAIN_SEQ, len, None) {
            warn!(error = %e, from = len, "failed to clear cache tail");
        }
    }

    /// Forget the whole cache.
    fn wipe(&mut self) -> std::result::Result<(), LlamaError> {
        self.history.clear();
        self.ctx.cache_remove(MAIN_SEQ, 0, None)
    }

    /// Evict `window` from the engine cache and mirror it in `history`.
    fn apply_window(&mut self, window: &CacheWindow) -> std::result::Result<(), LlamaError> {
        self.ctx
            .cache_remove(MAIN_SEQ, window.discard_start, Some(window.discard_end()))?;
        self.ctx
            .cache_shift(MAIN_SEQ, window.discard_end(), None, window.shift_amount)?;
        self.history
            .apply(window)
            .map_err(|e| LlamaError::Cache(e.to_string()))
    }

    /// Align the cache with `prompt`.
    ///
    /// Returns how many leading prompt tokens are resident at their final
    /// positions, and the shift performed, if any. On return `history` holds
    /// exactly those tokens and the cache holds nothing past them. The last
    /// prompt token is never counted as resident so prefill always produces
    /// fresh logits.
    fn align(
        &mut self,
        prompt: &[TokenId],
        policy: &ShiftPolicy,
    ) -> std::result::Result<(usize, Option<CacheWindow>), LlamaError> {
        let capacity = self.ctx.n_ctx();
        let max_keep = prompt.len().saturating_sub(1);
        let mut keep = self.history.common_prefix(prompt).min(max_keep);
        let mut shift = None;

        let past = self.history.len();
        if policy.needs_shift(past, prompt.len() - keep, capacity) {
            if let Some(window) = policy.plan(past, keep) {
                match self.apply_window(&window) {
                    Ok(()) => {
                        info!(%window, past, capacity, "context shifted");
                        keep = self.history.common_prefix(prompt).min(max_keep);
                        shift = Some(window);
                    }
                    Err(e) => {
                        warn!(error = %e, "context shift failed, discarding cache");
                        self.wipe()?;
                        keep = 0;
                    }
                }
            }
        }

        if let Err(e) = self.ctx.cache_remove(MAIN_SEQ, keep, None) {
            warn!(error = %e, keep, "failed to drop stale cache tail, discarding cache");
            self.wipe()?;
            keep = 0;
        }
        self.history.truncate(keep);
        Ok((keep, shift))
    }

    /// Decode `prompt[keep..]` in chunks of at most `chunk_size` tokens.
    fn prefill(&mut self, prompt: &[TokenId], keep: usize) -> std::result::Result<(), LlamaError> {
        self.history
            .check_capacity(prompt.len() - keep, self.ctx.n_ctx())
            .map_err(|e| LlamaError::Cache(e.to_string()))?;
        for chunk in chunks(&prompt[keep..], keep, self.chunk_size) {
            chunk.load_into(&mut self.batch);
            if let Err(e) = self.ctx.decode(&self.batch) {
                self.discard_past_history();
                return Err(e);
            }
            self.history.extend_from_slice(chunk.tokens);
        }
        Ok(())
    }
}

/// A generation session over one engine context.
///
/// Created unloaded. Methods take `&self`, so a session can be shared through
/// an `Arc` between the thread that generates and the one that cancels.
pub struct Session<B: LlamaBackend> {
    id: Uuid,
    backend: B,
    config: SessionConfig,
    inner: Mutex<Option<Loaded<B::Context>>>,
    cancel: Arc<AtomicBool>,
    state: AtomicU8,
}

impl<B: LlamaBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    pub fn with_config(backend: B, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(session = %id, batch_size = config.batch_size, "session created");
        Session {
            id,
            backend,
            config,
            inner: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            state: AtomicU8::new(SessionState::Unloaded as u8),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Ready | SessionState::Generating
        )
    }

    /// Request cancellation of the in-flight generation. Never blocks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Loaded<B::Context>>>> {
        self.inner.lock().map_err(|_| SessionError::LockPoisoned)
    }

    /// Load a model and create its context, replacing any previous one.
    ///
    /// On failure the session is left unloaded with nothing retained.
    pub fn load(&self, params: &LoadParams) -> Result<()> {
        self.cancel();
        let mut guard = self.lock()?;

        if guard.take().is_some() {
            info!(session = %self.id, "releasing previous context");
        }
        self.set_state(SessionState::Loading);

        match self.backend.load(params) {
            Ok(ctx) => {
                let capacity = ctx.n_ctx();
                let chunk_size = self.config.batch_size.min(params.n_batch).max(1);
                info!(
                    session = %self.id,
                    model = %params.model_path,
                    capacity,
                    chunk_size,
                    "model loaded"
                );
                *guard = Some(Loaded {
                    ctx,
                    history: TokenHistory::with_capacity(capacity),
                    batch: Batch::with_capacity(chunk_size),
                    chunk_size,
                });
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                error!(session = %self.id, error = %e, "model load failed");
                self.set_state(SessionState::Unloaded);
                Err(SessionError::Load(e))
            }
        }
    }

    /// Release the context and clear history. Unloading twice is a no-op.
    pub fn unload(&self) -> Result<()> {
        self.cancel();
        let mut guard = self.lock()?;

        if guard.is_some() {
            self.set_state(SessionState::Unloading);
            *guard = None;
            info!(session = %self.id, "model unloaded");
        }
        self.set_state(SessionState::Unloaded);
        Ok(())
    }

    /// Tokens currently resident in the cache.
    pub fn history(&self) -> Result<Vec<TokenId>> {
        let guard = self.lock()?;
        Ok(guard
            .as_ref()
            .map(|l| l.history.as_slice().to_vec())
            .unwrap_or_default())
    }

    /// Context size of the loaded model.
    pub fn capacity(&self) -> Result<usize> {
        let guard = self.lock()?;
        guard
            .as_ref()
            .map(|l| l.ctx.n_ctx())
            .ok_or(SessionError::NotLoaded)
    }

    /// Run `f` against the loaded engine context.
    pub fn with_context<R>(&self, f: impl FnOnce(&B::Context) -> R) -> Result<R> {
        let guard = self.lock()?;
        guard
            .as_ref()
            .map(|l| f(&l.ctx))
            .ok_or(SessionError::NotLoaded)
    }

    /// Generate a response to `request.prompt`, streaming text to `on_fragment`.
    ///
    /// Each fragment is complete UTF-8. Decode failures, cancellation, and a
    /// full context end the turn early but still return `Ok` with whatever was
    /// produced; see [`Generation::finish_reason`]. Errors are reserved for
    /// requests that never started: no model, or a prompt that tokenizes to
    /// nothing.
    pub fn generate<F>(&self, request: &GenerationRequest, on_fragment: F) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        self.generate_inner(request, None, on_fragment)
    }

    /// Like [`generate`](Self::generate), but also stops when `cancel` is set.
    ///
    /// Unlike the session flag, `cancel` is never cleared here, so a caller
    /// can raise it before this call acquires the lock and still have it seen.
    pub fn generate_with_cancel<F>(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_fragment: F,
    ) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        self.generate_inner(request, Some(cancel), on_fragment)
    }

    fn generate_inner<F>(
        &self,
        request: &GenerationRequest,
        extra_cancel: Option<&AtomicBool>,
        mut on_fragment: F,
    ) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        let span = info_span!("generate", session = %self.id);
        let _enter = span.enter();

        let mut guard = self.lock()?;
        let loaded = guard.as_mut().ok_or(SessionError::NotLoaded)?;
        self.cancel.store(false, Ordering::Release);

        let mut prompt = loaded
            .ctx
            .tokenize(&request.prompt, true, true)
            .map_err(SessionError::Tokenization)?;
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let capacity = loaded.ctx.n_ctx();
        let max_prompt = self.config.shift.max_prompt_len(capacity);
        let truncated = prompt.len() > max_prompt;
        if truncated {
            warn!(
                prompt_tokens = prompt.len(),
                max_prompt, capacity, "prompt exceeds context, truncating"
            );
            prompt.truncate(max_prompt);
        }

        self.set_state(SessionState::Generating);
        let generation = self.run(
            loaded,
            &prompt,
            truncated,
            request,
            extra_cancel,
            &mut on_fragment,
        );
        self.set_state(SessionState::Ready);

        info!(
            finish = %generation.finish_reason,
            generated = generation.stats.generated_tokens,
            reused = generation.stats.reused_tokens,
            "generation finished"
        );
        Ok(generation)
    }

    fn run<F: FnMut(&str)>(
        &self,
        loaded: &mut Loaded<B::Context>,
        prompt: &[TokenId],
        truncated: bool,
        request: &GenerationRequest,
        extra_cancel: Option<&AtomicBool>,
        on_fragment: &mut F,
    ) -> Generation {
        let mut timer = InferenceTimer::start();
        let finish = |reason: FinishReason,
                      text: String,
                      shift: Option<CacheWindow>,
                      timer: &InferenceTimer| Generation {
            text,
            finish_reason: reason,
            truncated,
            shift,
            stats: timer.finish(),
        };

        let (keep, shift) = match loaded.align(prompt, &self.config.shift) {
            Ok(aligned) => aligned,
            Err(e) => {
                error!(error = %e, "cache could not be reset");
                return finish(FinishReason::DecodeFailed, String::new(), None, &timer);
            }
        };
        timer.set_prompt(prompt.len(), keep, prompt.len() - keep);
        debug!(prompt_tokens = prompt.len(), reused = keep, "prompt aligned");

        if let Err(e) = loaded.prefill(prompt, keep) {
            error!(error = %e, resident = loaded.history.len(), "prefill failed");
            return finish(FinishReason::DecodeFailed, String::new(), shift, &timer);
        }
        timer.mark_prefill_complete();

        let capacity = loaded.ctx.n_ctx();
        let mut chain = SamplerChain::from_params(&request.sampling);
        let mut assembler = Utf8Assembler::new();
        let mut produced: Vec<u8> = Vec::new();

        let reason = loop {
            if timer.generated() >= request.max_tokens {
                break FinishReason::Length;
            }
            if self.cancel.load(Ordering::Acquire)
                || extra_cancel.is_some_and(|c| c.load(Ordering::Acquire))
            {
                break FinishReason::Cancelled;
            }
            if let Err(e) = loaded.history.check_capacity(1, capacity) {
                debug!(error = %e, "no free cache position");
                break FinishReason::ContextFull;
            }

            let token = match loaded.ctx.sample(&mut chain) {
                Ok(token) => token,
                Err(e) => {
                    error!(error = %e, "sampling failed");
                    break FinishReason::DecodeFailed;
                }
            };
            if loaded.ctx.is_eog(token) {
                break FinishReason::Stop;
            }

            let pos = loaded.history.len();
            loaded.batch.single(token, pos);
            if let Err(e) = loaded.ctx.decode(&loaded.batch) {
                error!(error = %e, token, pos, "decode failed");
                loaded.discard_past_history();
                break FinishReason::DecodeFailed;
            }
            loaded.history.push(token);
            timer.mark_token();

            let piece = loaded.ctx.token_to_piece(token).unwrap_or_else(|e| {
                warn!(error = %e, token, "token has no text");
                Vec::new()
            });
            produced.extend_from_slice(&piece);
            if let Some(bytes) = assembler.accept(&piece) {
                on_fragment(&String::from_utf8_lossy(&bytes));
            }
        };

        let tail = assembler.flush();
        if !tail.is_empty() {
            on_fragment(&String::from_utf8_lossy(&tail));
        }

        let text = String::from_utf8_lossy(&produced).into_owned();
        finish(reason, text, shift, &timer)
    }
}

impl<B: LlamaBackend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
