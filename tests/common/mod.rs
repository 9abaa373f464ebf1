//! Test engines shared by the session integration tests.
//!
//! [`ScriptedBackend`] produces a fixed token sequence regardless of logits and
//! can inject one-shot failures at chosen prefill chunks, decode steps, or
//! sample steps. It tokenizes byte-wise like the reference engine and keeps a
//! real position-indexed cache so cache/history agreement can be checked.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llama_engine::{
    Batch, LlamaBackend, LlamaContext, LlamaError, LoadParams, Result, SamplerChain, SeqId,
    TokenId,
};
use llama_tokenizer::{ByteTokenizer, Tokenizer};

pub const EOS: TokenId = ByteTokenizer::EOS;

/// Tokens for the bytes of `text`.
pub fn bytes_of(text: &str) -> Vec<TokenId> {
    text.bytes().map(TokenId::from).collect()
}

/// A throwaway model file for the reference engine.
pub fn model_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"session test model").unwrap();
    file
}

pub fn params_for(file: &tempfile::NamedTempFile, n_ctx: usize) -> LoadParams {
    LoadParams::new(file.path().to_string_lossy()).with_context_size(n_ctx)
}

/// What a scripted context does on each turn.
#[derive(Debug, Clone)]
pub struct Script {
    /// Sampled in order every turn; [`EOS`] once exhausted.
    pub tokens: Vec<TokenId>,
    pub n_ctx: usize,
    /// Prepend BOS when the session asks for special tokens.
    pub add_bos: bool,
    /// Fail the Nth generation decode of a turn (1-based), once.
    pub fail_decode_at: Option<usize>,
    /// Fail the Nth prefill chunk of a turn (1-based), once.
    pub fail_prefill_chunk: Option<usize>,
    /// Fail the Nth sample of a turn (1-based), once.
    pub fail_sample_at: Option<usize>,
}

impl Script {
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            n_ctx: 512,
            add_bos: true,
            fail_decode_at: None,
            fail_prefill_chunk: None,
            fail_sample_at: None,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(bytes_of(text))
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }
}

#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    /// Total tokens decoded across every context.
    pub decoded: Arc<AtomicUsize>,
    pub fail_load: bool,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            decoded: Arc::new(AtomicUsize::new(0)),
            fail_load: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_load: true,
            ..Self::new(Script::new(Vec::new()))
        }
    }

    pub fn decoded(&self) -> usize {
        self.decoded.load(Ordering::SeqCst)
    }
}

impl LlamaBackend for ScriptedBackend {
    type Context = ScriptedContext;

    fn load(&self, _params: &LoadParams) -> Result<ScriptedContext> {
        if self.fail_load {
            return Err(LlamaError::ModelLoad("scripted load failure".into()));
        }
        Ok(ScriptedContext {
            script: self.script.clone(),
            tokenizer: ByteTokenizer::new(),
            cells: BTreeMap::new(),
            step: Cell::new(0),
            gen_decodes: Cell::new(0),
            prefill_chunks: Cell::new(0),
            decoded: Arc::clone(&self.decoded),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedContext {
    script: Script,
    tokenizer: ByteTokenizer,
    cells: BTreeMap<usize, TokenId>,
    /// Samples taken this turn. Turn counters reset on every tokenize call.
    step: Cell<usize>,
    gen_decodes: Cell<usize>,
    prefill_chunks: Cell<usize>,
    decoded: Arc<AtomicUsize>,
}

impl ScriptedContext {
    pub fn resident(&self) -> Vec<TokenId> {
        self.cells.values().copied().collect()
    }

    pub fn positions(&self) -> Vec<usize> {
        self.cells.keys().copied().collect()
    }
}

impl LlamaContext for ScriptedContext {
    fn n_ctx(&self) -> usize {
        self.script.n_ctx
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        if text.contains("<bad>") {
            return Err(LlamaError::Tokenization("unsupported markup".into()));
        }
        self.step.set(0);
        self.gen_decodes.set(0);
        self.prefill_chunks.set(0);
        self.tokenizer
            .encode(text, add_special && self.script.add_bos, parse_special)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let next = self.cells.keys().next_back().map_or(0, |&p| p + 1);
        for (i, &pos) in batch.positions().iter().enumerate() {
            if pos != next + i || pos >= self.script.n_ctx {
                return Err(LlamaError::Decode(format!("bad position {}", pos)));
            }
        }

        if self.step.get() > 0 {
            self.gen_decodes.set(self.gen_decodes.get() + 1);
            if self.script.fail_decode_at == Some(self.gen_decodes.get()) {
                self.script.fail_decode_at = None;
                return Err(LlamaError::Decode("injected decode failure".into()));
            }
        } else {
            self.prefill_chunks.set(self.prefill_chunks.get() + 1);
            if self.script.fail_prefill_chunk == Some(self.prefill_chunks.get()) {
                self.script.fail_prefill_chunk = None;
                return Err(LlamaError::Decode("injected prefill failure".into()));
            }
        }

        for (&token, &pos) in batch.tokens().iter().zip(batch.positions()) {
            self.cells.insert(pos, token);
        }
        self.decoded.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }

    fn sample(&mut self, _chain: &mut SamplerChain) -> Result<TokenId> {
        let step = self.step.get() + 1;
        self.step.set(step);
        if self.script.fail_sample_at == Some(step) {
            self.script.fail_sample_at = None;
            return Err(LlamaError::Sampling("injected sample failure".into()));
        }
        Ok(self
            .script
            .tokens
            .get(step - 1)
            .copied()
            .unwrap_or(EOS))
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        self.tokenizer
            .token_to_piece(token)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn cache_remove(&mut self, _seq: SeqId, start: usize, end: Option<usize>) -> Result<()> {
        let end = end.unwrap_or(usize::MAX);
        self.cells.retain(|&pos, _| pos < start || pos >= end);
        Ok(())
    }

    fn cache_shift(&mut self, _seq: SeqId, start: usize, end: Option<usize>, delta: isize) -> Result<()> {
        let end = end.unwrap_or(usize::MAX);
        let moved: Vec<(usize, TokenId)> = self
            .cells
            .range(start..end)
            .map(|(&p, &t)| (p, t))
            .collect();
        for (pos, _) in &moved {
            self.cells.remove(pos);
        }
        for (pos, token) in moved {
            let new_pos = pos
                .checked_add_signed(delta)
                .ok_or_else(|| LlamaError::Cache("negative position".into()))?;
            self.cells.insert(new_pos, token);
        }
        Ok(())
    }
}
