//! # llama-cli
//!
//! Command-line front end for llama.rs sessions.
//!
//! Wires: config file + flags → [`SessionConfig`] → session over the CPU
//! reference engine → streamed text on stdout. `chat` keeps one session for
//! the whole conversation, so every turn reuses the cache built by the
//! previous one.

use std::io::Write;
use std::path::{Path, PathBuf};

use llama_runtime::ReferenceBackend;
use llama_sampling::SamplingError;
use llama_session::{Generation, GenerationRequest, Session, SessionConfig, SessionError};
use tracing_subscriber::EnvFilter;

/// Errors from the CLI pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("invalid sampling parameters: {0}")]
    Sampling(#[from] SamplingError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no model path: pass --model or set load.model_path in the config file")]
    MissingModel,
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Flags that override values from the config file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Model file to load.
    #[arg(short, long, global = true)]
    pub model: Option<PathBuf>,

    /// Context size in tokens.
    #[arg(long, global = true)]
    pub n_ctx: Option<usize>,

    /// Engine threads.
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Prefill chunk size.
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Sampling temperature (0 = greedy).
    #[arg(short, long, global = true)]
    pub temperature: Option<f32>,

    /// Keep only the K most likely tokens (0 = unbounded).
    #[arg(long, global = true)]
    pub top_k: Option<usize>,

    /// Nucleus sampling threshold in (0, 1].
    #[arg(long, global = true)]
    pub top_p: Option<f32>,

    /// Repetition penalty (1.0 = none).
    #[arg(long, global = true)]
    pub repeat_penalty: Option<f32>,

    /// Random seed for reproducible sampling.
    #[arg(short, long, global = true)]
    pub seed: Option<u64>,
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load `config_path` (or defaults) and apply `overrides`.
pub fn build_config(config_path: Option<&Path>, overrides: &Overrides) -> Result<SessionConfig> {
    let mut config = match config_path {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    if let Some(model) = &overrides.model {
        config.load.model_path = model.to_string_lossy().into_owned();
    }
    if let Some(n_ctx) = overrides.n_ctx {
        config.load.n_ctx = n_ctx;
    }
    if let Some(threads) = overrides.threads {
        config.load.n_threads = threads;
    }
    if let Some(batch_size) = overrides.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(t) = overrides.temperature {
        config.sampling.temperature = t;
    }
    if let Some(k) = overrides.top_k {
        config.sampling.top_k = k;
    }
    if let Some(p) = overrides.top_p {
        config.sampling.top_p = p;
    }
    if let Some(penalty) = overrides.repeat_penalty {
        config.sampling.repeat_penalty = penalty;
    }
    if let Some(seed) = overrides.seed {
        config.sampling.seed = seed;
    }

    config.sampling.validate()?;
    config.validate()?;
    if config.load.model_path.is_empty() {
        return Err(CliError::MissingModel);
    }
    Ok(config)
}

/// Create a session over the reference engine and load the configured model.
pub fn open_session(config: &SessionConfig) -> Result<Session<ReferenceBackend>> {
    let session = Session::with_config(ReferenceBackend::new(), config.clone());
    session.load(&config.load)?;
    Ok(session)
}

/// One-shot generation: stream the response to `out`.
pub fn generate<W: Write>(
    config: &SessionConfig,
    prompt: &str,
    max_tokens: usize,
    out: &mut W,
) -> Result<Generation> {
    let session = open_session(config)?;
    let request = GenerationRequest::new(prompt)
        .with_max_tokens(max_tokens)
        .with_sampling(config.sampling.clone());
    stream_to(&session, &request, out)
}

fn stream_to<W: Write>(
    session: &Session<ReferenceBackend>,
    request: &GenerationRequest,
    out: &mut W,
) -> Result<Generation> {
    let mut write_err = None;
    let generation = session.generate(request, |fragment| {
        if write_err.is_some() {
            return;
        }
        if let Err(e) = out.write_all(fragment.as_bytes()).and_then(|_| out.flush()) {
            write_err = Some(e);
            session.cancel();
        }
    })?;
    match write_err {
        Some(e) => Err(e.into()),
        None => Ok(generation),
    }
}

/// An interactive conversation over one session.
///
/// The transcript is resubmitted in full every turn; the session turns that
/// into an incremental prefill of just the new user line.
pub struct Chat {
    session: Session<ReferenceBackend>,
    config: SessionConfig,
    transcript: String,
    max_tokens: usize,
}

impl Chat {
    pub fn new(config: SessionConfig, max_tokens: usize) -> Result<Self> {
        let session = open_session(&config)?;
        Ok(Self {
            session,
            config,
            transcript: String::new(),
            max_tokens,
        })
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn session(&self) -> &Session<ReferenceBackend> {
        &self.session
    }

    /// Send one user message and stream the reply to `out`.
    pub fn turn<W: Write>(&mut self, user: &str, out: &mut W) -> Result<Generation> {
        self.transcript.push_str("User: ");
        self.transcript.push_str(user);
        self.transcript.push_str("\nAssistant:");

        let request = GenerationRequest::new(self.transcript.clone())
            .with_max_tokens(self.max_tokens)
            .with_sampling(self.config.sampling.clone());
        let generation = stream_to(&self.session, &request, out)?;

        self.transcript.push_str(&generation.text);
        self.transcript.push('\n');
        Ok(generation)
    }

    /// Forget the conversation. The cache is dropped lazily by the next turn.
    pub fn reset(&mut self) {
        self.transcript.clear();
    }
}
