//! Multi-turn text generation sessions over a llama.cpp-style engine.
//!
//! This crate drives an engine implementing the `llama-engine` contract: it
//! reuses the KV cache across turns, shifts the context when it fills up,
//! prefills prompts in bounded chunks, and streams complete UTF-8 text.
//!
//! ```no_run
//! use llama_session::{GenerationRequest, LoadParams, Session};
//! use llama_runtime::ReferenceBackend;
//!
//! let session = Session::new(ReferenceBackend::new());
//! session.load(&LoadParams::new("model.bin"))?;
//! let out = session.generate(&GenerationRequest::new("Hello"), |text| print!("{text}"))?;
//! println!("\n[{}]", out.finish_reason);
//! # Ok::<(), llama_session::SessionError>(())
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod session;
pub mod stream;
pub mod telemetry;

pub use batch::{chunks, Chunk, Chunks, DEFAULT_BATCH_SIZE};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::{
    CancelHandle, FinishReason, Generation, GenerationRequest, Session, SessionState,
    DEFAULT_MAX_TOKENS,
};
pub use stream::{spawn_generation, GenerationStream, StreamEvent};
pub use telemetry::{GenerationStats, InferenceTimer};

pub use llama_engine::{LlamaBackend, LlamaContext, LoadParams};
pub use llama_kv::{CacheWindow, ShiftPolicy};
pub use llama_sampling::SamplingParams;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
