//! Error types for the llama-session crate.

use llama_engine::LlamaError;
use thiserror::Error;

/// Top-level error type for session operations.
///
/// Decode and sampling failures during generation are not errors: they end the
/// turn with [`FinishReason::DecodeFailed`](crate::FinishReason::DecodeFailed).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No model is loaded")]
    NotLoaded,

    #[error("Load failed: {0}")]
    Load(LlamaError),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Tokenization failed: {0}")]
    Tokenization(LlamaError),

    #[error("Session lock poisoned")]
    LockPoisoned,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
