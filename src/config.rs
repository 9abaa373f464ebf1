//! Session configuration.
//!
//! Everything tunable lives in one serde struct so a JSON file can set any
//! subset and leave the rest at their defaults.

use std::path::Path;

use llama_engine::LoadParams;
use llama_kv::ShiftPolicy;
use llama_sampling::SamplingParams;
use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::error::{Result, SessionError};

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Prefill chunk size. Also the size of the session's reusable batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Context shift and prompt truncation thresholds.
    #[serde(default)]
    pub shift: ShiftPolicy,

    /// Default sampling for requests built from this config.
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Model and context parameters.
    #[serde(default)]
    pub load: LoadParams,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            batch_size: default_batch_size(),
            shift: ShiftPolicy::default(),
            sampling: SamplingParams::default(),
            load: LoadParams::default(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SessionError::Config("batch_size must be > 0".into()));
        }
        if self.batch_size > self.load.n_batch {
            return Err(SessionError::Config(format!(
                "batch_size {} exceeds n_batch {}",
                self.batch_size, self.load.n_batch
            )));
        }
        self.sampling
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))
    }
}
