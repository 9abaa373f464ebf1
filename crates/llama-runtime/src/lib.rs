//! # llama-runtime
//!
//! Reference engine for llama.rs sessions. [`ReferenceBackend`] implements the
//! `llama-engine` contract on the CPU with a deterministic hash model, and
//! [`EngineCounters`] records how much work each context performs.

pub mod counters;
pub mod reference;

pub use counters::{CounterSnapshot, EngineCounters};
pub use reference::{ReferenceBackend, ReferenceContext};
