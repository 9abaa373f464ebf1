//! Engine-side work counters.
//!
//! Every call that reaches the reference engine bumps a counter, so tests can
//! assert how much work a session actually did: a fully reused prefix shows up
//! as zero prompt tokens decoded, a context shift as one shift call.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared, lock-free counters. Cloned into every context a backend loads.
#[derive(Debug, Default)]
pub struct EngineCounters {
    loads: AtomicUsize,
    decode_calls: AtomicUsize,
    tokens_decoded: AtomicUsize,
    samples: AtomicUsize,
    removes: AtomicUsize,
    shifts: AtomicUsize,
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub loads: usize,
    pub decode_calls: usize,
    pub tokens_decoded: usize,
    pub samples: usize,
    pub removes: usize,
    pub shifts: usize,
}

impl CounterSnapshot {
    /// Work done between `earlier` and `self`.
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            loads: self.loads - earlier.loads,
            decode_calls: self.decode_calls - earlier.decode_calls,
            tokens_decoded: self.tokens_decoded - earlier.tokens_decoded,
            samples: self.samples - earlier.samples,
            removes: self.removes - earlier.removes,
            shifts: self.shifts - earlier.shifts,
        }
    }
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode(&self, n_tokens: usize) {
        self.decode_calls.fetch_add(1, Ordering::Relaxed);
        self.tokens_decoded.fetch_add(n_tokens, Ordering::Relaxed);
    }

    pub(crate) fn record_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shift(&self) {
        self.shifts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            decode_calls: self.decode_calls.load(Ordering::Relaxed),
            tokens_decoded: self.tokens_decoded.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            shifts: self.shifts.load(Ordering::Relaxed),
        }
    }
}
