//! Pull-based streaming on a dedicated thread.
//!
//! [`spawn_generation`] runs [`Session::generate`] on its own OS thread and
//! forwards each text fragment over a bounded channel, so a caller can iterate
//! output instead of supplying a callback.
//!
//! ```text
//! ┌──────────────┐   StreamEvent channel   ┌────────────────────┐
//! │ caller       │ <────── Fragment ────── │ generation thread  │
//! │ (iterates)   │ <────── Done/Error ──── │ (holds session     │
//! │              │ ─ cancel (atomic flag) >│  lock for the turn)│
//! └──────────────┘                         └────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use llama_engine::LlamaBackend;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::session::{CancelHandle, Generation, GenerationRequest, Session};

/// Fragments buffered before the generation thread blocks on a slow reader.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events sent from the generation thread.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Complete UTF-8 text produced since the previous fragment.
    Fragment(String),
    /// The turn finished. Always the last event on success.
    Done(Generation),
    /// The request was rejected before generation started.
    Error(Arc<SessionError>),
}

/// Handle to a generation running on its own thread.
///
/// Iterating yields every [`StreamEvent`] and ends after `Done` or `Error`.
/// Dropping the stream cancels the generation and waits for the thread.
///
/// Cancellation sets a flag owned by the stream as well as the session's, so
/// it holds even when raised before the worker has taken the session lock.
pub struct GenerationStream {
    rx: Receiver<StreamEvent>,
    cancelled: Arc<AtomicBool>,
    session_cancel: CancelHandle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Start `request` on a new thread named `session-generate`.
pub fn spawn_generation<B>(session: Arc<Session<B>>, request: GenerationRequest) -> Result<GenerationStream>
where
    B: LlamaBackend + 'static,
{
    let (tx, rx) = bounded::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
    let session_cancel = session.cancel_handle();
    let cancelled = Arc::new(AtomicBool::new(false));
    let worker_cancelled = Arc::clone(&cancelled);

    let thread = thread::Builder::new()
        .name("session-generate".into())
        .spawn(move || {
            let result = session.generate_with_cancel(&request, &worker_cancelled, |fragment| {
                let _ = tx.send(StreamEvent::Fragment(fragment.to_string()));
            });
            let event = match result {
                Ok(generation) => StreamEvent::Done(generation),
                Err(e) => StreamEvent::Error(Arc::new(e)),
            };
            let _ = tx.send(event);
            debug!("generation thread finished");
        })?;

    Ok(GenerationStream {
        rx,
        cancelled,
        session_cancel,
        thread: Some(thread),
    })
}

impl GenerationStream {
    /// Ask the generation to stop at the next token boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.session_cancel.cancel();
    }

    /// Drain the stream, concatenating fragments, and return the final event.
    pub fn wait(mut self) -> (String, Option<StreamEvent>) {
        let mut text = String::new();
        let mut last = None;
        for event in self.by_ref() {
            match event {
                StreamEvent::Fragment(f) => text.push_str(&f),
                other => last = Some(other),
            }
        }
        (text, last)
    }
}

impl Iterator for GenerationStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().ok()
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if !thread.is_finished() {
                self.cancel();
            }
            // Unblock a sender waiting on a full channel.
            while self.rx.recv().is_ok() {}
            let _ = thread.join();
        }
    }
}
