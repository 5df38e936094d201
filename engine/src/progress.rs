//! Progress reporting and cancellation.
//!
//! The engine never talks to a UI directly. It reports through a
//! `ProgressCallback`, and it is stopped through a `StopHandle`. Both are
//! usable from any thread.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::{Phase, PlanItem};

/// Receives events from a running job.
///
/// Calls may arrive from the engine's worker threads, so implementations
/// must be `Sync`. Every method defaults to a no-op.
pub trait ProgressCallback: Send + Sync {
    /// A named phase started.
    fn on_phase(&self, _phase: Phase) {}

    /// `current` of `total` source files handled.
    fn on_progress(&self, _current: usize, _total: usize) {}

    /// Human-readable status line.
    fn on_message(&self, _message: &str) {}

    /// Human-readable failure line (per-file or fatal).
    fn on_error(&self, _message: &str) {}

    /// A placement or deletion decision.
    fn on_item(&self, _item: &PlanItem) {}
}

/// Ignores every event.
pub struct SilentProgress;

impl ProgressCallback for SilentProgress {}

/// One forwarded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase(Phase),
    Progress { current: usize, total: usize },
    Message(String),
    Error(String),
    Item(PlanItem),
}

/// Forwards every callback over a channel, for a UI running on another thread.
pub struct ChannelProgress {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressCallback for ChannelProgress {
    // A disconnected receiver just means nobody is listening any more.
    fn on_phase(&self, phase: Phase) {
        let _ = self.sender.send(ProgressEvent::Phase(phase));
    }

    fn on_progress(&self, current: usize, total: usize) {
        let _ = self.sender.send(ProgressEvent::Progress { current, total });
    }

    fn on_message(&self, message: &str) {
        let _ = self.sender.send(ProgressEvent::Message(message.to_string()));
    }

    fn on_error(&self, message: &str) {
        let _ = self.sender.send(ProgressEvent::Error(message.to_string()));
    }

    fn on_item(&self, item: &PlanItem) {
        let _ = self.sender.send(ProgressEvent::Item(item.clone()));
    }
}

/// Cooperative cancellation flag shared between a job and its controller.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to stop. In-flight file operations finish; nothing new starts.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
