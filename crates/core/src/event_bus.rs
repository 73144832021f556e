//! Internal event bus — trait for emitting tracking calls from any module.
//!
//! Experiment, funnel and cohort engines accept an `Arc<dyn EventSink>` and
//! report what they did through it. They never learn whether the call was
//! delivered; the tracker behind the sink owns queueing and retries. When
//! [`EventSink::is_enabled`] is false they collect nothing at all.

use crate::types::{Properties, Visitor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A `track()` call captured as a value.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCall {
    pub name: String,
    pub properties: Properties,
    pub visitor: Visitor,
}

impl TrackCall {
    pub fn new(name: impl Into<String>, properties: Properties, visitor: Visitor) -> Self {
        Self {
            name: name.into(),
            properties,
            visitor,
        }
    }
}

/// Destination for tracking calls.
pub trait EventSink: Send + Sync {
    fn emit(&self, call: TrackCall);

    /// Record that the current visitor now sees `variant_id` of `test_id`.
    fn annotate_experiment(&self, _test_id: &str, _variant_id: &str) {}

    /// Whether tracking is allowed right now. Engines check this before
    /// storing anything about a visitor.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// No-op sink for tests and hosts that don't need emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _call: TrackCall) {}
}

/// In-memory sink that captures calls for testing.
#[derive(Default)]
pub struct CaptureSink {
    calls: Mutex<Vec<TrackCall>>,
    experiments: Mutex<Vec<(String, String)>>,
    disabled: AtomicBool,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TrackCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.name == name).count()
    }

    pub fn annotations(&self) -> Vec<(String, String)> {
        self.experiments.lock().clone()
    }

    /// Simulate consent being granted or denied.
    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::Release);
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
        self.experiments.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, call: TrackCall) {
        self.calls.lock().push(call);
    }

    fn annotate_experiment(&self, test_id: &str, variant_id: &str) {
        self.experiments
            .lock()
            .push((test_id.to_string(), variant_id.to_string()));
    }

    fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Acquire)
    }
}

/// Sink that forwards calls into an unbounded channel, for hosts that run
/// the tracker as a single-writer task.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<TrackCall>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TrackCall>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, call: TrackCall) {
        if self.sender.send(call).is_err() {
            tracing::debug!("tracking channel closed, call discarded");
        }
    }
}

/// Convenience: create a no-op sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
