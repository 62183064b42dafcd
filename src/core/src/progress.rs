//! Transfer progress reporting.
//!
//! Long-running byte transfers (layer builds, blob pulls and pushes) report
//! through a [`ProgressSink`]. Rendering is the caller's concern; the core only
//! emits `{written, total}` updates, throttled by [`ProgressTracker`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Minimum interval between two updates for the same transfer (10 Hz).
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// A single progress update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// What is being transferred (usually a short digest or layer path)
    pub label: String,
    /// Bytes processed so far
    pub written: u64,
    /// Expected total, 0 when unknown
    pub total: u64,
    /// Set on the last update of a transfer
    pub done: bool,
}

/// Receives progress updates.
pub trait ProgressSink: Send + Sync {
    fn update(&self, event: &ProgressEvent);
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _event: &ProgressEvent) {}
}

/// Logs updates at trace level and completions at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn update(&self, event: &ProgressEvent) {
        if event.done {
            tracing::debug!(label = %event.label, bytes = event.written, "Transfer complete");
        } else {
            tracing::trace!(
                label = %event.label,
                written = event.written,
                total = event.total,
                "Transfer progress"
            );
        }
    }
}

/// Fans progress updates out to any number of subscribers.
#[derive(Clone)]
pub struct ProgressEmitter {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl ProgressEmitter {
    /// Create a new emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for ProgressEmitter {
    fn update(&self, event: &ProgressEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Counts bytes for one transfer and forwards at most one update per
/// [`MIN_UPDATE_INTERVAL`] to the sink. The final update is always sent.
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    clock: Arc<dyn Clock>,
    label: String,
    written: u64,
    total: u64,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        clock: Arc<dyn Clock>,
        label: impl Into<String>,
        total: u64,
    ) -> Self {
        Self {
            sink,
            clock,
            label: label.into(),
            written: 0,
            total,
            last_emit: None,
        }
    }

    /// Start counting from `offset` (resumed transfers).
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.written = offset;
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn advance(&mut self, n: u64) {
        self.written += n;
        let now = self.clock.now();
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= MIN_UPDATE_INTERVAL,
        };
        if due {
            self.last_emit = Some(now);
            self.emit(false);
        }
    }

    pub fn finish(&mut self) {
        self.emit(true);
    }

    fn emit(&self, done: bool) {
        self.sink.update(&ProgressEvent {
            label: self.label.clone(),
            written: self.written,
            total: self.total,
            done,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn update(&self, event: &ProgressEvent) {
            self.0.lock().push(event.clone());
        }
    }

    struct ManualClock(Mutex<Instant>);

    impl ManualClock {
        fn advance(&self, d: Duration) {
            let mut now = self.0.lock();
            *now += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    #[test]
    fn test_tracker_throttles_updates() {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock(Mutex::new(Instant::now())));
        let mut tracker = ProgressTracker::new(recorder.clone(), clock.clone(), "blob", 100);

        tracker.advance(10); // first update always goes out
        tracker.advance(10);
        tracker.advance(10);
        clock.advance(Duration::from_millis(150));
        tracker.advance(10);
        tracker.finish();

        let events = recorder.0.lock();
        let written: Vec<u64> = events.iter().map(|e| e.written).collect();
        assert_eq!(written, vec![10, 40, 40]);
        assert!(events.last().unwrap().done);
        assert_eq!(events[0].total, 100);
    }

    #[test]
    fn test_tracker_with_offset() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker =
            ProgressTracker::new(recorder.clone(), Arc::new(SystemClock), "resume", 50)
                .with_offset(20);
        tracker.advance(30);
        tracker.finish();
        assert_eq!(tracker.written(), 50);
        assert_eq!(recorder.0.lock().last().unwrap().written, 50);
    }

    #[tokio::test]
    async fn test_emitter_broadcasts() {
        let emitter = ProgressEmitter::new(16);
        let mut rx = emitter.subscribe();
        emitter.update(&ProgressEvent {
            label: "x".to_string(),
            written: 1,
            total: 2,
            done: false,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.written, 1);
    }

    #[test]
    fn test_emitter_without_subscribers() {
        let emitter = ProgressEmitter::new(4);
        emitter.update(&ProgressEvent {
            label: "x".to_string(),
            written: 0,
            total: 0,
            done: true,
        });
    }
}
