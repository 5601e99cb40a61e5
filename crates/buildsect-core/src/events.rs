//! Status events
//!
//! One event per classified candidate, delivered to an external monitor
//! through a bounded queue. Emission never waits: when the queue is full
//! the event is dropped and counted.

use crate::candidate::Progress;
use crate::types::{CandidateDescriptor, CandidateId, Outcome, SearchRange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Result of one classified candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Candidate that was tested
    pub candidate: CandidateDescriptor,
    /// Effective outcome
    pub outcome: Outcome,
    /// Bounds before applying the outcome
    pub range_before: SearchRange,
    /// Bounds after applying the outcome
    pub range_after: SearchRange,
    /// Estimate of the remaining work
    pub progress: Progress,
    /// Outcome came from the cache, no build ran
    pub cached: bool,
}

impl StatusEvent {
    /// Bisect log line, e.g. `# bad: [0123456789ab] summary`
    #[must_use]
    pub fn log_line(&self) -> String {
        log_line(&self.outcome, &self.candidate.id, self.candidate.summary.as_deref())
    }
}

/// Format one bisect log line
#[must_use]
pub fn log_line(outcome: &Outcome, id: &CandidateId, summary: Option<&str>) -> String {
    match summary {
        Some(summary) => format!("# {outcome}: [{id}] {summary}"),
        None => format!("# {outcome}: [{id}]"),
    }
}

/// Non-blocking event producer
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StatusEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Bounded channel of `capacity` events
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Sink that discards everything
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Enqueue an event without waiting
    pub fn emit(&self, event: StatusEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(candidate = %event.candidate.id, "status queue full; event dropped");
            }
            // monitor went away
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Events dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateId, Diagnostic};

    fn event(outcome: Outcome) -> StatusEvent {
        StatusEvent {
            candidate: CandidateDescriptor {
                id: CandidateId::new("abc123"),
                index: 3,
                summary: Some("fix the widget".into()),
            },
            outcome,
            range_before: SearchRange::new(0, 8),
            range_after: SearchRange::new(3, 8),
            progress: crate::candidate::Progress {
                suspects: 5,
                left_after_next: 2,
                steps_after_next: 1,
            },
            cached: false,
        }
    }

    #[test]
    fn log_lines() {
        assert_eq!(event(Outcome::Good).log_line(), "# good: [abc123] fix the widget");
        let skip = Outcome::skip_range("evaluation-failure", Diagnostic::default());
        assert_eq!(
            event(skip).log_line(),
            "# skip-range(evaluation-failure): [abc123] fix the widget"
        );
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(event(Outcome::Good));
        sink.emit(event(Outcome::Good));
        assert_eq!(sink.dropped(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn closed_or_disabled_sinks_are_silent() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(event(Outcome::Good));
        EventSink::disabled().emit(event(Outcome::Good));
        assert_eq!(sink.dropped(), 0);
    }
}
