//! Cycle accounting shared by every cycle of a phase

use super::phase::{CycleResult, ExecutionMode, ProgressEvent, RunPhase, RunSummary};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Default number of cycles between progress events
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

/// Counts completed cycles and emits a [`ProgressEvent`] at every multiple of
/// the interval.
///
/// The completed counter is a single `fetch_add`, so each count is observed by
/// exactly one caller and each multiple is emitted once.
#[derive(Debug)]
pub struct ProgressTracker {
    label: String,
    mode: ExecutionMode,
    interval: u64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
    sink: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressTracker {
    /// Tracker for one phase. An interval of 0 disables events.
    pub fn new(phase: &RunPhase, interval: u64, sink: Option<UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            label: phase.label.clone(),
            mode: phase.mode,
            interval,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            sink,
        }
    }

    /// Record a finished cycle; returns the cumulative completed count
    pub fn record(&self, result: &CycleResult) -> u64 {
        match result {
            CycleResult::Success => self.succeeded.fetch_add(1, Ordering::SeqCst),
            CycleResult::Failed(_) => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;

        if self.interval > 0 && completed % self.interval == 0 {
            self.emit(completed);
        }
        completed
    }

    fn emit(&self, completed: u64) {
        tracing::info!(
            phase = %self.label,
            mode = %self.mode,
            completed,
            failed = self.failed(),
            "progress"
        );
        if let Some(sink) = &self.sink {
            let event = ProgressEvent {
                label: self.label.clone(),
                mode: self.mode,
                completed,
            };
            if sink.send(event).is_err() {
                tracing::trace!("progress receiver dropped");
            }
        }
    }

    /// Completed cycles
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Successful cycles
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Failed cycles
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Summary of the phase so far
    pub fn summary(&self, target_cycles: u64, elapsed: Duration) -> RunSummary {
        RunSummary {
            label: self.label.clone(),
            mode: self.mode,
            target_cycles,
            succeeded: self.succeeded(),
            failed: self.failed(),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectError;
    use std::sync::Arc;

    fn phase() -> RunPhase {
        RunPhase::concurrent("async", 1000, Duration::ZERO)
    }

    #[test]
    fn test_emits_every_interval() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(&phase(), 100, Some(tx));
        for i in 0..350 {
            let result = if i % 2 == 0 {
                CycleResult::Success
            } else {
                CycleResult::Failed(ConnectError::ConnectionClosed)
            };
            tracker.record(&result);
        }

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.completed);
        }
        assert_eq!(seen, vec![100, 200, 300]);
        assert_eq!(tracker.completed(), 350);
        assert_eq!(tracker.succeeded(), 175);
        assert_eq!(tracker.failed(), 175);
    }

    #[test]
    fn test_zero_interval_disables_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(&phase(), 0, Some(tx));
        for _ in 0..10 {
            tracker.record(&CycleResult::Success);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_recording_emits_each_multiple_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = Arc::new(ProgressTracker::new(&phase(), 10, Some(tx)));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..125 {
                        tracker.record(&CycleResult::Success);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.completed);
        }
        seen.sort_unstable();
        let expected: Vec<u64> = (1..=100).map(|i| i * 10).collect();
        assert_eq!(seen, expected);
        assert_eq!(tracker.completed(), 1000);
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let tracker = ProgressTracker::new(&phase(), 1, Some(tx));
        assert_eq!(tracker.record(&CycleResult::Success), 1);
    }
}
