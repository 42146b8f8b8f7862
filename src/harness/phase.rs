//! Phase description and per-phase results

use crate::error::ConnectError;
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Sample label taken before the sync phase
pub const BEFORE_SYNC: &str = "BEFORE_SYNC";
/// Sample label taken after the sync phase
pub const AFTER_SYNC: &str = "AFTER_SYNC";
/// Sample label taken before the async phase
pub const BEFORE_ASYNC: &str = "BEFORE_ASYNC";
/// Sample label taken after the async phase
pub const AFTER_ASYNC: &str = "AFTER_ASYNC";

/// How the cycles of a phase are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One blocking thread of control, cycles strictly in sequence
    Sync,
    /// Cooperative tasks; cycles suspend at the delay and at connect
    Concurrent,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// A batch of cycles; immutable while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPhase {
    /// Label used in logs, metrics and the summary
    pub label: String,
    /// Scheduling model
    pub mode: ExecutionMode,
    /// Number of cycles to run
    pub target_cycles: u64,
    /// Wait between configure and connect in each cycle
    pub inter_cycle_delay: Duration,
}

impl RunPhase {
    /// Create a phase
    pub fn new(
        label: impl Into<String>,
        mode: ExecutionMode,
        target_cycles: u64,
        inter_cycle_delay: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            mode,
            target_cycles,
            inter_cycle_delay,
        }
    }

    /// Sync phase
    pub fn sync(label: impl Into<String>, target_cycles: u64, inter_cycle_delay: Duration) -> Self {
        Self::new(label, ExecutionMode::Sync, target_cycles, inter_cycle_delay)
    }

    /// Concurrent phase
    pub fn concurrent(
        label: impl Into<String>,
        target_cycles: u64,
        inter_cycle_delay: Duration,
    ) -> Self {
        Self::new(label, ExecutionMode::Concurrent, target_cycles, inter_cycle_delay)
    }
}

/// Outcome of one cycle
#[derive(Debug)]
pub enum CycleResult {
    /// Connected (and released)
    Success,
    /// Connect failed (handle still released)
    Failed(ConnectError),
}

impl CycleResult {
    /// Whether the connect succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, CycleResult::Success)
    }
}

impl From<Result<(), ConnectError>> for CycleResult {
    fn from(result: Result<(), ConnectError>) -> Self {
        match result {
            Ok(()) => CycleResult::Success,
            Err(e) => CycleResult::Failed(e),
        }
    }
}

/// Aggregate of a finished phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Phase label
    pub label: String,
    /// Scheduling model
    pub mode: ExecutionMode,
    /// Cycles requested
    pub target_cycles: u64,
    /// Cycles whose connect succeeded
    pub succeeded: u64,
    /// Cycles whose connect failed
    pub failed: u64,
    /// Wall time of the phase
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Cycles completed, successful or not
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Emitted every N completed cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Phase label
    pub label: String,
    /// Scheduling model
    pub mode: ExecutionMode,
    /// Cumulative completed cycles in the phase
    pub completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_result_from_connect_outcome() {
        assert!(CycleResult::from(Ok(())).is_success());
        assert!(!CycleResult::from(Err(ConnectError::ConnectionClosed)).is_success());
    }

    #[test]
    fn test_summary_completed() {
        let summary = RunSummary {
            label: "sync".into(),
            mode: ExecutionMode::Sync,
            target_cycles: 10,
            succeeded: 7,
            failed: 3,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(summary.completed(), 10);
    }

    #[test]
    fn test_summary_serializes_elapsed_as_millis() {
        let summary = RunSummary {
            label: "async".into(),
            mode: ExecutionMode::Concurrent,
            target_cycles: 2,
            succeeded: 2,
            failed: 0,
            elapsed: Duration::from_millis(1234),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed_ms"], 1234);
        assert_eq!(json["mode"], "concurrent");
    }

    #[test]
    fn test_phase_constructors() {
        let phase = RunPhase::sync("sync", 3, Duration::ZERO);
        assert_eq!(phase.mode, ExecutionMode::Sync);
        let phase = RunPhase::concurrent("async", 3, Duration::from_millis(5));
        assert_eq!(phase.mode, ExecutionMode::Concurrent);
        assert_eq!(phase.inter_cycle_delay, Duration::from_millis(5));
    }
}
