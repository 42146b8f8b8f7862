//! Metrics emitted by the harness
//!
//! All recording goes through the `metrics` facade. Nothing is exported unless
//! the embedding process installs a recorder.

/// Metric names and shared label values
pub mod labels {
    /// Completed cycles, labelled by phase and outcome
    pub const CYCLES_TOTAL: &str = "conn_churn_cycles_total";
    /// Connect failures, labelled by phase and error kind
    pub const CONNECT_FAILURES_TOTAL: &str = "conn_churn_connect_failures_total";
    /// Escalated failures, labelled by phase
    pub const FATAL_ESCALATIONS_TOTAL: &str = "conn_churn_fatal_escalations_total";
    /// Wall time of a full cycle in milliseconds
    pub const CYCLE_DURATION_MS: &str = "conn_churn_cycle_duration_ms";
    /// Last sampled memory reading, labelled by sample label and stage
    pub const MEMORY_BYTES: &str = "conn_churn_memory_bytes";

    /// Cycle outcome: connect succeeded
    pub const OUTCOME_SUCCESS: &str = "success";
    /// Cycle outcome: connect failed
    pub const OUTCOME_FAILED: &str = "failed";

    /// Memory reading taken before reclamation
    pub const STAGE_BEFORE: &str = "before";
    /// Memory reading taken after reclamation
    pub const STAGE_AFTER: &str = "after";
}

/// Counter helpers
pub mod counters {
    use super::labels;

    /// Record one completed cycle
    pub fn cycle_completed(phase: &str, outcome: &'static str) {
        metrics::counter!(
            labels::CYCLES_TOTAL,
            "phase" => phase.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a connect failure
    pub fn connect_failed(phase: &str, kind: &'static str) {
        metrics::counter!(
            labels::CONNECT_FAILURES_TOTAL,
            "phase" => phase.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record an escalation to fatal
    pub fn fatal_escalation(phase: &str) {
        metrics::counter!(labels::FATAL_ESCALATIONS_TOTAL, "phase" => phase.to_string())
            .increment(1);
    }
}

/// Histogram helpers
pub mod histograms {
    use super::labels;

    /// Record the duration of one cycle
    pub fn cycle_duration(phase: &str, millis: u64) {
        metrics::histogram!(labels::CYCLE_DURATION_MS, "phase" => phase.to_string())
            .record(millis as f64);
    }
}

/// Gauge helpers
pub mod gauges {
    use super::labels;

    /// Publish a memory reading
    pub fn memory_bytes(label: &str, stage: &'static str, bytes: u64) {
        metrics::gauge!(
            labels::MEMORY_BYTES,
            "label" => label.to_string(),
            "stage" => stage
        )
        .set(bytes as f64);
    }
}
