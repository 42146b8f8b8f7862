//! Connection-churn harness
//!
//! * [`LifecycleRunner`] runs the cycles of one phase, sync or concurrent
//! * [`MemorySampler`] takes before/after readings around a reclamation pass
//! * [`Orchestrator`] sequences samples, phases and the cooldown between them

mod memory;
mod orchestrator;
mod phase;
mod policy;
mod progress;
mod runner;

pub use memory::{
    check_growth, AllocatorProbe, LeakSuspected, MemoryMetric, MemoryProbe, MemorySample,
    MemorySampler, Reclaimer, ResidentSetProbe, TrackingAllocator, TrimReclaimer, DEFAULT_SETTLE,
};
pub use orchestrator::{
    Orchestrator, OrchestratorState, RunConfig, RunConfigBuilder, RunReport, ASYNC_PHASE,
    DEFAULT_COOLDOWN, DEFAULT_INTER_CYCLE_DELAY, DEFAULT_LEAK_TOLERANCE_BYTES,
    DEFAULT_TARGET_CYCLES, SYNC_PHASE,
};
pub use phase::{
    CycleResult, ExecutionMode, ProgressEvent, RunPhase, RunSummary, AFTER_ASYNC, AFTER_SYNC,
    BEFORE_ASYNC, BEFORE_SYNC,
};
pub use policy::{ContinueOnError, CycleContext, ErrorDecision, ErrorHandler, EscalateOnFailure};
pub use progress::{ProgressTracker, DEFAULT_PROGRESS_INTERVAL};
pub use runner::LifecycleRunner;
