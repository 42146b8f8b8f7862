//! Run orchestration
//!
//! A run is a fixed sequence:
//!
//! ```text
//! sample BEFORE_SYNC → sync phase → sample AFTER_SYNC → cooldown
//!   → sample BEFORE_ASYNC → concurrent phase → sample AFTER_ASYNC → linger
//! ```
//!
//! Every sample is awaited before the next step starts.

use super::memory::{check_growth, LeakSuspected, MemorySample, MemorySampler};
use super::phase::{
    RunPhase, RunSummary, AFTER_ASYNC, AFTER_SYNC, BEFORE_ASYNC, BEFORE_SYNC,
};
use super::policy::ErrorHandler;
use super::progress::DEFAULT_PROGRESS_INTERVAL;
use super::runner::LifecycleRunner;
use super::ProgressEvent;
use crate::connection::ConnectionConfig;
use crate::factory::ConnectionFactory;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Label of the sync phase
pub const SYNC_PHASE: &str = "sync";
/// Label of the concurrent phase
pub const ASYNC_PHASE: &str = "async";

/// Default cycles per phase
pub const DEFAULT_TARGET_CYCLES: u64 = 500;
/// Default wait inside each cycle
pub const DEFAULT_INTER_CYCLE_DELAY: Duration = Duration::from_secs(1);
/// Default wait between the two phases
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
/// Default allowed post-reclamation growth between phases
pub const DEFAULT_LEAK_TOLERANCE_BYTES: u64 = 8 * 1024 * 1024;

/// Run configuration; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Cycles per phase
    pub target_cycles: u64,
    /// Wait between configure and connect in each cycle
    pub inter_cycle_delay: Duration,
    /// Concurrent-phase width
    pub concurrency: usize,
    /// Wait between the sync and the concurrent phase
    pub cooldown: Duration,
    /// Cycles between progress events
    pub progress_interval: u64,
    /// Wait after the last sample before finishing; cancelling it still completes the run
    pub linger: Duration,
    /// Allowed growth for the leak check
    pub leak_tolerance_bytes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_cycles: DEFAULT_TARGET_CYCLES,
            inter_cycle_delay: DEFAULT_INTER_CYCLE_DELAY,
            concurrency: 1,
            cooldown: DEFAULT_COOLDOWN,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            linger: Duration::ZERO,
            leak_tolerance_bytes: DEFAULT_LEAK_TOLERANCE_BYTES,
        }
    }
}

impl RunConfig {
    /// Builder starting from the defaults
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder {
            config: RunConfig::default(),
        }
    }

    /// Sync phase described by this config
    pub fn sync_phase(&self) -> RunPhase {
        RunPhase::sync(SYNC_PHASE, self.target_cycles, self.inter_cycle_delay)
    }

    /// Concurrent phase described by this config
    pub fn async_phase(&self) -> RunPhase {
        RunPhase::concurrent(ASYNC_PHASE, self.target_cycles, self.inter_cycle_delay)
    }
}

/// Builder for [`RunConfig`]
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Cycles per phase
    pub fn target_cycles(mut self, cycles: u64) -> Self {
        self.config.target_cycles = cycles;
        self
    }

    /// Wait inside each cycle
    pub fn inter_cycle_delay(mut self, delay: Duration) -> Self {
        self.config.inter_cycle_delay = delay;
        self
    }

    /// Concurrent-phase width
    pub fn concurrency(mut self, width: usize) -> Self {
        self.config.concurrency = width;
        self
    }

    /// Wait between phases
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Cycles between progress events
    pub fn progress_interval(mut self, interval: u64) -> Self {
        self.config.progress_interval = interval;
        self
    }

    /// Wait after the last sample (cut short by cancellation)
    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Allowed post-reclamation growth
    pub fn leak_tolerance_bytes(mut self, bytes: u64) -> Self {
        self.config.leak_tolerance_bytes = bytes;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<RunConfig> {
        if self.config.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.config.progress_interval == 0 {
            return Err(Error::Config("progress interval must be at least 1".into()));
        }
        Ok(self.config)
    }
}

/// Position in the run sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Not started (BEFORE_SYNC is sampled here)
    Idle,
    /// Sync phase running
    RunningSync,
    /// Sync phase done and sampled
    SampledAfterSync,
    /// Waiting between phases (BEFORE_ASYNC is sampled at the end)
    Cooldown,
    /// Concurrent phase running
    RunningAsync,
    /// Concurrent phase done and sampled
    SampledAfterAsync,
    /// Finished
    Done,
    /// Stopped by a fatal error, cancellation or failure
    Aborted,
}

impl OrchestratorState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;

        matches!(
            (self, next),
            (Idle, RunningSync)
                | (RunningSync, SampledAfterSync)
                | (SampledAfterSync, Cooldown)
                | (Cooldown, RunningAsync)
                | (RunningAsync, SampledAfterAsync)
                | (SampledAfterAsync, Done)
        ) || (next == Aborted && !matches!(self, Done | Aborted))
    }

    /// Transition to new state
    pub fn transition(&mut self, next: OrchestratorState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::RunningSync => write!(f, "running_sync"),
            Self::SampledAfterSync => write!(f, "sampled_after_sync"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::RunningAsync => write!(f, "running_async"),
            Self::SampledAfterAsync => write!(f, "sampled_after_async"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Samples and phase summaries of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Final state
    pub state: OrchestratorState,
    /// Samples in the order taken
    pub samples: Vec<MemorySample>,
    /// Summaries of completed phases
    pub phases: Vec<RunSummary>,
}

impl RunReport {
    /// Sample with the given label
    pub fn sample(&self, label: &str) -> Option<&MemorySample> {
        self.samples.iter().find(|s| s.label == label)
    }

    /// Compare the after-reclamation readings of the two phases
    pub fn leak_check(&self, tolerance_bytes: u64) -> Option<LeakSuspected> {
        let earlier = self.sample(AFTER_SYNC)?;
        let later = self.sample(AFTER_ASYNC)?;
        check_growth(earlier, later, tolerance_bytes)
    }
}

/// Drives a whole run
pub struct Orchestrator<F: ConnectionFactory> {
    config: RunConfig,
    runner: LifecycleRunner<F>,
    sampler: Arc<MemorySampler>,
    cancel: CancellationToken,
    state: OrchestratorState,
    phases: Vec<RunSummary>,
}

impl<F: ConnectionFactory> Orchestrator<F> {
    /// Orchestrator over a factory, a connection config and a sampler
    pub fn new(
        config: RunConfig,
        factory: Arc<F>,
        connection: Arc<ConnectionConfig>,
        sampler: MemorySampler,
    ) -> Self {
        let cancel = CancellationToken::new();
        let runner = LifecycleRunner::new(factory, connection)
            .concurrency(config.concurrency)
            .progress_interval(config.progress_interval)
            .cancellation(cancel.clone());
        Self {
            config,
            runner,
            sampler: Arc::new(sampler),
            cancel,
            state: OrchestratorState::Idle,
            phases: Vec::new(),
        }
    }

    /// Escalation policy for both phases
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.runner = self.runner.error_handler(handler);
        self
    }

    /// Channel receiving progress events of both phases
    pub fn progress_sink(mut self, sink: UnboundedSender<ProgressEvent>) -> Self {
        self.runner = self.runner.progress_sink(sink);
        self
    }

    /// Token that stops the run
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.runner = self.runner.cancellation(token.clone());
        self.cancel = token;
        self
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Samples taken so far
    pub fn samples(&self) -> Vec<MemorySample> {
        self.sampler.samples()
    }

    /// Report of everything recorded so far
    pub fn report(&self) -> RunReport {
        RunReport {
            state: self.state,
            samples: self.sampler.samples(),
            phases: self.phases.clone(),
        }
    }

    /// Run the whole sequence.
    ///
    /// On error the state becomes [`OrchestratorState::Aborted`]; samples
    /// already taken remain available through [`Self::report`].
    pub async fn run(&mut self) -> Result<RunReport> {
        if self.state != OrchestratorState::Idle {
            return Err(Error::InvalidState {
                expected: OrchestratorState::Idle.to_string(),
                actual: self.state.to_string(),
            });
        }

        let span = tracing::info_span!(
            "run",
            cycles = self.config.target_cycles,
            width = self.config.concurrency
        );
        match self.execute().instrument(span).await {
            Ok(()) => Ok(self.report()),
            Err(e) => {
                tracing::error!(state = %self.state, error = %e, "run aborted");
                self.state = OrchestratorState::Aborted;
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> Result<()> {
        self.sample(BEFORE_SYNC).await?;

        self.state.transition(OrchestratorState::RunningSync)?;
        let summary = self.runner.run(&self.config.sync_phase()).await?;
        self.phases.push(summary);
        self.sample(AFTER_SYNC).await?;
        self.state.transition(OrchestratorState::SampledAfterSync)?;

        self.state.transition(OrchestratorState::Cooldown)?;
        tracing::info!(cooldown_secs = self.config.cooldown.as_secs_f64(), "cooldown");
        self.wait(self.config.cooldown, "cooldown").await?;
        self.sample(BEFORE_ASYNC).await?;

        self.state.transition(OrchestratorState::RunningAsync)?;
        let summary = self.runner.run(&self.config.async_phase()).await?;
        self.phases.push(summary);
        self.sample(AFTER_ASYNC).await?;
        self.state.transition(OrchestratorState::SampledAfterAsync)?;

        // Every phase and sample is done; cancelling the linger ends the run normally
        if !self.config.linger.is_zero() {
            tracing::info!(linger_secs = self.config.linger.as_secs_f64(), "lingering");
            if self.wait(self.config.linger, "linger").await.is_err() {
                tracing::info!("linger interrupted");
            }
        }

        self.state.transition(OrchestratorState::Done)?;
        tracing::info!("run complete");
        Ok(())
    }

    /// Take a sample on a blocking worker and wait for it
    async fn sample(&self, label: &'static str) -> Result<MemorySample> {
        let sampler = self.sampler.clone();
        tokio::task::spawn_blocking(move || sampler.sample(label))
            .await
            .map_err(|e| Error::Worker(format!("sampling {}: {}", label, e)))?
    }

    async fn wait(&self, duration: Duration, step: &str) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled { phase: step.to_string() }),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
