//! Lifecycle runner
//!
//! Runs the cycles of one phase. A cycle creates a handle, configures it,
//! waits the inter-cycle delay, connects and releases. The handle is released
//! before the outcome is recorded, so the error handler never sees a live
//! connection.

use super::phase::{CycleResult, ExecutionMode, RunPhase, RunSummary};
use super::policy::{ContinueOnError, CycleContext, ErrorDecision, ErrorHandler};
use super::progress::{ProgressTracker, DEFAULT_PROGRESS_INTERVAL};
use super::ProgressEvent;
use crate::connection::ConnectionConfig;
use crate::error::ConnectError;
use crate::factory::{AsyncLease, BlockingConnection, ConnectionFactory, Lease};
use crate::metrics::{counters, histograms, labels};
use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Granularity at which a blocking delay notices cancellation
const CANCEL_POLL: Duration = Duration::from_millis(50);

enum CycleOutcome {
    Finished(CycleResult),
    /// Stopped by cancellation or a fatal escalation; not counted
    Interrupted,
}

/// Runs phases against a [`ConnectionFactory`]
pub struct LifecycleRunner<F: ConnectionFactory> {
    factory: Arc<F>,
    config: Arc<ConnectionConfig>,
    concurrency: usize,
    handler: Arc<dyn ErrorHandler>,
    progress_interval: u64,
    progress_sink: Option<UnboundedSender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl<F: ConnectionFactory> Clone for LifecycleRunner<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            config: self.config.clone(),
            concurrency: self.concurrency,
            handler: self.handler.clone(),
            progress_interval: self.progress_interval,
            progress_sink: self.progress_sink.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<F: ConnectionFactory> LifecycleRunner<F> {
    /// Runner with width 1, no escalation and progress every 100 cycles
    pub fn new(factory: Arc<F>, config: Arc<ConnectionConfig>) -> Self {
        Self {
            factory,
            config,
            concurrency: 1,
            handler: Arc::new(ContinueOnError),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress_sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Cycles in flight at once in concurrent mode (minimum 1)
    pub fn concurrency(mut self, width: usize) -> Self {
        self.concurrency = width.max(1);
        self
    }

    /// Escalation policy
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Same as [`Self::error_handler`] for an already shared handler
    pub fn shared_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Cycles between progress events (0 disables them)
    pub fn progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Channel receiving progress events
    pub fn progress_sink(mut self, sink: UnboundedSender<ProgressEvent>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Token that stops the run
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Configured width
    pub fn width(&self) -> usize {
        self.concurrency
    }

    /// Run a phase in its mode.
    ///
    /// Sync phases run on a blocking worker thread so the runtime stays free.
    pub async fn run(&self, phase: &RunPhase) -> Result<RunSummary> {
        let span = tracing::info_span!("phase", label = %phase.label, mode = %phase.mode);
        match phase.mode {
            ExecutionMode::Sync => {
                let runner = self.clone();
                let owned = phase.clone();
                let worker_span = span.clone();
                tokio::task::spawn_blocking(move || {
                    worker_span.in_scope(|| runner.run_blocking(&owned))
                })
                .instrument(span)
                .await
                .map_err(|e| Error::Worker(format!("sync phase worker: {}", e)))?
            }
            ExecutionMode::Concurrent => self.run_concurrent(phase).instrument(span).await,
        }
    }

    /// Run every cycle of the phase on the current thread
    pub fn run_blocking(&self, phase: &RunPhase) -> Result<RunSummary> {
        let tracker = self.tracker(phase);
        let started = Instant::now();
        self.log_start(phase);

        for cycle in 1..=phase.target_cycles {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = match self.blocking_cycle(phase) {
                CycleOutcome::Finished(result) => result,
                CycleOutcome::Interrupted => break,
            };
            if let Some(source) = self.settle(phase, &tracker, cycle, result) {
                return Err(self.fatal(phase, &tracker, cycle, source));
            }
        }

        self.finish(phase, &tracker, started)
    }

    /// Run the phase as cooperative tasks, at most `concurrency` in flight
    pub async fn run_concurrent(&self, phase: &RunPhase) -> Result<RunSummary> {
        let tracker = self.tracker(phase);
        let started = Instant::now();
        self.log_start(phase);

        // Child of the run token: set on cancellation or on the first fatal
        let stop = self.cancel.child_token();
        let mut fatal: Option<(u64, ConnectError)> = None;

        let mut cycles = stream::iter(1..=phase.target_cycles)
            .map(|cycle| {
                let stop = stop.clone();
                async move { (cycle, self.async_cycle(phase, &stop).await) }
            })
            .buffer_unordered(self.concurrency);

        while let Some((cycle, outcome)) = cycles.next().await {
            let CycleOutcome::Finished(result) = outcome else {
                continue;
            };
            if let Some(source) = self.settle(phase, &tracker, cycle, result) {
                if fatal.is_none() {
                    fatal = Some((cycle, source));
                    stop.cancel();
                }
            }
        }
        drop(cycles);

        if let Some((cycle, source)) = fatal {
            return Err(self.fatal(phase, &tracker, cycle, source));
        }
        self.finish(phase, &tracker, started)
    }

    fn blocking_cycle(&self, phase: &RunPhase) -> CycleOutcome {
        let mut lease = Lease::new(self.factory.create_blocking(&self.config));
        lease.configure(&self.config);

        if !sleep_unless_cancelled(&self.cancel, phase.inter_cycle_delay) {
            lease.release();
            return CycleOutcome::Interrupted;
        }

        let started = Instant::now();
        let result = lease.connect_cancellable(&self.cancel);
        lease.release();

        match result {
            Err(ConnectError::Cancelled) if self.cancel.is_cancelled() => CycleOutcome::Interrupted,
            result => {
                histograms::cycle_duration(&phase.label, started.elapsed().as_millis() as u64);
                CycleOutcome::Finished(result.into())
            }
        }
    }

    async fn async_cycle(&self, phase: &RunPhase, stop: &CancellationToken) -> CycleOutcome {
        if stop.is_cancelled() {
            return CycleOutcome::Interrupted;
        }

        let mut lease = AsyncLease::new(self.factory.create_async(&self.config));
        lease.configure(&self.config);

        if !phase.inter_cycle_delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    lease.release().await;
                    return CycleOutcome::Interrupted;
                }
                _ = tokio::time::sleep(phase.inter_cycle_delay) => {}
            }
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = lease.connect() => Some(result),
        };
        lease.release().await;

        match result {
            Some(result) => {
                histograms::cycle_duration(&phase.label, started.elapsed().as_millis() as u64);
                CycleOutcome::Finished(result.into())
            }
            None => CycleOutcome::Interrupted,
        }
    }

    /// Record a released cycle; returns the error when the handler escalates
    fn settle(
        &self,
        phase: &RunPhase,
        tracker: &ProgressTracker,
        cycle: u64,
        result: CycleResult,
    ) -> Option<ConnectError> {
        tracker.record(&result);

        let error = match result {
            CycleResult::Success => {
                counters::cycle_completed(&phase.label, labels::OUTCOME_SUCCESS);
                return None;
            }
            CycleResult::Failed(error) => error,
        };

        counters::cycle_completed(&phase.label, labels::OUTCOME_FAILED);
        counters::connect_failed(&phase.label, error.kind());
        tracing::warn!(
            phase = %phase.label,
            cycle,
            kind = error.kind(),
            error = %error,
            "connect failed"
        );

        let ctx = CycleContext {
            phase: &phase.label,
            mode: phase.mode,
            cycle,
            failures: tracker.failed(),
        };
        let decision = catch_unwind(AssertUnwindSafe(|| self.handler.on_error(&ctx, &error)))
            .unwrap_or_else(|_| {
                tracing::error!(phase = %phase.label, cycle, "error handler panicked, escalating");
                ErrorDecision::Escalate
            });

        match decision {
            ErrorDecision::Continue => None,
            ErrorDecision::Escalate => Some(error),
        }
    }

    fn fatal(
        &self,
        phase: &RunPhase,
        tracker: &ProgressTracker,
        cycle: u64,
        source: ConnectError,
    ) -> Error {
        counters::fatal_escalation(&phase.label);
        tracing::error!(
            phase = %phase.label,
            cycle,
            completed = tracker.completed(),
            error = %source,
            "fatal escalation, aborting phase"
        );
        Error::Fatal {
            phase: phase.label.clone(),
            cycle,
            completed: tracker.completed(),
            source,
        }
    }

    fn finish(
        &self,
        phase: &RunPhase,
        tracker: &ProgressTracker,
        started: Instant,
    ) -> Result<RunSummary> {
        let summary = tracker.summary(phase.target_cycles, started.elapsed());
        if self.cancel.is_cancelled() {
            tracing::warn!(
                phase = %phase.label,
                completed = summary.completed(),
                "phase cancelled"
            );
            return Err(Error::Cancelled {
                phase: phase.label.clone(),
            });
        }

        tracing::info!(
            phase = %phase.label,
            mode = %phase.mode,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "phase finished"
        );
        Ok(summary)
    }

    fn tracker(&self, phase: &RunPhase) -> ProgressTracker {
        ProgressTracker::new(phase, self.progress_interval, self.progress_sink.clone())
    }

    fn log_start(&self, phase: &RunPhase) {
        tracing::info!(
            phase = %phase.label,
            mode = %phase.mode,
            target_cycles = phase.target_cycles,
            delay_ms = phase.inter_cycle_delay.as_millis() as u64,
            width = if phase.mode == ExecutionMode::Concurrent { self.concurrency } else { 1 },
            "phase started"
        );
    }
}

/// Sleep for `duration`; false if the token fired first
fn sleep_unless_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::policy::EscalateOnFailure;
    use crate::testing::{FailureMode, FakeBehavior, FakeFactory};

    fn config() -> Arc<ConnectionConfig> {
        Arc::new(
            ConnectionConfig::builder("fake.invalid", "tester")
                .build()
                .unwrap(),
        )
    }

    fn runner(behavior: FakeBehavior) -> (LifecycleRunner<FakeFactory>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new(behavior));
        (LifecycleRunner::new(factory.clone(), config()), factory)
    }

    #[test]
    fn test_sleep_unless_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(&token, Duration::ZERO));
        token.cancel();
        assert!(!sleep_unless_cancelled(&token, Duration::from_secs(60)));
    }

    #[test]
    fn test_blocking_zero_cycles() {
        let (runner, factory) = runner(FakeBehavior::default());
        let summary = runner
            .run_blocking(&RunPhase::sync("sync", 0, Duration::ZERO))
            .unwrap();
        assert_eq!(summary.completed(), 0);
        assert_eq!(factory.stats().created(), 0);
    }

    #[test]
    fn test_blocking_escalation_stops_batch() {
        let (runner, factory) = runner(FakeBehavior::failing(FailureMode::Always));
        let runner = runner.error_handler(EscalateOnFailure::first());
        let err = runner
            .run_blocking(&RunPhase::sync("sync", 5, Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::Fatal { cycle: 1, completed: 1, .. }));
        assert_eq!(factory.stats().created(), 1);
        assert_eq!(factory.stats().releases(), 1);
    }

    #[test]
    fn test_blocking_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let (runner, factory) = runner(FakeBehavior::default());
        let err = runner
            .cancellation(token)
            .run_blocking(&RunPhase::sync("sync", 5, Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(factory.stats().created(), 0);
    }

    #[test]
    fn test_blocking_cancel_interrupts_connect() {
        let behavior = FakeBehavior {
            connect_latency: Duration::from_secs(60),
            ..FakeBehavior::default()
        };
        let (runner, factory) = runner(behavior);
        let token = CancellationToken::new();
        let trigger = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = runner
            .cancellation(token)
            .run_blocking(&RunPhase::sync("sync", 3, Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(factory.stats().created(), 1);
        assert_eq!(factory.stats().releases(), 1);
        assert_eq!(factory.stats().connected(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_width_is_respected() {
        let behavior = FakeBehavior {
            connect_latency: Duration::from_millis(5),
            ..FakeBehavior::default()
        };
        let (runner, factory) = runner(behavior);
        let summary = runner
            .concurrency(4)
            .run_concurrent(&RunPhase::concurrent("async", 40, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 40);
        assert!(factory.stats().max_in_flight() <= 4);
        assert_eq!(factory.stats().releases(), 40);
    }

    #[tokio::test]
    async fn test_run_dispatches_sync_to_worker() {
        let (runner, factory) = runner(FakeBehavior::default());
        let summary = runner
            .run(&RunPhase::sync("sync", 3, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(summary.mode, ExecutionMode::Sync);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(factory.stats().releases(), 3);
    }
}
