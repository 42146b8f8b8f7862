//! Orchestrator sequencing tests
//!
//! A probe that reports the fake factory's release count stands in for a
//! memory reading, so each sample shows exactly how many cycles had finished
//! when it was taken.
//!
//! Run with: cargo test --test orchestrator

use conn_churn::connection::ConnectionConfig;
use conn_churn::harness::{
    EscalateOnFailure, MemoryMetric, MemoryProbe, MemorySampler, Orchestrator, OrchestratorState,
    Reclaimer, RunConfig, AFTER_ASYNC, AFTER_SYNC, ASYNC_PHASE, BEFORE_ASYNC, BEFORE_SYNC,
    SYNC_PHASE,
};
use conn_churn::testing::{FailureMode, FakeBehavior, FakeFactory};
use conn_churn::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type EventLog = Arc<Mutex<Vec<String>>>;

/// Reports releases seen so far as the "byte" count
struct ReleaseCountProbe {
    factory: Arc<FakeFactory>,
    events: EventLog,
}

impl MemoryProbe for ReleaseCountProbe {
    fn metric(&self) -> MemoryMetric {
        MemoryMetric::HeapAllocated
    }

    fn current_bytes(&self) -> conn_churn::Result<u64> {
        self.events.lock().unwrap().push("read".into());
        Ok(self.factory.stats().releases())
    }
}

struct RecordingReclaimer {
    events: EventLog,
}

impl Reclaimer for RecordingReclaimer {
    fn reclaim(&self) -> conn_churn::Result<()> {
        self.events.lock().unwrap().push("reclaim".into());
        Ok(())
    }
}

struct Fixture {
    orchestrator: Orchestrator<FakeFactory>,
    factory: Arc<FakeFactory>,
    events: EventLog,
}

fn fixture(behavior: FakeBehavior, config: RunConfig) -> Fixture {
    let factory = Arc::new(FakeFactory::new(behavior));
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sampler = MemorySampler::new(
        ReleaseCountProbe {
            factory: factory.clone(),
            events: events.clone(),
        },
        RecordingReclaimer {
            events: events.clone(),
        },
    );
    let connection = Arc::new(
        ConnectionConfig::builder("fake.invalid", "tester")
            .build()
            .expect("valid config"),
    );
    Fixture {
        orchestrator: Orchestrator::new(config, factory.clone(), connection, sampler),
        factory,
        events,
    }
}

fn quick_config(cycles: u64) -> RunConfig {
    RunConfig::builder()
        .target_cycles(cycles)
        .inter_cycle_delay(Duration::ZERO)
        .cooldown(Duration::ZERO)
        .progress_interval(10)
        .build()
        .expect("valid run config")
}

#[tokio::test]
async fn test_full_run_sequence() {
    let Fixture {
        mut orchestrator,
        factory,
        events,
    } = fixture(FakeBehavior::failing(FailureMode::EveryNth(4)), quick_config(20));

    let report = orchestrator.run().await.expect("run completes");

    assert_eq!(orchestrator.state(), OrchestratorState::Done);
    assert_eq!(report.state, OrchestratorState::Done);

    let labels: Vec<_> = report.samples.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec![BEFORE_SYNC, AFTER_SYNC, BEFORE_ASYNC, AFTER_ASYNC]);

    // Each reading shows every earlier cycle already released
    let readings: Vec<_> = report.samples.iter().map(|s| s.before_bytes).collect();
    assert_eq!(readings, vec![0, 20, 20, 40]);
    assert!(report.samples.iter().all(|s| s.after_bytes == s.before_bytes));

    assert_eq!(report.phases.len(), 2);
    assert_eq!(report.phases[0].label, SYNC_PHASE);
    assert_eq!(report.phases[1].label, ASYNC_PHASE);
    assert!(report.phases.iter().all(|p| p.completed() == 20 && p.failed == 5));
    assert_eq!(factory.stats().releases(), 40);

    // read, reclaim, read for every sample
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 12);
    for chunk in events.chunks(3) {
        assert_eq!(chunk, ["read", "reclaim", "read"]);
    }
}

#[tokio::test]
async fn test_fatal_escalation_aborts_remaining_sequence() {
    let Fixture {
        orchestrator,
        factory,
        ..
    } = fixture(FakeBehavior::failing(FailureMode::Always), quick_config(10));
    let mut orchestrator = orchestrator.error_handler(EscalateOnFailure::first());

    let err = orchestrator.run().await.expect_err("fatal escalation");
    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), 1);
    assert_eq!(orchestrator.state(), OrchestratorState::Aborted);

    let report = orchestrator.report();
    assert_eq!(report.state, OrchestratorState::Aborted);
    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.samples[0].label, BEFORE_SYNC);
    assert!(report.phases.is_empty());
    assert_eq!(factory.stats().created(), 1);
    assert_eq!(factory.stats().releases(), 1);
}

#[tokio::test]
async fn test_cancel_during_cooldown_keeps_samples() {
    let config = RunConfig::builder()
        .target_cycles(3)
        .inter_cycle_delay(Duration::ZERO)
        .cooldown(Duration::from_secs(30))
        .build()
        .expect("valid run config");
    let Fixture { orchestrator, .. } = fixture(FakeBehavior::default(), config);

    let token = CancellationToken::new();
    let mut orchestrator = orchestrator.cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let err = orchestrator.run().await.expect_err("cancelled");
    match &err {
        Error::Cancelled { phase } => assert_eq!(phase, "cooldown"),
        other => panic!("expected Cancelled, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 130);

    let report = orchestrator.report();
    let labels: Vec<_> = report.samples.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec![BEFORE_SYNC, AFTER_SYNC]);
    assert_eq!(report.phases.len(), 1);
}

#[tokio::test]
async fn test_progress_from_both_phases() {
    let Fixture { orchestrator, .. } = fixture(FakeBehavior::default(), quick_config(25));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut orchestrator = orchestrator.progress_sink(tx);

    orchestrator.run().await.expect("run completes");

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push((event.label, event.completed));
    }
    assert_eq!(
        seen,
        vec![
            (SYNC_PHASE.to_string(), 10),
            (SYNC_PHASE.to_string(), 20),
            (ASYNC_PHASE.to_string(), 10),
            (ASYNC_PHASE.to_string(), 20),
        ]
    );
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let Fixture {
        mut orchestrator, ..
    } = fixture(FakeBehavior::default(), quick_config(1));
    orchestrator.run().await.expect("first run completes");

    let err = orchestrator.run().await.expect_err("second run rejected");
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
}

#[tokio::test]
async fn test_cancelled_linger_still_completes_run() {
    let config = RunConfig::builder()
        .target_cycles(1)
        .inter_cycle_delay(Duration::ZERO)
        .cooldown(Duration::ZERO)
        .linger(Duration::from_secs(3600))
        .build()
        .expect("valid run config");
    let Fixture { orchestrator, .. } = fixture(FakeBehavior::default(), config);
    let token = CancellationToken::new();
    let mut orchestrator = orchestrator.cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let report = orchestrator
        .run()
        .await
        .expect("phases finished before the linger");
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
    assert_eq!(report.samples.len(), 4);
    assert_eq!(report.phases.len(), 2);
    assert!(report.leak_check(u64::MAX).is_none());
}
