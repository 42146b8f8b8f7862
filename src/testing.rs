//! In-process test double for [`ConnectionFactory`]
//!
//! `FakeFactory` needs no network. Its handles can be slow, fail on a
//! schedule, hold a per-connection buffer, and optionally leak that buffer on
//! release instead of freeing it. Every call is counted in [`FakeStats`].

use crate::connection::ConnectionConfig;
use crate::error::ConnectError;
use crate::factory::{AsyncConnection, BlockingConnection, ConnectionFactory};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const CANCEL_POLL: Duration = Duration::from_millis(5);

/// When connect attempts fail; attempts are numbered factory-wide from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Always connect
    #[default]
    Never,
    /// Never connect
    Always,
    /// Fail attempts that are multiples of n
    EveryNth(u64),
    /// Fail the first n attempts
    FirstN(u64),
}

impl FailureMode {
    fn fails(&self, attempt: u64) -> bool {
        match *self {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::EveryNth(n) => n > 0 && attempt % n == 0,
            FailureMode::FirstN(n) => attempt <= n,
        }
    }
}

/// Behaviour of every handle a [`FakeFactory`] creates
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Time spent in connect
    pub connect_latency: Duration,
    /// Failure schedule
    pub failure: FailureMode,
    /// Bytes allocated (and touched) by a successful connect
    pub buffer_bytes: usize,
    /// Keep the buffer alive after release instead of freeing it
    pub leak_on_release: bool,
}

impl FakeBehavior {
    /// Instant handles failing on the given schedule
    pub fn failing(failure: FailureMode) -> Self {
        Self {
            failure,
            ..Self::default()
        }
    }

    /// Handles holding `buffer_bytes` while connected; leaked on release if `leak` is set
    pub fn with_buffer(buffer_bytes: usize, leak: bool) -> Self {
        Self {
            buffer_bytes,
            leak_on_release: leak,
            ..Self::default()
        }
    }
}

/// Call counters shared by a factory and its handles
#[derive(Debug, Default)]
pub struct FakeStats {
    created: AtomicU64,
    configured: AtomicU64,
    connect_attempts: AtomicU64,
    connected: AtomicU64,
    releases: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl FakeStats {
    /// Handles created
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// `configure` calls
    pub fn configured(&self) -> u64 {
        self.configured.load(Ordering::SeqCst)
    }

    /// `connect` calls
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connects
    pub fn connected(&self) -> u64 {
        self.connected.load(Ordering::SeqCst)
    }

    /// `release` calls, repeated calls included
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Handles created but not yet released
    pub fn outstanding(&self) -> u64 {
        self.created().saturating_sub(self.releases())
    }

    /// Highest number of connects in progress at once
    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements in-flight on every exit from connect, cancellation included
struct InFlight<'a>(&'a FakeStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a FakeStats) -> Self {
        stats.enter();
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Factory for fake handles
pub struct FakeFactory {
    behavior: FakeBehavior,
    stats: Arc<FakeStats>,
    leaked: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeFactory {
    /// Factory with the given behaviour
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            stats: Arc::new(FakeStats::default()),
            leaked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared counters
    pub fn stats(&self) -> &FakeStats {
        &self.stats
    }

    /// Bytes leaked by released handles so far
    pub fn leaked_bytes(&self) -> usize {
        match self.leaked.lock() {
            Ok(leaked) => leaked.iter().map(Vec::len).sum(),
            Err(poisoned) => poisoned.into_inner().iter().map(Vec::len).sum(),
        }
    }

    /// Free everything leaked so far
    pub fn clear_leaks(&self) {
        match self.leaked.lock() {
            Ok(mut leaked) => leaked.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn core(&self) -> FakeCore {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        FakeCore {
            behavior: self.behavior.clone(),
            stats: self.stats.clone(),
            leaked: self.leaked.clone(),
            buffer: None,
            released: false,
        }
    }
}

impl ConnectionFactory for FakeFactory {
    type Blocking = FakeConnection;
    type Async = FakeAsyncConnection;

    fn create_blocking(&self, _config: &ConnectionConfig) -> FakeConnection {
        FakeConnection(self.core())
    }

    fn create_async(&self, _config: &ConnectionConfig) -> FakeAsyncConnection {
        FakeAsyncConnection(self.core())
    }
}

struct FakeCore {
    behavior: FakeBehavior,
    stats: Arc<FakeStats>,
    leaked: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer: Option<Vec<u8>>,
    released: bool,
}

impl FakeCore {
    fn configure(&mut self) {
        self.stats.configured.fetch_add(1, Ordering::SeqCst);
    }

    fn next_attempt(&self) -> u64 {
        self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn finish_connect(&mut self, attempt: u64) -> Result<(), ConnectError> {
        if self.behavior.failure.fails(attempt) {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("fake connect {} refused", attempt),
            )));
        }
        if self.behavior.buffer_bytes > 0 {
            self.buffer = Some(vec![0xA5; self.behavior.buffer_bytes]);
        }
        self.stats.connected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
        if self.released {
            return;
        }
        self.released = true;

        if let Some(buffer) = self.buffer.take() {
            if self.behavior.leak_on_release {
                match self.leaked.lock() {
                    Ok(mut leaked) => leaked.push(buffer),
                    Err(poisoned) => poisoned.into_inner().push(buffer),
                }
            }
        }
    }
}

/// Blocking fake handle
pub struct FakeConnection(FakeCore);

impl BlockingConnection for FakeConnection {
    fn configure(&mut self, _config: &ConnectionConfig) {
        self.0.configure();
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        self.connect_cancellable(&CancellationToken::new())
    }

    fn connect_cancellable(&mut self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let attempt = self.0.next_attempt();
        let stats = self.0.stats.clone();
        let _guard = InFlight::enter(&stats);
        let deadline = Instant::now() + self.0.behavior.connect_latency;
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
        self.0.finish_connect(attempt)
    }

    fn release(&mut self) {
        self.0.release();
    }
}

/// Async fake handle
pub struct FakeAsyncConnection(FakeCore);

#[async_trait]
impl AsyncConnection for FakeAsyncConnection {
    fn configure(&mut self, _config: &ConnectionConfig) {
        self.0.configure();
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        let attempt = self.0.next_attempt();
        let stats = self.0.stats.clone();
        let _guard = InFlight::enter(&stats);
        if !self.0.behavior.connect_latency.is_zero() {
            tokio::time::sleep(self.0.behavior.connect_latency).await;
        }
        self.0.finish_connect(attempt)
    }

    async fn release(&mut self) {
        self.0.release();
    }
}
