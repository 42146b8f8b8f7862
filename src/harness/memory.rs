//! Memory sampling
//!
//! A sample reads a probe, forces a reclamation pass, and reads again. Two
//! probes are provided: process resident set size (sysinfo) and bytes live in
//! the [`TrackingAllocator`]. Exact byte counts are platform and allocator
//! dependent; only the trend between samples is meaningful.

use crate::metrics::{gauges, labels};
use crate::{Error, Result};
use serde::Serialize;
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate};

/// Default wait before trimming the heap
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// What a probe measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMetric {
    /// Process resident set size
    ResidentSet,
    /// Bytes currently allocated through the tracking allocator
    HeapAllocated,
}

impl std::fmt::Display for MemoryMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResidentSet => write!(f, "resident"),
            Self::HeapAllocated => write!(f, "allocated"),
        }
    }
}

impl std::str::FromStr for MemoryMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resident" | "rss" => Ok(Self::ResidentSet),
            "allocated" | "heap" => Ok(Self::HeapAllocated),
            _ => Err(Error::Config(format!(
                "invalid metric '{}': expected resident or allocated",
                s
            ))),
        }
    }
}

/// One labelled before/after reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    /// Sample label (`BEFORE_SYNC`, ...)
    pub label: String,
    /// What was measured
    pub metric: MemoryMetric,
    /// Reading before reclamation
    pub before_bytes: u64,
    /// Reading after reclamation
    pub after_bytes: u64,
}

impl MemorySample {
    /// Bytes freed by the reclamation pass (negative if memory grew)
    pub fn reclaimed_bytes(&self) -> i64 {
        self.before_bytes as i64 - self.after_bytes as i64
    }
}

/// Reads a process memory metric
pub trait MemoryProbe: Send + Sync {
    /// Metric this probe reports
    fn metric(&self) -> MemoryMetric;

    /// Current reading in bytes
    fn current_bytes(&self) -> Result<u64>;
}

/// Resident set size of the current process
pub struct ResidentSetProbe {
    pid: Pid,
    system: Mutex<sysinfo::System>,
}

impl ResidentSetProbe {
    /// Probe for the current process
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| Error::Memory(format!("cannot determine current pid: {}", e)))?;
        Ok(Self {
            pid,
            system: Mutex::new(sysinfo::System::new()),
        })
    }
}

impl MemoryProbe for ResidentSetProbe {
    fn metric(&self) -> MemoryMetric {
        MemoryMetric::ResidentSet
    }

    fn current_bytes(&self) -> Result<u64> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| Error::Memory("process probe lock poisoned".into()))?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| Error::Memory(format!("process {} not found", self.pid)))
    }
}

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Global allocator that counts live bytes on top of the system allocator
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator = TrackingAllocator;
/// ```
pub struct TrackingAllocator;

impl TrackingAllocator {
    /// Bytes currently allocated
    pub fn allocated_bytes() -> usize {
        ALLOCATED.load(Ordering::Relaxed)
    }

    /// Allocations made since start
    pub fn total_allocations() -> u64 {
        ALLOCATIONS.load(Ordering::Relaxed)
    }

    /// Whether this allocator is the process's global allocator
    pub fn is_installed() -> bool {
        Self::total_allocations() > 0
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                ALLOCATED.fetch_add(new_size - layout.size(), Ordering::Relaxed);
            } else {
                ALLOCATED.fetch_sub(layout.size() - new_size, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

/// Bytes live in the [`TrackingAllocator`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorProbe;

impl MemoryProbe for AllocatorProbe {
    fn metric(&self) -> MemoryMetric {
        MemoryMetric::HeapAllocated
    }

    fn current_bytes(&self) -> Result<u64> {
        if !TrackingAllocator::is_installed() {
            return Err(Error::Memory(
                "tracking allocator is not the global allocator".into(),
            ));
        }
        Ok(TrackingAllocator::allocated_bytes() as u64)
    }
}

/// Forces a reclamation pass
pub trait Reclaimer: Send + Sync {
    /// Block until deferred cleanup has settled and freed memory is returned
    fn reclaim(&self) -> Result<()>;
}

/// Waits for deferred teardown to finish, then trims the heap
#[derive(Debug, Clone, Copy)]
pub struct TrimReclaimer {
    settle: Duration,
}

impl TrimReclaimer {
    /// Reclaimer with the given settle interval
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

impl Default for TrimReclaimer {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE)
    }
}

impl Reclaimer for TrimReclaimer {
    fn reclaim(&self) -> Result<()> {
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        trim_heap();
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn trim_heap() {
    // SAFETY: malloc_trim only walks glibc's own arenas
    let released = unsafe { libc::malloc_trim(0) };
    tracing::trace!(released = released != 0, "malloc_trim");
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn trim_heap() {}

/// Takes labelled samples and keeps them in an append-only log
pub struct MemorySampler {
    probe: Box<dyn MemoryProbe>,
    reclaimer: Box<dyn Reclaimer>,
    log: Mutex<Vec<MemorySample>>,
}

impl MemorySampler {
    /// Sampler over a probe and a reclaimer
    pub fn new(probe: impl MemoryProbe + 'static, reclaimer: impl Reclaimer + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            reclaimer: Box::new(reclaimer),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Sampler for the given metric with the default reclaimer
    pub fn for_metric(metric: MemoryMetric, settle: Duration) -> Result<Self> {
        let reclaimer = TrimReclaimer::new(settle);
        Ok(match metric {
            MemoryMetric::ResidentSet => Self::new(ResidentSetProbe::new()?, reclaimer),
            MemoryMetric::HeapAllocated => Self::new(AllocatorProbe, reclaimer),
        })
    }

    /// Metric of the underlying probe
    pub fn metric(&self) -> MemoryMetric {
        self.probe.metric()
    }

    /// Read, reclaim, read. Blocks for the whole reclamation pass.
    pub fn sample(&self, label: &str) -> Result<MemorySample> {
        let before_bytes = self.probe.current_bytes()?;
        self.reclaimer.reclaim()?;
        let after_bytes = self.probe.current_bytes()?;

        let sample = MemorySample {
            label: label.to_string(),
            metric: self.probe.metric(),
            before_bytes,
            after_bytes,
        };

        gauges::memory_bytes(label, labels::STAGE_BEFORE, before_bytes);
        gauges::memory_bytes(label, labels::STAGE_AFTER, after_bytes);
        tracing::info!(
            label,
            metric = %sample.metric,
            before_bytes,
            after_bytes,
            reclaimed_bytes = sample.reclaimed_bytes(),
            "memory sample"
        );

        self.log
            .lock()
            .map_err(|_| Error::Memory("sample log lock poisoned".into()))?
            .push(sample.clone());
        Ok(sample)
    }

    /// Samples taken so far, in order
    pub fn samples(&self) -> Vec<MemorySample> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Post-reclamation growth beyond tolerance between two samples
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakSuspected {
    /// Earlier sample label
    pub earlier: String,
    /// Later sample label
    pub later: String,
    /// Growth of the after-reclamation reading
    pub growth_bytes: u64,
    /// Allowed growth
    pub tolerance_bytes: u64,
}

impl std::fmt::Display for LeakSuspected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "resource leak suspected: {} grew {} bytes over {} (tolerance {} bytes)",
            self.later, self.growth_bytes, self.earlier, self.tolerance_bytes
        )
    }
}

/// Compare the after-reclamation readings of two samples
pub fn check_growth(
    earlier: &MemorySample,
    later: &MemorySample,
    tolerance_bytes: u64,
) -> Option<LeakSuspected> {
    let growth_bytes = later.after_bytes.saturating_sub(earlier.after_bytes);
    (growth_bytes > tolerance_bytes).then(|| LeakSuspected {
        earlier: earlier.label.clone(),
        later: later.label.clone(),
        growth_bytes,
        tolerance_bytes,
    })
}
