//! Byte-budget accounting for live pipeline resources
//!
//! Every payload held by the pipeline is charged against a shared budget via
//! an owning [`ResourceGuard`]: charging happens on construction, crediting
//! on drop. Threshold crossings run registered cleanup callbacks; a periodic
//! task re-checks usage on the configured interval.

use crate::config::MemoryConfig;
use crate::error::{Result, UploadError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a tracked resource is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Chunk,
    Buffer,
    Stream,
    Worker,
    Cache,
}

/// Bookkeeping for one tracked resource
#[derive(Debug, Clone)]
pub struct ResourceStats {
    pub kind: ResourceKind,
    pub size: u64,
    pub created_at: Instant,
    pub metadata: HashMap<String, String>,
}

/// Memory pressure level derived from the thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

/// Point-in-time tracker counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub total_allocated: u64,
    pub active_resources: usize,
    pub peak_memory_usage: u64,
    pub pressure: MemoryPressure,
}

type CleanupCallback = Arc<dyn Fn() + Send + Sync>;

struct TrackerState {
    next_id: u64,
    resources: HashMap<u64, ResourceStats>,
    total_allocated: u64,
    peak_memory_usage: u64,
    /// Run at warning pressure and above
    cleanup_callbacks: Vec<CleanupCallback>,
    /// Run at critical pressure only; registered disposers stand in for
    /// per-resource `dispose` since guards own their payloads
    critical_callbacks: Vec<CleanupCallback>,
}

/// Shared resource accountant
pub struct ResourceTracker {
    state: Mutex<TrackerState>,
    max_memory: u64,
    warning_threshold: u64,
    critical_threshold: u64,
    cleanup_interval: Duration,
    auto_cleanup: bool,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ResourceTracker {
    pub fn new(config: &MemoryConfig) -> Self {
        let warning = (config.max_memory_usage as f64 * config.thresholds.warning) as u64;
        let critical = (config.max_memory_usage as f64 * config.thresholds.critical) as u64;

        ResourceTracker {
            state: Mutex::new(TrackerState {
                next_id: 1,
                resources: HashMap::new(),
                total_allocated: 0,
                peak_memory_usage: 0,
                cleanup_callbacks: Vec::new(),
                critical_callbacks: Vec::new(),
            }),
            max_memory: config.max_memory_usage,
            warning_threshold: warning,
            critical_threshold: critical,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            auto_cleanup: config.enable_auto_cleanup,
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Charge `size` bytes against the budget and return the owning guard.
    ///
    /// The charge is credited back when the guard drops (or on explicit
    /// [`ResourceTracker::release`]). Fails when the hard budget would be
    /// exceeded, after giving cleanup callbacks one chance to free memory.
    pub fn track(
        self: &Arc<Self>,
        kind: ResourceKind,
        size: u64,
        metadata: HashMap<String, String>,
    ) -> Result<ResourceGuard> {
        if self.would_exceed_budget(size) {
            // One cleanup pass before rejecting
            self.run_callbacks(MemoryPressure::Critical);
            if self.would_exceed_budget(size) {
                return Err(UploadError::MemoryBudget(format!(
                    "allocating {} bytes would exceed the {} byte budget",
                    size, self.max_memory
                )));
            }
        }

        let (id, pressure) = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.resources.insert(
                id,
                ResourceStats {
                    kind,
                    size,
                    created_at: Instant::now(),
                    metadata,
                },
            );
            state.total_allocated += size;
            state.peak_memory_usage = state.peak_memory_usage.max(state.total_allocated);
            (id, self.pressure_for(state.total_allocated))
        };

        if pressure > MemoryPressure::Normal {
            self.run_callbacks(pressure);
        }

        Ok(ResourceGuard {
            tracker: Arc::clone(self),
            id,
            released: false,
        })
    }

    fn would_exceed_budget(&self, size: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.total_allocated + size > self.max_memory
    }

    fn pressure_for(&self, allocated: u64) -> MemoryPressure {
        if allocated >= self.critical_threshold {
            MemoryPressure::Critical
        } else if allocated >= self.warning_threshold {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    /// Untrack one resource and credit its bytes back. Idempotent.
    pub fn release(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(stats) = state.resources.remove(&id) {
            state.total_allocated = state.total_allocated.saturating_sub(stats.size);
            true
        } else {
            false
        }
    }

    /// Register a callback run when usage crosses the warning threshold
    pub fn on_memory_pressure(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .cleanup_callbacks
            .push(Arc::new(callback));
    }

    /// Register a disposer run only at critical pressure
    pub fn on_critical_pressure(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .critical_callbacks
            .push(Arc::new(callback));
    }

    fn run_callbacks(&self, pressure: MemoryPressure) {
        let (cleanup, critical) = {
            let state = self.state.lock().unwrap();
            (
                state.cleanup_callbacks.clone(),
                state.critical_callbacks.clone(),
            )
        };

        for cb in &cleanup {
            cb();
        }
        if pressure >= MemoryPressure::Critical {
            warn!("memory usage critical, running disposers");
            for cb in &critical {
                cb();
            }
        }
    }

    /// Evaluate current usage and run the appropriate callbacks
    pub fn check_memory_usage(&self) -> MemoryPressure {
        let pressure = {
            let state = self.state.lock().unwrap();
            self.pressure_for(state.total_allocated)
        };

        match pressure {
            MemoryPressure::Normal => {}
            MemoryPressure::Warning => {
                debug!("memory usage above warning threshold");
                self.run_callbacks(MemoryPressure::Warning);
            }
            MemoryPressure::Critical => {
                self.run_callbacks(MemoryPressure::Critical);
            }
        }
        pressure
    }

    /// Start the periodic memory check, honoring `enable_auto_cleanup`
    pub fn start_auto_cleanup(self: &Arc<Self>) {
        if !self.auto_cleanup {
            return;
        }
        let mut guard = self.task.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let tracker = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = self.cleanup_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.check_memory_usage();
                    }
                }
            }
        }));
    }

    /// Stop the periodic memory check
    pub fn stop_auto_cleanup(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock().unwrap();
        TrackerSnapshot {
            total_allocated: state.total_allocated,
            active_resources: state.resources.len(),
            peak_memory_usage: state.peak_memory_usage,
            pressure: self.pressure_for(state.total_allocated),
        }
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owning handle for one charged resource.
///
/// Dropping the guard credits the charge back; [`ResourceGuard::release`]
/// does so eagerly.
pub struct ResourceGuard {
    tracker: Arc<ResourceTracker>,
    id: u64,
    released: bool,
}

impl ResourceGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credit the charge back now instead of at drop
    pub fn release(mut self) {
        self.tracker.release(self.id);
        self.released = true;
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.release(self.id);
        }
    }
}
