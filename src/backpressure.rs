//! Back-pressure and circuit breaking.
//!
//! Memory pressure is answered in three escalating steps, all relative to
//! the soft limit:
//!
//! - above 0.70: shrink batch sizes mildly (x0.75), no pause
//! - above 0.85: pause ~100 ms, shrink harder (x0.5, or x0.25 once usage
//!   passes the soft limit itself), count a back-pressure event
//! - at the hard threshold (see [`crate::memory`]): trip the circuit
//!   breaker - the current phase aborts, in-flight work finishes, nothing
//!   new is scheduled
//!
//! Checks are serialized behind one lock so a thousand concurrent tasks
//! cannot stampede the sampler or multiply the pause.

use crate::memory::MemoryMonitor;
use crate::stats::SharedState;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

/// Soft-limit ratio above which batches shrink mildly
const SHRINK_RATIO: f64 = 0.70;
/// Soft-limit ratio above which the pipeline pauses
const PAUSE_RATIO: f64 = 0.85;
/// Length of the back-pressure pause
const PAUSE: Duration = Duration::from_millis(100);
/// Minimum interval between over-limit warnings
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Floors below which shrinkage never pushes a batch
const FILE_BATCH_FLOOR: usize = 16;
const REAPER_BATCH_FLOOR: usize = 10;

/// Outcome of a pressure check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Proceed normally
    Nominal,
    /// Back-pressure applied (pause already happened)
    Soft,
    /// Circuit breaker tripped; the caller must stop scheduling work
    Critical,
}

/// Run-wide stop flags. `shutdown` is operator-requested (signal),
/// `aborted` is the circuit breaker. Either stops new work from being
/// scheduled; neither cancels work already in flight.
#[derive(Debug, Default)]
pub struct RunFlags {
    shutdown: AtomicBool,
    aborted: AtomicBool,
}

impl RunFlags {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// True when no new work should be scheduled.
    pub fn should_stop(&self) -> bool {
        self.is_shutdown() || self.is_aborted()
    }
}

/// A batch size that shrinks under pressure but never below its floor.
#[derive(Debug)]
pub struct BatchTuner {
    floor: usize,
    current: AtomicUsize,
}

impl BatchTuner {
    pub fn new(base: usize, floor: usize) -> Self {
        Self {
            floor: floor.min(base),
            current: AtomicUsize::new(base),
        }
    }

    pub fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Multiply the current size by `factor`, clamped at the floor.
    /// Returns the new size.
    pub fn shrink(&self, factor: f64) -> usize {
        let current = self.current.load(Ordering::Relaxed);
        let next = ((current as f64 * factor) as usize).max(self.floor);
        self.current.store(next, Ordering::Relaxed);
        next
    }
}

/// Serializes memory checks and applies the escalation ladder.
pub struct PressureController {
    monitor: Arc<MemoryMonitor>,
    file_batches: BatchTuner,
    reaper_batches: BatchTuner,
    gate: Mutex<Option<Instant>>,
}

impl PressureController {
    pub fn new(monitor: Arc<MemoryMonitor>, file_batch: usize, reaper_batch: usize) -> Self {
        Self {
            monitor,
            file_batches: BatchTuner::new(file_batch, FILE_BATCH_FLOOR),
            reaper_batches: BatchTuner::new(reaper_batch, REAPER_BATCH_FLOOR),
            gate: Mutex::new(None),
        }
    }

    /// Current file-pipeline flush threshold.
    pub fn file_batch_size(&self) -> usize {
        self.file_batches.get()
    }

    /// Current reaper batch size.
    pub fn reaper_batch_size(&self) -> usize {
        self.reaper_batches.get()
    }

    /// Shrink both batch sizes; used by the stuck detector.
    pub fn shrink_all(&self, factor: f64) {
        self.file_batches.shrink(factor);
        self.reaper_batches.shrink(factor);
    }

    /// Check memory and react. Call before and after every batch of work.
    ///
    /// On `Critical` the abort flag is already set and the reason recorded;
    /// the caller's only job is to stop scheduling.
    pub async fn pace(&self, shared: &SharedState, flags: &RunFlags) -> Pressure {
        if !self.monitor.enabled() {
            return Pressure::Nominal;
        }

        let mut last_warn = self.gate.lock().await;
        let sample = self.monitor.sample();

        if sample.critical {
            self.trip(shared, flags, sample.rss).await;
            return Pressure::Critical;
        }

        if sample.ratio > PAUSE_RATIO {
            let factor = if sample.ratio > 1.0 { 0.25 } else { 0.5 };
            self.file_batches.shrink(factor);
            self.reaper_batches.shrink(factor);
            shared.with(|s| s.stats.backpressure_events += 1).await;

            let now = Instant::now();
            if last_warn.map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL) {
                warn!(
                    rss_mb = sample.rss / (1024 * 1024),
                    usage_ratio = %format_args!("{:.2}", sample.ratio),
                    file_batch = self.file_batches.get(),
                    reaper_batch = self.reaper_batches.get(),
                    "Memory over soft limit, applying back-pressure"
                );
                *last_warn = Some(now);
            }

            // Pause under the gate so concurrent callers queue instead of
            // stacking their own pauses
            tokio::time::sleep(PAUSE).await;
            return Pressure::Soft;
        }

        if sample.ratio > SHRINK_RATIO {
            self.file_batches.shrink(0.75);
            self.reaper_batches.shrink(0.75);
        }

        Pressure::Nominal
    }

    async fn trip(&self, shared: &SharedState, flags: &RunFlags, rss: u64) {
        flags.abort();
        let rss_mb = rss / (1024 * 1024);
        let newly_tripped = shared
            .with(|s| {
                if s.abort_reason.is_none() {
                    s.abort_reason =
                        Some(format!("memory usage {rss_mb} MB reached the hard limit"));
                    true
                } else {
                    false
                }
            })
            .await;
        if newly_tripped {
            error!(
                rss_mb,
                "Memory usage critical, aborting current phase"
            );
        }
    }
}
