//! Run statistics and shared mutable state.
//!
//! All widely-mutated state lives behind a single mutex: the counters, the
//! empty-directory set the walker feeds the reaper, the active-directory set
//! used for stuck diagnostics, and the rate tracker. Workers take the lock,
//! mutate, and release; snapshots are copied out under the lock and logged
//! after it is released.
//!
//! The only state outside the mutex is a pair of gauges (current and peak
//! in-flight file tasks) that are touched on every file and would otherwise
//! serialize the pipeline.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

/// Cap on retained rate samples
const MAX_RATE_SAMPLES: usize = 10_000;

/// Phase of the run, as reported in progress and final records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Scanning,
    RemovingEmptyDirs,
    Completed,
    Aborted,
}

/// Process-wide counters. Values never decrease.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub files_scanned: u64,
    pub files_to_purge: u64,
    pub files_purged: u64,
    pub dirs_scanned: u64,
    pub symlinks_skipped: u64,
    pub special_files_skipped: u64,
    pub empty_dirs_found: u64,
    pub empty_dirs_to_delete: u64,
    pub empty_dirs_deleted: u64,
    pub errors: u64,
    pub bytes_freed: u64,
    pub backpressure_events: u64,
}

/// Which counter a rate sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    FilesScanned,
    DirsScanned,
    FilesDeleted,
    EmptyDirsRemoved,
}

impl Metric {
    fn index(self) -> usize {
        match self {
            Metric::FilesScanned => 0,
            Metric::DirsScanned => 1,
            Metric::FilesDeleted => 2,
            Metric::EmptyDirsRemoved => 3,
        }
    }
}

/// Windowed and peak rate tracking across the run's phases.
///
/// Samples are appended as work completes; the reporter computes instant
/// (~10 s) and short-term (~60 s) rates over the retained window, per-phase
/// rates from the counts since each metric's epoch, and keeps the peaks.
#[derive(Debug)]
pub struct RateTracker {
    samples: VecDeque<(Instant, Metric, u64)>,
    counts: [u64; 4],
    epochs: [Option<Instant>; 4],
    peaks: [f64; 4],
}

impl Default for RateTracker {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            counts: [0; 4],
            epochs: [None; 4],
            peaks: [0.0; 4],
        }
    }
}

impl RateTracker {
    /// Record `count` completed units of `metric`.
    pub fn record(&mut self, metric: Metric, count: u64) {
        if self.samples.len() == MAX_RATE_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((Instant::now(), metric, count));
        self.counts[metric.index()] += count;
    }

    /// Mark the start of the phase that produces `metric`, resetting its
    /// per-phase count.
    pub fn set_epoch(&mut self, metric: Metric) {
        self.epochs[metric.index()] = Some(Instant::now());
        self.counts[metric.index()] = 0;
    }

    /// Rate over the trailing `window_secs` seconds.
    pub fn windowed_rate(&self, metric: Metric, window_secs: f64) -> f64 {
        if window_secs <= 0.0 {
            return 0.0;
        }
        let now = Instant::now();
        let mut total = 0u64;
        let mut first: Option<Instant> = None;
        let mut last: Option<Instant> = None;
        for &(at, m, count) in &self.samples {
            if m != metric || now.duration_since(at).as_secs_f64() > window_secs {
                continue;
            }
            total += count;
            if first.is_none() {
                first = Some(at);
            }
            last = Some(at);
        }
        let (Some(first), Some(last)) = (first, last) else {
            return 0.0;
        };
        let span = last.duration_since(first).as_secs_f64().max(1.0);
        total as f64 / span
    }

    /// Rate since the metric's phase epoch; 0 before the phase starts.
    pub fn phase_rate(&self, metric: Metric) -> f64 {
        let Some(epoch) = self.epochs[metric.index()] else {
            return 0.0;
        };
        let elapsed = epoch.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.counts[metric.index()] as f64 / elapsed
    }

    /// Fold `rate` into the peak for `metric`.
    pub fn note_peak(&mut self, metric: Metric, rate: f64) {
        let slot = &mut self.peaks[metric.index()];
        if rate > *slot {
            *slot = rate;
        }
    }

    pub fn peak(&self, metric: Metric) -> f64 {
        self.peaks[metric.index()]
    }
}

/// Everything guarded by the stats lock.
#[derive(Debug)]
pub struct StateInner {
    pub stats: Stats,
    pub phase: Phase,
    /// Abort cause recorded by the circuit breaker, surfaced in final stats
    pub abort_reason: Option<String>,
    /// Directories observed empty during the walk; reaper input.
    /// Check-and-insert happens in one critical section so concurrent
    /// observers cannot produce duplicates.
    pub empty_dirs: HashSet<PathBuf>,
    /// Directories currently being walked, for stuck diagnostics
    pub active_dirs: HashSet<PathBuf>,
    pub rates: RateTracker,
    pub started_at: Instant,
    pub scan_start: Option<Instant>,
    pub scan_end: Option<Instant>,
}

impl StateInner {
    /// Duration of the scanning phase, excluding empty-dir reaping.
    /// Open-ended while scanning is still in progress.
    pub fn scan_duration_secs(&self) -> f64 {
        match (self.scan_start, self.scan_end) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    /// Overall files/sec against the scan duration only.
    pub fn files_per_second_overall(&self) -> f64 {
        let secs = self.scan_duration_secs();
        if secs > 0.0 {
            self.stats.files_scanned as f64 / secs
        } else {
            0.0
        }
    }

    /// Overall dirs/sec against the scan duration only.
    pub fn dirs_per_second_overall(&self) -> f64 {
        let secs = self.scan_duration_secs();
        if secs > 0.0 {
            self.stats.dirs_scanned as f64 / secs
        } else {
            0.0
        }
    }

    /// Record an empty-directory observation; returns true if new.
    pub fn note_empty_dir(&mut self, path: PathBuf) -> bool {
        let inserted = self.empty_dirs.insert(path);
        if inserted {
            self.stats.empty_dirs_found += 1;
        }
        inserted
    }
}

/// Shared handle to the run state.
#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<StateInner>,
    active_tasks: AtomicU64,
    peak_active_tasks: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                stats: Stats::default(),
                phase: Phase::Starting,
                abort_reason: None,
                empty_dirs: HashSet::new(),
                active_dirs: HashSet::new(),
                rates: RateTracker::default(),
                started_at: Instant::now(),
                scan_start: None,
                scan_end: None,
            }),
            active_tasks: AtomicU64::new(0),
            peak_active_tasks: AtomicU64::new(0),
        }
    }

    /// Run `f` under the stats lock.
    pub async fn with<R>(&self, f: impl FnOnce(&mut StateInner) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    /// Take the stats lock for a critical section that spans an await point
    /// (the walker's empty-directory check-and-insert).
    pub async fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().await
    }

    pub fn task_started(&self) {
        let now = self.active_tasks.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_active_tasks.fetch_max(now, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_tasks(&self) -> u64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn peak_active_tasks(&self) -> u64 {
        self.peak_active_tasks.load(Ordering::Relaxed)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
