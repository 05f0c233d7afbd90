//! Background progress reporter and stuck detection.
//!
//! One cooperatively-scheduled task wakes every 30 seconds, snapshots the
//! counters under the stats lock, and emits exactly one structured record
//! per interval - the reporter is the sole emitter, so concurrent workers
//! can never duplicate a progress line. Debug level adds windowed and peak
//! rates plus concurrency-utilization gauges.
//!
//! The same cadence drives the hang heuristic: counters unchanged across
//! two consecutive intervals produce a `possible_hang` warning with the
//! directories currently being walked, and batch sizes are shrunk so a
//! slow filesystem gets smaller units of work.

use crate::backpressure::PressureController;
use crate::fabric::Fabric;
use crate::logging::log_with_context;
use crate::memory::MemoryMonitor;
use crate::stats::{Metric, Phase, SharedState, StateInner};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{warn, Level};

/// Seconds between progress records
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive no-progress intervals before warning and shrinking batches
const STUCK_WARN_INTERVALS: u32 = 2;

/// Active directories listed in a hang diagnostic
const STUCK_DIAGNOSTIC_DIRS: usize = 10;

/// One progress record. Field presence is phase-dependent; rate and
/// concurrency detail appears only at debug level.
#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub elapsed_seconds: f64,
    pub phase: Phase,
    pub errors: u64,
    pub backpressure_events: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_scanned: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_purged: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs_scanned: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_to_purge: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs_purged: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs_to_purge: Option<u64>,

    pub files_per_second: f64,
    pub dirs_per_second: f64,
    pub memory_mb: f64,
    pub memory_usage_percent: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_per_second_instant: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs_per_second_instant: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_per_second_short: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirs_per_second_short: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_files_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dirs_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_files_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_dirs_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_files_deleted_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_empty_dirs_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tasks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_tasks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_scan_slots: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_delete_slots: Option<usize>,
}

/// Everything the reporter task reads.
#[derive(Clone)]
struct ReporterDeps {
    shared: Arc<SharedState>,
    memory: Arc<MemoryMonitor>,
    fabric: Arc<Fabric>,
    pressure: Arc<PressureController>,
}

/// Handle to the running reporter; stopping is guaranteed on every exit
/// path - `stop` cancels and emits a final record, and dropping the handle
/// without stopping still cancels the task.
pub struct ReporterHandle {
    handle: Option<JoinHandle<()>>,
    deps: ReporterDeps,
}

/// Spawn the reporter task.
pub fn spawn(
    shared: Arc<SharedState>,
    memory: Arc<MemoryMonitor>,
    fabric: Arc<Fabric>,
    pressure: Arc<PressureController>,
) -> ReporterHandle {
    let deps = ReporterDeps { shared, memory, fabric, pressure };
    let task_deps = deps.clone();
    let handle = tokio::spawn(async move { report_loop(task_deps).await });
    ReporterHandle { handle: Some(handle), deps }
}

impl ReporterHandle {
    /// Cancel the reporter and emit the final snapshot.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        let snapshot = {
            let state = self.deps.shared.lock().await;
            build_snapshot(&state, &self.deps)
        };
        log_with_context(Level::INFO, "Final progress before completion", &snapshot);
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

async fn report_loop(deps: ReporterDeps) {
    let mut detector = StuckDetector::default();

    loop {
        tokio::time::sleep(REPORT_INTERVAL).await;

        let (snapshot, observation, active_dirs) = {
            let mut state = deps.shared.lock().await;
            update_peaks(&mut state);
            let snapshot = build_snapshot(&state, &deps);
            let observation = Observation {
                phase: state.phase,
                files_scanned: state.stats.files_scanned,
                dirs_scanned: state.stats.dirs_scanned,
                empty_dirs_deleted: state.stats.empty_dirs_deleted,
            };
            let active_dirs: Vec<String> = state
                .active_dirs
                .iter()
                .take(STUCK_DIAGNOSTIC_DIRS)
                .map(|p| p.display().to_string())
                .collect();
            (snapshot, observation, active_dirs)
        };

        log_with_context(Level::INFO, "Progress update", &snapshot);

        if let Some(stuck_intervals) = detector.observe(&observation) {
            report_stuck(&deps, &observation, stuck_intervals, active_dirs);
        }
    }
}

fn report_stuck(
    deps: &ReporterDeps,
    obs: &Observation,
    stuck_intervals: u32,
    active_dirs: Vec<String>,
) {
    let stalled_secs = u64::from(stuck_intervals) * REPORT_INTERVAL.as_secs();
    match obs.phase {
        Phase::RemovingEmptyDirs => {
            log_with_context(
                Level::WARN,
                "possible_hang: no progress during empty directory removal",
                &serde_json::json!({
                    "phase": obs.phase,
                    "empty_dirs_deleted": obs.empty_dirs_deleted,
                    "stuck_intervals": stuck_intervals,
                    "stalled_seconds": stalled_secs,
                    "hint": "Large empty-directory sets take time; if this persists the \
                             filesystem may be slow or unresponsive.",
                }),
            );
        }
        _ => {
            log_with_context(
                Level::WARN,
                "possible_hang: no scanning progress",
                &serde_json::json!({
                    "phase": obs.phase,
                    "files_scanned": obs.files_scanned,
                    "dirs_scanned": obs.dirs_scanned,
                    "stuck_intervals": stuck_intervals,
                    "stalled_seconds": stalled_secs,
                }),
            );
            if !active_dirs.is_empty() {
                log_with_context(
                    Level::WARN,
                    "Directories currently being scanned (potential hang location)",
                    &serde_json::json!({
                        "directories": active_dirs,
                        "hint": "If this persists, consider excluding problematic paths \
                                 or checking EFS/NFS health.",
                    }),
                );
            }
        }
    }

    // Smaller units of work give a slow filesystem a chance to show progress
    deps.pressure.shrink_all(0.5);
    warn!(
        file_batch = deps.pressure.file_batch_size(),
        reaper_batch = deps.pressure.reaper_batch_size(),
        "Batch sizes shrunk after stall"
    );
}

/// Counter values compared between intervals.
struct Observation {
    phase: Phase,
    files_scanned: u64,
    dirs_scanned: u64,
    empty_dirs_deleted: u64,
}

/// Phase-aware no-progress detector. Returns the consecutive stuck-interval
/// count once it reaches the warning threshold.
#[derive(Default)]
struct StuckDetector {
    last_files: u64,
    last_dirs: u64,
    last_empty_deleted: u64,
    stuck_intervals: u32,
}

impl StuckDetector {
    fn observe(&mut self, obs: &Observation) -> Option<u32> {
        let advanced = match obs.phase {
            Phase::RemovingEmptyDirs => obs.empty_dirs_deleted != self.last_empty_deleted,
            _ => obs.files_scanned != self.last_files || obs.dirs_scanned != self.last_dirs,
        };

        self.last_files = obs.files_scanned;
        self.last_dirs = obs.dirs_scanned;
        self.last_empty_deleted = obs.empty_dirs_deleted;

        if advanced {
            self.stuck_intervals = 0;
            return None;
        }
        self.stuck_intervals += 1;
        (self.stuck_intervals >= STUCK_WARN_INTERVALS).then_some(self.stuck_intervals)
    }
}

fn update_peaks(state: &mut StateInner) {
    let files_overall = state.files_per_second_overall();
    let dirs_overall = state.dirs_per_second_overall();
    state.rates.note_peak(Metric::FilesScanned, files_overall);
    state.rates.note_peak(Metric::DirsScanned, dirs_overall);
    let deletion_rate = state.rates.phase_rate(Metric::FilesDeleted);
    if deletion_rate > 0.0 {
        state.rates.note_peak(Metric::FilesDeleted, deletion_rate);
    }
    let reap_rate = state.rates.phase_rate(Metric::EmptyDirsRemoved);
    if reap_rate > 0.0 {
        state.rates.note_peak(Metric::EmptyDirsRemoved, reap_rate);
    }
}

fn build_snapshot(state: &StateInner, deps: &ReporterDeps) -> ProgressSnapshot {
    let sample = deps.memory.sample();
    let debug = tracing::enabled!(tracing::Level::DEBUG);
    let reaping = state.phase == Phase::RemovingEmptyDirs;
    let stats = &state.stats;

    ProgressSnapshot {
        elapsed_seconds: round1(state.started_at.elapsed().as_secs_f64()),
        phase: state.phase,
        errors: stats.errors,
        backpressure_events: stats.backpressure_events,

        files_scanned: (!reaping).then_some(stats.files_scanned),
        files_purged: (!reaping).then_some(stats.files_purged),
        dirs_scanned: (!reaping).then_some(stats.dirs_scanned),
        files_to_purge: (!reaping && stats.files_to_purge > 0).then_some(stats.files_to_purge),
        dirs_purged: reaping.then_some(stats.empty_dirs_deleted),
        dirs_to_purge: reaping.then_some(stats.empty_dirs_to_delete),

        files_per_second: round1(state.files_per_second_overall()),
        dirs_per_second: round1(state.dirs_per_second_overall()),
        memory_mb: round1(sample.rss as f64 / (1024.0 * 1024.0)),
        memory_usage_percent: round1(sample.ratio * 100.0),

        files_per_second_instant: debug
            .then(|| round1(state.rates.windowed_rate(Metric::FilesScanned, 10.0))),
        dirs_per_second_instant: debug
            .then(|| round1(state.rates.windowed_rate(Metric::DirsScanned, 10.0))),
        files_per_second_short: debug
            .then(|| round1(state.rates.windowed_rate(Metric::FilesScanned, 60.0))),
        dirs_per_second_short: debug
            .then(|| round1(state.rates.windowed_rate(Metric::DirsScanned, 60.0))),
        deletion_files_per_second: debug
            .then(|| round1(state.rates.phase_rate(Metric::FilesDeleted))),
        empty_dirs_per_second: debug
            .then(|| round1(state.rates.phase_rate(Metric::EmptyDirsRemoved))),
        peak_files_per_second: debug.then(|| round1(state.rates.peak(Metric::FilesScanned))),
        peak_dirs_per_second: debug.then(|| round1(state.rates.peak(Metric::DirsScanned))),
        peak_files_deleted_per_second: debug
            .then(|| round1(state.rates.peak(Metric::FilesDeleted))),
        peak_empty_dirs_per_second: debug
            .then(|| round1(state.rates.peak(Metric::EmptyDirsRemoved))),
        active_tasks: debug.then(|| deps.shared.active_tasks()),
        max_active_tasks: debug.then(|| deps.shared.peak_active_tasks()),
        available_scan_slots: debug.then(|| deps.fabric.scan_slots.available_permits()),
        available_delete_slots: debug.then(|| deps.fabric.delete_slots.available_permits()),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(phase: Phase, files: u64, dirs: u64, empty: u64) -> Observation {
        Observation {
            phase,
            files_scanned: files,
            dirs_scanned: dirs,
            empty_dirs_deleted: empty,
        }
    }

    #[test]
    fn test_stuck_detector_warns_after_two_intervals() {
        let mut detector = StuckDetector::default();
        // First observation establishes the baseline but zeros never count
        // as progress, so two flat intervals reach the threshold
        assert_eq!(detector.observe(&obs(Phase::Scanning, 0, 0, 0)), None);
        assert_eq!(detector.observe(&obs(Phase::Scanning, 0, 0, 0)), Some(2));
        assert_eq!(detector.observe(&obs(Phase::Scanning, 0, 0, 0)), Some(3));
    }

    #[test]
    fn test_stuck_detector_resets_on_progress() {
        let mut detector = StuckDetector::default();
        assert_eq!(detector.observe(&obs(Phase::Scanning, 10, 1, 0)), None);
        assert_eq!(detector.observe(&obs(Phase::Scanning, 10, 1, 0)), None);
        assert_eq!(detector.observe(&obs(Phase::Scanning, 11, 1, 0)), None);
        assert_eq!(detector.observe(&obs(Phase::Scanning, 11, 1, 0)), None);
        assert_eq!(detector.observe(&obs(Phase::Scanning, 11, 1, 0)), Some(2));
    }

    #[test]
    fn test_stuck_detector_tracks_reaping_phase() {
        let mut detector = StuckDetector::default();
        // During reaping only empty_dirs_deleted counts as progress
        assert_eq!(detector.observe(&obs(Phase::RemovingEmptyDirs, 5, 5, 1)), None);
        assert_eq!(detector.observe(&obs(Phase::RemovingEmptyDirs, 5, 5, 2)), None);
        assert_eq!(detector.observe(&obs(Phase::RemovingEmptyDirs, 5, 5, 2)), None);
        assert_eq!(detector.observe(&obs(Phase::RemovingEmptyDirs, 5, 5, 2)), Some(2));
    }

    #[test]
    fn test_round1() {
        assert_eq!(round1(1.26), 1.3);
        assert_eq!(round1(0.0), 0.0);
    }
}
