//! Top-level orchestration of a purge run.
//!
//! The coordinator owns the configuration, the semaphore fabric, the shared
//! state, and the memory monitor, and runs the phases in order: validate,
//! start the reporter, walk, reap (optionally), stop the reporter, emit the
//! final stats. Apart from invalid configuration and a missing root, every
//! failure is absorbed into the statistics - the run always produces a
//! final report.
//!
//! Overall files/sec and dirs/sec are computed against the scanning phase
//! alone; folding empty-directory reaping into the denominator would hide
//! the scanning rate.

use crate::backpressure::{PressureController, RunFlags};
use crate::config::PurgeConfig;
use crate::error::{ConfigError, Result};
use crate::fabric::Fabric;
use crate::logging::log_with_context;
use crate::memory::MemoryMonitor;
use crate::reaper::{self, EmptyDirReaper};
use crate::reporter;
use crate::stats::{Metric, Phase, SharedState};
use crate::walker::{self, WalkContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// Terminal statistics of a run, emitted as the final log record and
/// returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub duration_seconds: f64,
    pub files_scanned: u64,
    pub files_purged: u64,
    pub dirs_scanned: u64,
    pub errors: u64,
    pub backpressure_events: u64,
    pub files_to_purge: u64,
    pub symlinks_skipped: u64,
    pub special_files_skipped: u64,
    pub empty_dirs_found: u64,
    pub empty_dirs_to_delete: u64,
    pub empty_dirs_deleted: u64,
    pub bytes_freed: u64,
    pub mb_freed: f64,
    pub files_per_second: f64,
    pub dirs_per_second: f64,
    pub peak_files_per_second: f64,
    pub peak_dirs_per_second: f64,
    pub peak_memory_mb: f64,
    pub dry_run: bool,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

/// Effective configuration echoed in the startup record.
#[derive(Serialize)]
struct StartupRecord<'a> {
    version: &'a str,
    root_path: String,
    max_age_days: f64,
    cutoff_time: String,
    max_concurrency_scanning: usize,
    max_concurrency_deletion: usize,
    max_concurrent_subdirs: usize,
    task_batch_size: usize,
    memory_limit_mb: u64,
    remove_empty_dirs: bool,
    max_empty_dirs_to_delete: usize,
    dry_run: bool,
    listing_pool_size: usize,
}

/// Owns a run's resources and drives its phases.
pub struct PurgeCoordinator {
    config: Arc<PurgeConfig>,
    shared: Arc<SharedState>,
    fabric: Arc<Fabric>,
    memory: Arc<MemoryMonitor>,
    pressure: Arc<PressureController>,
    flags: Arc<RunFlags>,
}

impl PurgeCoordinator {
    pub fn new(config: PurgeConfig) -> Self {
        let memory = Arc::new(MemoryMonitor::new(
            config.soft_limit_mb,
            config.hard_memory_ratio,
        ));
        Self::with_memory_monitor(config, memory)
    }

    /// Build with an explicit monitor; tests inject a fake usage source to
    /// drive the back-pressure and circuit-break paths.
    pub fn with_memory_monitor(config: PurgeConfig, memory: Arc<MemoryMonitor>) -> Self {
        let config = Arc::new(config);
        let fabric = Arc::new(Fabric::new(&config));
        let pressure = Arc::new(PressureController::new(
            Arc::clone(&memory),
            config.task_batch_size,
            reaper::base_batch_size(config.delete_slots),
        ));
        Self {
            shared: Arc::new(SharedState::new()),
            flags: Arc::new(RunFlags::default()),
            config,
            fabric,
            memory,
            pressure,
        }
    }

    /// Stop flags, for signal handlers.
    pub fn flags(&self) -> Arc<RunFlags> {
        Arc::clone(&self.flags)
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// Run the full purge and return the terminal statistics.
    ///
    /// Fails only on invalid input (missing or non-directory root); every
    /// error after that point is counted in the report instead.
    pub async fn purge(&self) -> Result<PurgeReport> {
        // A symlink at the root is accepted as the root itself; its target
        // must be a directory. Symlinks below the root are never followed.
        let root_meta = tokio::fs::metadata(&self.config.root).await.map_err(|_| {
            ConfigError::RootMissing { path: self.config.root.clone() }
        })?;
        if !root_meta.is_dir() {
            return Err(ConfigError::RootNotDirectory { path: self.config.root.clone() }.into());
        }

        self.log_startup();

        let reporter = reporter::spawn(
            Arc::clone(&self.shared),
            Arc::clone(&self.memory),
            Arc::clone(&self.fabric),
            Arc::clone(&self.pressure),
        );

        self.shared
            .with(|s| {
                s.phase = Phase::Scanning;
                s.scan_start = Some(Instant::now());
                s.rates.set_epoch(Metric::FilesScanned);
                s.rates.set_epoch(Metric::DirsScanned);
                s.rates.set_epoch(Metric::FilesDeleted);
            })
            .await;

        let ctx = WalkContext {
            config: Arc::clone(&self.config),
            shared: Arc::clone(&self.shared),
            fabric: Arc::clone(&self.fabric),
            pressure: Arc::clone(&self.pressure),
            flags: Arc::clone(&self.flags),
        };
        walker::scan_directory(ctx, self.config.root.clone(), false).await;

        self.shared
            .with(|s| s.scan_end = Some(Instant::now()))
            .await;

        if self.config.remove_empty_dirs && !self.flags.should_stop() {
            self.shared
                .with(|s| {
                    s.phase = Phase::RemovingEmptyDirs;
                    s.rates.set_epoch(Metric::EmptyDirsRemoved);
                })
                .await;

            EmptyDirReaper::new(
                Arc::clone(&self.config),
                Arc::clone(&self.shared),
                Arc::clone(&self.fabric),
                Arc::clone(&self.pressure),
                Arc::clone(&self.flags),
            )
            .run()
            .await;
        }

        let terminal = if self.flags.is_aborted() {
            Phase::Aborted
        } else {
            Phase::Completed
        };
        self.shared.with(|s| s.phase = terminal).await;

        reporter.stop().await;

        let report = self.build_report().await;
        log_with_context(Level::INFO, "Purge operation completed", &report);
        Ok(report)
    }

    fn log_startup(&self) {
        let config = &self.config;
        let mode = if config.dry_run { "DRY RUN" } else { "PURGE" };
        let cutoff: DateTime<Utc> = config.cutoff.into();
        let record = StartupRecord {
            version: env!("CARGO_PKG_VERSION"),
            root_path: config.root.display().to_string(),
            max_age_days: config.max_age_days,
            cutoff_time: cutoff.format("%Y-%m-%d %H:%M:%S").to_string(),
            max_concurrency_scanning: config.scan_slots,
            max_concurrency_deletion: config.delete_slots,
            max_concurrent_subdirs: config.subdir_slots,
            task_batch_size: config.task_batch_size,
            memory_limit_mb: config.soft_limit_mb,
            remove_empty_dirs: config.remove_empty_dirs,
            max_empty_dirs_to_delete: config.max_empty_dirs_per_run,
            dry_run: config.dry_run,
            listing_pool_size: config.listing_pool_size(),
        };
        log_with_context(
            Level::INFO,
            &format!("Starting EFS purge - {mode} MODE"),
            &record,
        );
    }

    async fn build_report(&self) -> PurgeReport {
        let peak_memory_mb = self.memory.peak() as f64 / (1024.0 * 1024.0);
        self.shared
            .with(|s| {
                let stats = &s.stats;
                PurgeReport {
                    duration_seconds: round2(s.started_at.elapsed().as_secs_f64()),
                    files_scanned: stats.files_scanned,
                    files_purged: stats.files_purged,
                    dirs_scanned: stats.dirs_scanned,
                    errors: stats.errors,
                    backpressure_events: stats.backpressure_events,
                    files_to_purge: stats.files_to_purge,
                    symlinks_skipped: stats.symlinks_skipped,
                    special_files_skipped: stats.special_files_skipped,
                    empty_dirs_found: stats.empty_dirs_found,
                    empty_dirs_to_delete: stats.empty_dirs_to_delete,
                    empty_dirs_deleted: stats.empty_dirs_deleted,
                    bytes_freed: stats.bytes_freed,
                    mb_freed: round2(stats.bytes_freed as f64 / (1024.0 * 1024.0)),
                    files_per_second: round2(s.files_per_second_overall()),
                    dirs_per_second: round2(s.dirs_per_second_overall()),
                    peak_files_per_second: round2(s.rates.peak(Metric::FilesScanned)),
                    peak_dirs_per_second: round2(s.rates.peak(Metric::DirsScanned)),
                    peak_memory_mb: round2(peak_memory_mb),
                    dry_run: self.config.dry_run,
                    phase: s.phase,
                    abort_reason: s.abort_reason.clone(),
                }
            })
            .await
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
