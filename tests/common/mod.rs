//! Shared helpers for the integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use efs_purger::config::{cutoff_for, LogLevel, PurgeConfig};
use efs_purger::coordinator::PurgeReport;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Baseline configuration for a test run over `root`.
pub fn config_for(root: &Path, max_age_days: f64) -> PurgeConfig {
    PurgeConfig {
        root: root.to_path_buf(),
        max_age_days,
        cutoff: cutoff_for(SystemTime::now(), max_age_days),
        scan_slots: 100,
        delete_slots: 100,
        subdir_slots: 20,
        task_batch_size: 500,
        soft_limit_mb: 0,
        hard_memory_ratio: 0.95,
        remove_empty_dirs: false,
        max_empty_dirs_per_run: 500,
        dry_run: false,
        log_level: LogLevel::Info,
    }
}

/// Create a file whose mtime is `days_old` days in the past.
pub fn write_file_aged(path: &Path, contents: &[u8], days_old: u64) {
    std::fs::write(path, contents).unwrap();
    let mtime = SystemTime::now() - Duration::from_secs(days_old * 86_400);
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_times(std::fs::FileTimes::new().set_modified(mtime))
        .unwrap();
}

/// Counter orderings that must hold after any run.
pub fn assert_invariants(report: &PurgeReport) {
    assert!(
        report.files_purged <= report.files_to_purge,
        "files_purged {} > files_to_purge {}",
        report.files_purged,
        report.files_to_purge
    );
    assert!(
        report.files_to_purge <= report.files_scanned,
        "files_to_purge {} > files_scanned {}",
        report.files_to_purge,
        report.files_scanned
    );
    assert!(
        report.empty_dirs_deleted <= report.empty_dirs_to_delete,
        "empty_dirs_deleted {} > empty_dirs_to_delete {}",
        report.empty_dirs_deleted,
        report.empty_dirs_to_delete
    );
    assert!(
        report.empty_dirs_to_delete <= report.empty_dirs_found,
        "empty_dirs_to_delete {} > empty_dirs_found {}",
        report.empty_dirs_to_delete,
        report.empty_dirs_found
    );
    assert!(
        report.empty_dirs_found <= report.dirs_scanned,
        "empty_dirs_found {} > dirs_scanned {}",
        report.empty_dirs_found,
        report.dirs_scanned
    );
}
