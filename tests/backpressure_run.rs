//! Memory back-pressure and circuit-breaker behavior in full runs,
//! using an injected usage source.

mod common;

use common::{config_for, write_file_aged};
use efs_purger::backpressure::{PressureController, RunFlags};
use efs_purger::coordinator::PurgeCoordinator;
use efs_purger::fabric::Fabric;
use efs_purger::memory::MemoryMonitor;
use efs_purger::reaper::EmptyDirReaper;
use efs_purger::stats::{Phase, SharedState};
use std::sync::Arc;
use tempfile::tempdir;

const MB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_soft_pressure_counts_events_but_completes() {
    let root = tempdir().unwrap();
    for i in 0..5 {
        write_file_aged(&root.path().join(format!("f{i}")), b"x", 90);
    }

    // 90% of the soft limit: pause-and-shrink territory, no abort
    let monitor = Arc::new(MemoryMonitor::with_sampler(
        100,
        None,
        0.95,
        Box::new(|| 90 * MB),
    ));
    let coordinator =
        PurgeCoordinator::with_memory_monitor(config_for(root.path(), 30.0), monitor);
    let report = coordinator.purge().await.unwrap();

    assert_eq!(report.phase, Phase::Completed);
    assert!(report.backpressure_events > 0);
    assert_eq!(report.files_purged, 5);
    assert!(report.peak_memory_mb >= 90.0);
}

#[tokio::test]
async fn test_critical_memory_aborts_the_run() {
    let root = tempdir().unwrap();
    for i in 0..5 {
        write_file_aged(&root.path().join(format!("f{i}")), b"x", 90);
    }

    // Past 95% of the hard limit from the first sample
    let monitor = Arc::new(MemoryMonitor::with_sampler(
        100,
        Some(200 * MB),
        0.95,
        Box::new(|| 199 * MB),
    ));
    let coordinator =
        PurgeCoordinator::with_memory_monitor(config_for(root.path(), 30.0), monitor);
    let report = coordinator.purge().await.unwrap();

    assert_eq!(report.phase, Phase::Aborted);
    assert!(report.abort_reason.is_some());
    assert_eq!(report.files_purged, 0, "no new work after the breaker trips");
    for i in 0..5 {
        assert!(root.path().join(format!("f{i}")).exists());
    }
}

#[tokio::test]
async fn test_memory_logic_disabled_ignores_huge_usage() {
    let root = tempdir().unwrap();
    write_file_aged(&root.path().join("f"), b"x", 90);

    let monitor = Arc::new(MemoryMonitor::with_sampler(
        0,
        Some(200 * MB),
        0.95,
        Box::new(|| 10_000 * MB),
    ));
    let coordinator =
        PurgeCoordinator::with_memory_monitor(config_for(root.path(), 30.0), monitor);
    let report = coordinator.purge().await.unwrap();

    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.backpressure_events, 0);
    assert_eq!(report.files_purged, 1);
}

#[tokio::test]
async fn test_reaper_exits_immediately_on_critical_memory() {
    let root = tempdir().unwrap();
    for i in 0..8 {
        std::fs::create_dir(root.path().join(format!("leaf{i}"))).unwrap();
    }

    let mut config = config_for(root.path(), 30.0);
    config.remove_empty_dirs = true;
    config.max_empty_dirs_per_run = 0;
    let config = Arc::new(config);

    let monitor = Arc::new(MemoryMonitor::with_sampler(
        100,
        Some(200 * MB),
        0.95,
        Box::new(|| 199 * MB),
    ));
    let shared = Arc::new(SharedState::new());
    let fabric = Arc::new(Fabric::new(&config));
    let pressure = Arc::new(PressureController::new(monitor, config.task_batch_size, 50));
    let flags = Arc::new(RunFlags::default());

    // Seed the reaper the way the walker would have
    shared
        .with(|s| {
            for i in 0..8 {
                s.note_empty_dir(root.path().join(format!("leaf{i}")));
            }
        })
        .await;

    EmptyDirReaper::new(
        Arc::clone(&config),
        Arc::clone(&shared),
        fabric,
        pressure,
        Arc::clone(&flags),
    )
    .run()
    .await;

    assert!(flags.is_aborted());
    let (deleted, reason) = shared
        .with(|s| (s.stats.empty_dirs_deleted, s.abort_reason.clone()))
        .await;
    assert_eq!(deleted, 0, "breaker must trip before the first batch");
    assert!(reason.is_some());
    for i in 0..8 {
        assert!(root.path().join(format!("leaf{i}")).exists());
    }
}
