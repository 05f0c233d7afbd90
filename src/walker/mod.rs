//! Recursive directory walker.
//!
//! One directory at a time: list the entries once, stream regular files
//! through the batched pipeline, skip symlinks and special files, then walk
//! the subdirectories through the sliding-window processor. When the
//! empty-directory reaper is enabled, each non-root directory is re-read
//! after its subtree completes and recorded if it is empty at that moment.
//!
//! Failures are strictly local: a directory that cannot be listed costs one
//! error and ends that frame; siblings are never cancelled.

pub mod pipeline;
pub mod subdirs;

use crate::backpressure::{PressureController, RunFlags};
use crate::config::PurgeConfig;
use crate::error::{classify_io, IoClass};
use crate::fabric::Fabric;
use crate::fsio::{self, EntryKind};
use crate::stats::{Metric, SharedState};
use pipeline::FileBatch;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything a directory frame needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct WalkContext {
    pub config: Arc<PurgeConfig>,
    pub shared: Arc<SharedState>,
    pub fabric: Arc<Fabric>,
    pub pressure: Arc<PressureController>,
    pub flags: Arc<RunFlags>,
}

/// Boxed recursion point: a directory walk that may spawn more of itself.
pub type WalkFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Walk one directory and its subtree.
///
/// `holds_permit` is true when an ancestor frame of this call chain already
/// holds a subdir slot; the sliding-window processor uses it to decide when
/// concurrent recursion would deadlock against the semaphore.
pub fn scan_directory(ctx: WalkContext, dir: PathBuf, holds_permit: bool) -> WalkFuture {
    Box::pin(async move {
        ctx.shared
            .with(|s| {
                s.active_dirs.insert(dir.clone());
                s.stats.dirs_scanned += 1;
                s.rates.record(Metric::DirsScanned, 1);
            })
            .await;

        if let Err(e) = scan_directory_inner(&ctx, &dir, holds_permit).await {
            match classify_io(&e) {
                IoClass::TransientGone => {
                    debug!(directory = %dir.display(), "Directory vanished before listing");
                }
                IoClass::PermissionDenied => {
                    warn!(directory = %dir.display(), error = %e, "Permission denied for directory");
                }
                IoClass::Unexpected => {
                    error!(directory = %dir.display(), error = %e, "Error scanning directory");
                }
            }
            ctx.shared.with(|s| s.stats.errors += 1).await;
        }

        ctx.shared
            .with(|s| {
                s.active_dirs.remove(&dir);
            })
            .await;
    })
}

async fn scan_directory_inner(
    ctx: &WalkContext,
    dir: &Path,
    holds_permit: bool,
) -> io::Result<()> {
    let entries = fsio::list_dir(dir).await?;

    let mut batch = FileBatch::new(ctx.clone());
    let mut subdirs: Vec<PathBuf> = Vec::new();

    for entry in entries {
        match entry.kind {
            EntryKind::Symlink => {
                ctx.shared.with(|s| s.stats.symlinks_skipped += 1).await;
                debug!(path = %entry.path.display(), "Skipping symlink");
            }
            EntryKind::File => {
                batch.push(entry.path);
                if batch.len() >= ctx.pressure.file_batch_size() {
                    batch.flush().await;
                }
            }
            EntryKind::Dir => subdirs.push(entry.path),
            EntryKind::Other => {
                ctx.shared
                    .with(|s| s.stats.special_files_skipped += 1)
                    .await;
                debug!(path = %entry.path.display(), "Skipping special file");
            }
        }
    }

    // Remainder below the flush threshold
    batch.flush().await;

    if !subdirs.is_empty() {
        // On Critical the abort flag is set and the window below refuses to
        // open new slots; the verdict itself needs no handling here
        ctx.pressure.pace(&ctx.shared, &ctx.flags).await;
        subdirs::process_subdirs(ctx.clone(), subdirs, holds_permit).await;
    }

    // Re-read after the whole subtree finished; children recorded (not yet
    // deleted) still count as contents, so only directories that are empty
    // right now are recorded.
    if ctx.config.remove_empty_dirs && dir != ctx.config.root {
        check_empty_directory(ctx, dir).await;
    }

    Ok(())
}

/// Record `dir` for the reaper if it is empty at this observation.
///
/// The emptiness probe and the set insertion form one critical section under
/// the stats lock, so two frames observing the same parent concurrently
/// cannot record it twice.
async fn check_empty_directory(ctx: &WalkContext, dir: &Path) {
    let mut state = ctx.shared.lock().await;
    match fsio::is_dir_empty(dir).await {
        Ok(true) => {
            if state.note_empty_dir(dir.to_path_buf()) {
                debug!(directory = %dir.display(), "Found empty directory");
            }
        }
        Ok(false) => {}
        Err(e) => match classify_io(&e) {
            // Deleted out from under us or unreadable: not our directory to
            // record either way
            IoClass::TransientGone | IoClass::PermissionDenied => {}
            IoClass::Unexpected => {
                debug!(directory = %dir.display(), error = %e, "Error checking empty directory");
            }
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{LogLevel, PurgeConfig};
    use crate::memory::MemoryMonitor;
    use std::time::SystemTime;
    use tempfile::tempdir;

    pub(crate) fn test_context(root: &Path) -> WalkContext {
        let config = Arc::new(PurgeConfig {
            root: root.to_path_buf(),
            max_age_days: 30.0,
            cutoff: crate::config::cutoff_for(SystemTime::now(), 30.0),
            scan_slots: 100,
            delete_slots: 100,
            subdir_slots: 10,
            task_batch_size: 100,
            soft_limit_mb: 0,
            hard_memory_ratio: 0.95,
            remove_empty_dirs: true,
            max_empty_dirs_per_run: 0,
            dry_run: false,
            log_level: LogLevel::Info,
        });
        let monitor = Arc::new(MemoryMonitor::new(0, 0.95));
        WalkContext {
            fabric: Arc::new(Fabric::new(&config)),
            pressure: Arc::new(PressureController::new(monitor, config.task_batch_size, 100)),
            shared: Arc::new(SharedState::new()),
            flags: Arc::new(RunFlags::default()),
            config,
        }
    }

    #[tokio::test]
    async fn test_concurrent_observers_record_once() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();

        let ctx = test_context(dir.path());
        tokio::join!(
            check_empty_directory(&ctx, &empty),
            check_empty_directory(&ctx, &empty)
        );

        let (found, len) = ctx
            .shared
            .with(|s| (s.stats.empty_dirs_found, s.empty_dirs.len()))
            .await;
        assert_eq!(found, 1);
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn test_root_never_recorded_empty() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());

        scan_directory(ctx.clone(), dir.path().to_path_buf(), false).await;

        let recorded = ctx.shared.with(|s| s.empty_dirs.len()).await;
        assert_eq!(recorded, 0);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_listing_failure_counts_one_error() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let missing = dir.path().join("never-existed");

        scan_directory(ctx.clone(), missing, false).await;

        let (errors, active) = ctx
            .shared
            .with(|s| (s.stats.errors, s.active_dirs.len()))
            .await;
        assert_eq!(errors, 1);
        assert_eq!(active, 0, "frame must leave the active set on failure");
    }
}
