//! Per-directory file pipeline.
//!
//! Files stream into a buffer owned by the directory frame; the buffer is
//! flushed as a concurrent batch whenever it reaches the (pressure-tuned)
//! threshold and once more at frame exit. Each flushed task takes a scan
//! slot for the stat and, when the file is eligible and this is not a dry
//! run, a delete slot for the unlink. The slots are never held together.

use super::WalkContext;
use crate::backpressure::Pressure;
use crate::error::{classify_io, IoClass};
use crate::fsio;
use crate::stats::Metric;
use std::io;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Pending per-file work local to one directory frame.
pub struct FileBatch {
    ctx: WalkContext,
    paths: Vec<PathBuf>,
}

impl FileBatch {
    pub fn new(ctx: WalkContext) -> Self {
        Self { ctx, paths: Vec::new() }
    }

    pub fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Run the buffered tasks concurrently and drain the buffer.
    ///
    /// The buffer is cleared up-front, so the frame's next iteration starts
    /// clean even if this flush is cancelled partway. A task failure
    /// (panic) is logged and counted, never silently dropped.
    pub async fn flush(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        let paths: Vec<PathBuf> = self.paths.drain(..).collect();

        if self.ctx.flags.should_stop() {
            return;
        }
        let verdict = self.ctx.pressure.pace(&self.ctx.shared, &self.ctx.flags).await;
        if verdict == Pressure::Critical {
            return;
        }

        let count = paths.len();
        let mut tasks = JoinSet::new();
        for path in paths {
            tasks.spawn(process_file(self.ctx.clone(), path));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Unexpected failure in batch processing");
                self.ctx.shared.with(|s| s.stats.errors += 1).await;
            }
        }
        debug!(batch = count, "Processed file batch");
    }
}

/// Stat one file and purge it if older than the cutoff.
///
/// "Not found" at any step is the accepted TOCTOU race and costs nothing;
/// permission problems count as errors at warning severity; anything else
/// counts at error severity. The task never propagates.
async fn process_file(ctx: WalkContext, path: PathBuf) {
    ctx.shared.task_started();
    run_file_task(&ctx, &path).await;
    ctx.shared.task_finished();
}

async fn run_file_task(ctx: &WalkContext, path: &PathBuf) {
    let meta = {
        let _scan_slot = ctx
            .fabric
            .scan_slots
            .acquire()
            .await
            .expect("scan semaphore closed");
        fsio::file_meta(path).await
    };

    let meta = match meta {
        Ok(meta) => meta,
        Err(e) => {
            record_file_error(ctx, path, &e, "Error statting file").await;
            return;
        }
    };

    ctx.shared
        .with(|s| {
            s.stats.files_scanned += 1;
            s.rates.record(Metric::FilesScanned, 1);
        })
        .await;

    // The entry was a regular file when listed; if it is something else by
    // now the tree changed under us, which is not an error
    if !meta.is_file {
        debug!(file = %path.display(), "No longer a regular file, skipping");
        return;
    }

    if meta.mtime >= ctx.config.cutoff {
        return;
    }

    ctx.shared
        .with(|s| {
            s.stats.files_to_purge += 1;
            s.stats.bytes_freed += meta.len;
        })
        .await;

    if ctx.config.dry_run {
        debug!(file = %path.display(), "Would purge");
        return;
    }

    let _delete_slot = ctx
        .fabric
        .delete_slots
        .acquire()
        .await
        .expect("delete semaphore closed");

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            ctx.shared
                .with(|s| {
                    s.stats.files_purged += 1;
                    s.rates.record(Metric::FilesDeleted, 1);
                })
                .await;
            debug!(file = %path.display(), "Purged");
        }
        Err(e) if e.kind() == io::ErrorKind::IsADirectory => {
            debug!(file = %path.display(), "Became a directory, skipping");
        }
        Err(e) => record_file_error(ctx, path, &e, "Error purging file").await,
    }
}

async fn record_file_error(ctx: &WalkContext, path: &PathBuf, e: &io::Error, what: &str) {
    match classify_io(e) {
        IoClass::TransientGone => {
            debug!(file = %path.display(), "File already deleted");
        }
        IoClass::PermissionDenied => {
            warn!(file = %path.display(), error = %e, "Permission denied");
            ctx.shared.with(|s| s.stats.errors += 1).await;
        }
        IoClass::Unexpected => {
            error!(file = %path.display(), error = %e, "{what}");
            ctx.shared.with(|s| s.stats.errors += 1).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::tests::test_context;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn make_old(path: &std::path::Path, days: u64) {
        let mtime = SystemTime::now() - Duration::from_secs(days * 86_400);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(mtime))
            .unwrap();
    }

    #[tokio::test]
    async fn test_old_file_is_purged() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("old.txt");
        std::fs::write(&file, b"stale").unwrap();
        make_old(&file, 60);

        let ctx = test_context(dir.path());
        process_file(ctx.clone(), file.clone()).await;

        assert!(!file.exists());
        let stats = ctx.shared.with(|s| s.stats.clone()).await;
        assert_eq!(stats.files_scanned, 1);
        assert_eq!(stats.files_to_purge, 1);
        assert_eq!(stats.files_purged, 1);
        assert_eq!(stats.bytes_freed, 5);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_recent_file_is_preserved() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("fresh.txt");
        std::fs::write(&file, b"fresh").unwrap();

        let ctx = test_context(dir.path());
        process_file(ctx.clone(), file.clone()).await;

        assert!(file.exists());
        let stats = ctx.shared.with(|s| s.stats.clone()).await;
        assert_eq!(stats.files_scanned, 1);
        assert_eq!(stats.files_to_purge, 0);
    }

    #[tokio::test]
    async fn test_vanished_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        process_file(ctx.clone(), dir.path().join("gone.txt")).await;

        let stats = ctx.shared.with(|s| s.stats.clone()).await;
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.files_scanned, 0);
    }

    #[tokio::test]
    async fn test_flush_clears_buffer() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let mut batch = FileBatch::new(ctx.clone());

        for i in 0..3 {
            let file = dir.path().join(format!("f{i}"));
            std::fs::write(&file, b"x").unwrap();
            batch.push(file);
        }
        assert_eq!(batch.len(), 3);
        batch.flush().await;
        assert!(batch.is_empty());

        let scanned = ctx.shared.with(|s| s.stats.files_scanned).await;
        assert_eq!(scanned, 3);
    }
}
