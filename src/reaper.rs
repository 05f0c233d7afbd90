//! Post-order empty-directory reaper.
//!
//! Consumes the set of directories the walker observed empty and deletes
//! them deepest-first, so every directory's empty children are gone before
//! the directory itself is considered. Each deletion proposes its parent as
//! a cascade candidate; candidates that are empty at re-check feed the next
//! iteration until nothing new appears or the per-run rate limit is hit.
//!
//! Batches run concurrently under delete slots, with a memory check before
//! and after every batch - the after-check matters because spikes happen
//! during the batch, not before it. The delete slot is held only for the
//! probe-and-rmdir of a single directory; candidate re-checks take scan
//! slots instead so deletions keep overlapping.

use crate::backpressure::{Pressure, PressureController, RunFlags};
use crate::config::PurgeConfig;
use crate::error::{classify_io, IoClass};
use crate::fabric::Fabric;
use crate::fsio;
use crate::logging::log_with_context;
use crate::stats::{Metric, SharedState};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Level};

/// Pass B iterations between progress records
const PROGRESS_EVERY_ITERATIONS: u64 = 100;
/// Deletions between progress records
const PROGRESS_EVERY_DELETIONS: u64 = 1000;

/// Reaper batch size base, before pressure tuning:
/// `clamp(delete_slots / 10, 50, 200)`.
pub fn base_batch_size(delete_slots: usize) -> usize {
    (delete_slots / 10).clamp(50, 200)
}

#[derive(Debug, Default)]
struct PassOutcome {
    limit_reached: bool,
    stopped: bool,
}

#[derive(Serialize)]
struct RateLimitRecord {
    max_empty_dirs_to_delete: usize,
    empty_dirs_to_delete: u64,
    unprocessed_dirs_in_batch: usize,
    remaining_dirs_in_pass: usize,
}

/// Deletes the walker's empty-directory observations in post-order.
pub struct EmptyDirReaper {
    config: Arc<PurgeConfig>,
    shared: Arc<SharedState>,
    fabric: Arc<Fabric>,
    pressure: Arc<PressureController>,
    flags: Arc<RunFlags>,
    /// Resolved root, compared against resolved candidates so the root is
    /// never deleted even when reached through a different spelling
    root: PathBuf,
}

impl EmptyDirReaper {
    pub fn new(
        config: Arc<PurgeConfig>,
        shared: Arc<SharedState>,
        fabric: Arc<Fabric>,
        pressure: Arc<PressureController>,
        flags: Arc<RunFlags>,
    ) -> Self {
        let root = config
            .root
            .canonicalize()
            .unwrap_or_else(|_| config.root.clone());
        Self { config, shared, fabric, pressure, flags, root }
    }

    /// Run both passes. Consumes the empty-directory set; it is empty when
    /// this returns.
    pub async fn run(&self) {
        let initial: Vec<PathBuf> = self
            .shared
            .with(|s| std::mem::take(&mut s.empty_dirs).into_iter().collect())
            .await;

        if initial.is_empty() {
            debug!("No empty directories recorded, nothing to reap");
            return;
        }

        log_with_context(
            Level::INFO,
            "Starting empty directory removal",
            &serde_json::json!({ "empty_dirs_found": initial.len() }),
        );

        // Pass A: everything the walk observed, deepest first
        let mut sorted = initial;
        sorted.sort_by_key(|p| Reverse(p.components().count()));

        let mut cascade: HashSet<PathBuf> = HashSet::new();
        let mut outcome = self.process_pass(&sorted, &mut cascade).await;

        let deleted = self.shared.with(|s| s.stats.empty_dirs_deleted).await;
        log_with_context(
            Level::INFO,
            "Empty directory removal progress",
            &serde_json::json!({ "empty_dirs_deleted": deleted, "pass": "initial" }),
        );

        if !cascade.is_empty() && !outcome.limit_reached && !outcome.stopped {
            log_with_context(
                Level::INFO,
                "Starting cascading empty directory removal",
                &serde_json::json!({ "parents_to_check": cascade.len() }),
            );
        }

        // Pass B: parents freshly emptied by pass A, repeated to a fixpoint
        let mut iteration: u64 = 0;
        let mut last_logged_deletions = deleted;

        while !cascade.is_empty() && !outcome.limit_reached && !outcome.stopped {
            iteration += 1;

            let mut kept = self.filter_candidates(&mut cascade).await;
            kept.sort_by_key(|p| Reverse(p.components().count()));

            let pass = self.process_pass(&kept, &mut cascade).await;
            outcome.limit_reached |= pass.limit_reached;
            outcome.stopped |= pass.stopped;

            let (to_delete, deleted) = self
                .shared
                .with(|s| (s.stats.empty_dirs_to_delete, s.stats.empty_dirs_deleted))
                .await;
            if iteration % PROGRESS_EVERY_ITERATIONS == 0
                || deleted - last_logged_deletions >= PROGRESS_EVERY_DELETIONS
            {
                log_with_context(
                    Level::INFO,
                    "Cascading empty directory removal progress",
                    &serde_json::json!({
                        "iteration": iteration,
                        "empty_dirs_to_delete": to_delete,
                        "empty_dirs_deleted": deleted,
                        "parents_remaining": cascade.len(),
                    }),
                );
                last_logged_deletions = deleted;
            }
        }

        let (to_delete, deleted) = self
            .shared
            .with(|s| {
                s.empty_dirs.clear();
                (s.stats.empty_dirs_to_delete, s.stats.empty_dirs_deleted)
            })
            .await;
        log_with_context(
            Level::INFO,
            "Empty directory removal completed",
            &serde_json::json!({
                "total_empty_dirs_to_delete": to_delete,
                "total_empty_dirs_deleted": deleted,
                "iterations": iteration,
            }),
        );
    }

    /// Keep the cascade candidates that are real, non-root directories and
    /// empty right now. Fresh confirmations count toward `empty_dirs_found`.
    async fn filter_candidates(&self, cascade: &mut HashSet<PathBuf>) -> Vec<PathBuf> {
        let mut kept = Vec::new();
        for candidate in cascade.drain() {
            let resolved = candidate
                .canonicalize()
                .unwrap_or_else(|_| candidate.clone());
            if resolved == self.root {
                continue;
            }

            let empty = {
                let _scan_slot = self
                    .fabric
                    .scan_slots
                    .acquire()
                    .await
                    .expect("scan semaphore closed");
                fsio::is_dir_empty(&candidate).await
            };
            match empty {
                Ok(true) => {
                    self.shared
                        .with(|s| {
                            s.note_empty_dir(candidate.clone());
                        })
                        .await;
                    kept.push(candidate);
                }
                Ok(false) => {}
                Err(_) => {} // gone, unreadable, or no longer a directory
            }
        }
        kept
    }

    /// Delete one sorted list in pressure-sized concurrent batches.
    async fn process_pass(
        &self,
        dirs: &[PathBuf],
        cascade: &mut HashSet<PathBuf>,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        let limit = self.config.max_empty_dirs_per_run;
        let mut i = 0;

        while i < dirs.len() {
            if self.flags.should_stop() {
                outcome.stopped = true;
                break;
            }
            if self.pressure.pace(&self.shared, &self.flags).await == Pressure::Critical {
                outcome.stopped = true;
                break;
            }

            let size = self.pressure.reaper_batch_size().max(1);
            let end = (i + size).min(dirs.len());
            let batch = &dirs[i..end];

            // The rate limit counts attempts against empty_dirs_to_delete,
            // so dry runs honor it too. Launching at most the remaining
            // allowance keeps the counter at or under the limit.
            let allowance = if limit == 0 {
                batch.len()
            } else {
                let used = self.shared.with(|s| s.stats.empty_dirs_to_delete).await;
                limit.saturating_sub(used as usize)
            };

            let launch = batch.len().min(allowance);
            let mut tasks = JoinSet::new();
            for dir in &batch[..launch] {
                let config = Arc::clone(&self.config);
                let shared = Arc::clone(&self.shared);
                let fabric = Arc::clone(&self.fabric);
                let root = self.root.clone();
                let dir = dir.clone();
                tasks.spawn(delete_one(config, shared, fabric, root, dir));
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Some(parent)) => {
                        cascade.insert(parent);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Empty directory deletion task failed");
                        self.shared.with(|s| s.stats.errors += 1).await;
                    }
                }
            }

            if launch < batch.len() {
                let to_delete = self.shared.with(|s| s.stats.empty_dirs_to_delete).await;
                log_with_context(
                    Level::INFO,
                    "Rate limit reached for empty directory deletion",
                    &RateLimitRecord {
                        max_empty_dirs_to_delete: limit,
                        empty_dirs_to_delete: to_delete,
                        unprocessed_dirs_in_batch: batch.len() - launch,
                        remaining_dirs_in_pass: dirs.len() - end,
                    },
                );
                outcome.limit_reached = true;
            }

            // Spikes happen during the batch, not before it
            if self.pressure.pace(&self.shared, &self.flags).await == Pressure::Critical {
                outcome.stopped = true;
                break;
            }
            if outcome.limit_reached {
                break;
            }
            i = end;
        }

        outcome
    }
}

/// Probe and delete a single directory under a delete slot.
///
/// Returns the parent path when an actual deletion happened, as a cascade
/// candidate. The slot is released before the parent is touched.
async fn delete_one(
    config: Arc<PurgeConfig>,
    shared: Arc<SharedState>,
    fabric: Arc<Fabric>,
    root: PathBuf,
    dir: PathBuf,
) -> Option<PathBuf> {
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.clone());
    if resolved == root {
        return None;
    }

    enum Outcome {
        Deleted,
        WouldDelete,
        Skipped,
        Failed(std::io::Error),
    }

    let outcome = {
        let _delete_slot = fabric
            .delete_slots
            .acquire()
            .await
            .expect("delete semaphore closed");

        match fsio::is_dir_empty(&dir).await {
            Ok(false) => Outcome::Skipped,
            Err(e) if classify_io(&e) == IoClass::TransientGone => {
                debug!(directory = %dir.display(), "Empty directory already deleted");
                Outcome::Skipped
            }
            Err(e) => Outcome::Failed(e),
            Ok(true) => {
                if config.dry_run {
                    debug!(directory = %dir.display(), "Would remove empty directory");
                    Outcome::WouldDelete
                } else {
                    match tokio::fs::remove_dir(&dir).await {
                        Ok(()) => {
                            debug!(directory = %dir.display(), "Removed empty directory");
                            Outcome::Deleted
                        }
                        Err(e) if classify_io(&e) == IoClass::TransientGone => {
                            debug!(directory = %dir.display(), "Empty directory already deleted");
                            Outcome::Skipped
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                            debug!(directory = %dir.display(), "Directory repopulated, skipping");
                            Outcome::Skipped
                        }
                        Err(e) => Outcome::Failed(e),
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Deleted => {
            shared
                .with(|s| {
                    s.stats.empty_dirs_to_delete += 1;
                    s.stats.empty_dirs_deleted += 1;
                    s.rates.record(Metric::EmptyDirsRemoved, 1);
                })
                .await;
            let parent = dir.parent()?.to_path_buf();
            let parent_resolved = parent.canonicalize().unwrap_or_else(|_| parent.clone());
            (parent_resolved != root).then_some(parent)
        }
        Outcome::WouldDelete => {
            shared.with(|s| s.stats.empty_dirs_to_delete += 1).await;
            None
        }
        Outcome::Skipped => None,
        Outcome::Failed(e) => {
            warn!(directory = %dir.display(), error = %e, "Could not remove empty directory");
            shared.with(|s| s.stats.errors += 1).await;
            None
        }
    }
}
