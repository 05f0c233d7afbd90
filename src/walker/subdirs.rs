//! Hybrid sliding-window subdirectory processor.
//!
//! A naive gather over fixed batches leaves slots idle whenever a few slow
//! directories hold the batch open; fully unbounded recursion explodes
//! memory on deep trees. The window does neither: child walks start on
//! demand while a bounded active set is kept full, and a completed child is
//! immediately replaced from the remaining queue. Memory stays bounded by
//! the subdir-slot count plus cheap queued path references.
//!
//! A child frame re-enters this processor for its own children. If its
//! ancestor chain already holds a subdir slot and the semaphore has no free
//! permits, starting a concurrent child that waits for a permit would
//! deadlock against the ancestor; that branch falls back to sequential
//! processing instead, trading concurrency for liveness.

use super::{scan_directory, WalkContext};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Safety ceiling for window cycles. Never reached in correct operation;
/// bounds the loop if completion accounting ever regresses.
const MAX_WINDOW_CYCLES: usize = 10_000;

/// Walk `subdirs` with bounded concurrency.
pub async fn process_subdirs(ctx: WalkContext, subdirs: Vec<PathBuf>, holds_permit: bool) {
    if subdirs.is_empty() {
        return;
    }

    // Deadlock avoidance: an exhausted semaphore under a held permit means
    // the free permits this branch would wait for may never appear
    if holds_permit && ctx.fabric.subdir_slots.available_permits() == 0 {
        for dir in subdirs {
            if ctx.flags.should_stop() {
                break;
            }
            scan_directory(ctx.clone(), dir, holds_permit).await;
        }
        return;
    }

    let mut remaining: VecDeque<PathBuf> = subdirs.into();
    let mut active: JoinSet<()> = JoinSet::new();
    let mut cycles = 0usize;

    while !remaining.is_empty() || !active.is_empty() {
        cycles += 1;
        if cycles > MAX_WINDOW_CYCLES {
            warn!(
                remaining = remaining.len(),
                active = active.len(),
                "Sliding window exceeded its cycle ceiling, abandoning queued subdirectories"
            );
            break;
        }

        if ctx.flags.should_stop() {
            // Stop opening new slots; whatever is active runs to completion
            remaining.clear();
        }

        while active.len() < ctx.config.subdir_slots && !remaining.is_empty() {
            let dir = remaining.pop_front().expect("queue checked non-empty");
            let child_ctx = ctx.clone();
            active.spawn(async move {
                let _slot = child_ctx
                    .fabric
                    .subdir_slots
                    .acquire()
                    .await
                    .expect("subdir semaphore closed");
                scan_directory(child_ctx.clone(), dir, true).await;
            });
        }

        match active.join_next().await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                // A panicking child walk is an engine bug; surface it loudly
                // instead of quietly shrinking the tree
                error!(error = %e, "Subdirectory walk task failed");
                ctx.shared.with(|s| s.stats.errors += 1).await;
            }
            None => {
                if remaining.is_empty() {
                    break;
                }
            }
        }
    }
}
