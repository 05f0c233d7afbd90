//! efs-purger - High-Throughput Bulk File Purger
//!
//! A tool for deleting aged files at scale on AWS EFS and other
//! high-latency network filesystems. Designed to handle millions of files
//! where every metadata operation costs milliseconds: usable throughput
//! comes entirely from overlapping many concurrent operations while keeping
//! memory bounded.
//!
//! # Features
//!
//! - **Overlapped Metadata I/O**: Independent semaphores for stat and
//!   unlink concurrency keep thousands of operations in flight.
//!
//! - **Bounded Memory**: A sliding-window subdirectory processor, streaming
//!   per-directory file batches, and a resident-set monitor with
//!   back-pressure and a hard circuit breaker.
//!
//! - **Post-Order Empty-Directory Reaping**: Deepest-first bulk deletion
//!   with cascading parent re-evaluation and a per-run rate limit.
//!
//! - **Structured Progress**: JSON-lines logging with windowed rates and
//!   stuck detection, suitable for Kubernetes/CloudWatch consumers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PurgeCoordinator                        │
//! │  validate → reporter → walk → reap → final stats             │
//! └──────────────────────────┬───────────────────────────────────┘
//!                            │
//!              ┌─────────────┼─────────────────┐
//!              ▼             ▼                 ▼
//!     ┌────────────────┐  ┌────────────┐  ┌──────────────┐
//!     │ Directory      │  │ File       │  │ Empty-dir    │
//!     │ walker         │  │ pipeline   │  │ reaper       │
//!     │ sliding window │  │ batched    │  │ post-order   │
//!     └───────┬────────┘  └─────┬──────┘  └──────┬───────┘
//!             │                 │                │
//!             ▼                 ▼                ▼
//!     ┌──────────────────────────────────────────────────┐
//!     │   Scheduling fabric (scan / delete / subdir      │
//!     │   slots) + blocking listing pool                 │
//!     └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # See what a 30-day purge would remove
//! efs-purger /mnt/efs/scratch --max-age-days 30 --dry-run
//!
//! # Purge and sweep up the empty directories left behind
//! efs-purger /mnt/efs/scratch --max-age-days 30 --remove-empty-dirs
//! ```

pub mod backpressure;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fabric;
pub mod fsio;
pub mod logging;
pub mod memory;
pub mod reaper;
pub mod reporter;
pub mod stats;
pub mod walker;

pub use config::{CliArgs, LogLevel, PurgeConfig};
pub use coordinator::{PurgeCoordinator, PurgeReport};
pub use error::{PurgeError, Result};
pub use stats::{Phase, Stats};
