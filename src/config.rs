//! Configuration types for efs-purger
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros (every option also reads
//!   an `EFSPURGE_`-prefixed environment variable; CLI wins over env)
//! - Runtime configuration with validation
//! - The protected-prefix denylist for the root path

use crate::error::{ConfigError, PurgeError};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default capacity for the scan and delete slot semaphores
pub const DEFAULT_SLOTS: usize = 1000;

/// Ratio of the hard memory limit at which the circuit breaker trips
pub const HARD_MEMORY_RATIO: f64 = 0.95;

/// Listing worker pool bounds (see [`PurgeConfig::listing_pool_size`])
const LISTING_POOL_MIN: usize = 32;
const LISTING_POOL_MAX: usize = 500;

/// Rough per-path bookkeeping cost used to suggest a reaper rate limit
/// when the operator disables it
const PER_PATH_OVERHEAD_BYTES: u64 = 512;

/// System prefixes the purger refuses to operate under. These contain
/// device nodes and virtual filesystems; deleting inside them risks
/// system instability.
const BLOCKED_PREFIXES: &[&str] = &[
    "/proc", "/sys", "/dev", "/run", "/var/run", "/boot", "/bin", "/sbin",
    "/lib", "/lib64", "/usr/bin", "/usr/sbin", "/usr/lib", "/etc",
];

/// High-performance async file purger for AWS EFS and network storage
#[derive(Parser, Debug, Clone)]
#[command(
    name = "efs-purger",
    version,
    about = "High-performance async file purger for AWS EFS and network storage",
    long_about = "Walks a directory tree and deletes regular files whose modification time \
                  is older than the configured cutoff, optionally removing the empty \
                  directories left behind.\n\n\
                  Designed for millions of files on filesystems where every metadata \
                  operation costs milliseconds: throughput comes from overlapping many \
                  concurrent operations while keeping memory bounded.",
    after_help = "EXAMPLES:\n    \
        efs-purger /mnt/efs/scratch --max-age-days 30 --dry-run\n    \
        efs-purger /mnt/efs/scratch --max-age-days 7 --remove-empty-dirs\n    \
        efs-purger /mnt/efs/cache --max-concurrency-scanning 2000 --max-concurrency-deletion 500"
)]
pub struct CliArgs {
    /// Root path to scan and purge
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Files older than this (in days) will be purged
    #[arg(long, env = "EFSPURGE_MAX_AGE_DAYS", default_value_t = 30.0, value_name = "DAYS")]
    pub max_age_days: f64,

    /// Maximum concurrent stat/read operations
    #[arg(long, env = "EFSPURGE_MAX_CONCURRENCY_SCANNING", value_name = "NUM")]
    pub max_concurrency_scanning: Option<usize>,

    /// Maximum concurrent unlink/rmdir operations
    #[arg(long, env = "EFSPURGE_MAX_CONCURRENCY_DELETION", value_name = "NUM")]
    pub max_concurrency_deletion: Option<usize>,

    /// Deprecated: sets both scanning and deletion concurrency
    #[arg(long, env = "EFSPURGE_MAX_CONCURRENCY", value_name = "NUM")]
    pub max_concurrency: Option<usize>,

    /// Maximum subdirectories walked concurrently (lower = less memory)
    #[arg(long, env = "EFSPURGE_MAX_CONCURRENT_SUBDIRS", default_value_t = 100, value_name = "NUM")]
    pub max_concurrent_subdirs: usize,

    /// File-pipeline flush threshold (prevents OOM on huge directories)
    #[arg(long, env = "EFSPURGE_TASK_BATCH_SIZE", default_value_t = 5000, value_name = "NUM")]
    pub task_batch_size: usize,

    /// Soft memory limit in MB (triggers back-pressure, 0 = disabled)
    #[arg(long, env = "EFSPURGE_MEMORY_LIMIT_MB", default_value_t = 800, value_name = "MB")]
    pub memory_limit_mb: u64,

    /// Don't actually delete anything, just report what would be deleted
    #[arg(long, env = "EFSPURGE_DRY_RUN")]
    pub dry_run: bool,

    /// Remove empty directories after scanning (post-order deletion)
    #[arg(long, env = "EFSPURGE_REMOVE_EMPTY_DIRS")]
    pub remove_empty_dirs: bool,

    /// Maximum empty directories to delete per run (0 = unlimited)
    #[arg(long, env = "EFSPURGE_MAX_EMPTY_DIRS_TO_DELETE", default_value_t = 500, value_name = "NUM")]
    pub max_empty_dirs_to_delete: usize,

    /// Logging level
    #[arg(long, env = "EFSPURGE_LOG_LEVEL", default_value = "info", value_enum)]
    pub log_level: LogLevel,
}

/// Log verbosity accepted on the CLI
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive string for the tracing env filter
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Root of the subtree to purge (absolute)
    pub root: PathBuf,

    /// Age threshold in days (kept for reporting; `cutoff` is derived)
    pub max_age_days: f64,

    /// Files with mtime strictly older than this are purge candidates
    pub cutoff: SystemTime,

    /// Scan-slot semaphore capacity (stat/read ops)
    pub scan_slots: usize,

    /// Delete-slot semaphore capacity (unlink/rmdir ops)
    pub delete_slots: usize,

    /// Subdir-slot semaphore capacity (concurrent directory walks)
    pub subdir_slots: usize,

    /// File-pipeline flush threshold
    pub task_batch_size: usize,

    /// Soft memory limit in MB (0 = memory logic disabled)
    pub soft_limit_mb: u64,

    /// Fraction of the hard memory limit that trips the circuit breaker
    pub hard_memory_ratio: f64,

    /// Whether to run the empty-directory reaper after scanning
    pub remove_empty_dirs: bool,

    /// Reaper rate limit per run (0 = unlimited)
    pub max_empty_dirs_per_run: usize,

    /// Suppress all mutations while keeping the `_to_*` counters
    pub dry_run: bool,

    /// Log verbosity
    pub log_level: LogLevel,
}

impl PurgeConfig {
    /// Create and validate configuration from CLI arguments.
    ///
    /// `now` anchors the cutoff computation; the CLI passes the wall clock,
    /// tests may pass any instant.
    pub fn from_args(args: CliArgs, now: SystemTime) -> Result<Self, PurgeError> {
        if !args.max_age_days.is_finite() || args.max_age_days < 0.0 {
            return Err(ConfigError::InvalidMaxAge { value: args.max_age_days }.into());
        }

        // The legacy single-value knob sets both semaphores; explicit values
        // still win over it.
        let (scan_slots, delete_slots) = if let Some(legacy) = args.max_concurrency {
            warn!(
                max_concurrency = legacy,
                "max-concurrency is deprecated; use max-concurrency-scanning and \
                 max-concurrency-deletion instead (setting both to the legacy value)"
            );
            (
                args.max_concurrency_scanning.unwrap_or(legacy),
                args.max_concurrency_deletion.unwrap_or(legacy),
            )
        } else {
            (
                args.max_concurrency_scanning.unwrap_or(DEFAULT_SLOTS),
                args.max_concurrency_deletion.unwrap_or(DEFAULT_SLOTS),
            )
        };

        if scan_slots == 0 {
            return Err(ConfigError::InvalidConcurrency {
                name: "max_concurrency_scanning",
                value: scan_slots,
            }
            .into());
        }
        if delete_slots == 0 {
            return Err(ConfigError::InvalidConcurrency {
                name: "max_concurrency_deletion",
                value: delete_slots,
            }
            .into());
        }
        if args.max_concurrent_subdirs == 0 {
            return Err(ConfigError::InvalidConcurrency {
                name: "max_concurrent_subdirs",
                value: args.max_concurrent_subdirs,
            }
            .into());
        }
        if args.task_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize { size: args.task_batch_size }.into());
        }

        let root = std::path::absolute(&args.path).map_err(PurgeError::Io)?;
        check_root_blocked(&root)?;

        if args.remove_empty_dirs && args.max_empty_dirs_to_delete == 0 {
            if args.memory_limit_mb > 0 {
                let suggested =
                    args.memory_limit_mb * 7 / 10 * 1024 * 1024 / PER_PATH_OVERHEAD_BYTES;
                warn!(
                    suggested_limit = suggested,
                    "max-empty-dirs-to-delete is unlimited; consider a cap sized to \
                     ~70% of the soft memory limit"
                );
            } else {
                warn!(
                    "max-empty-dirs-to-delete is unlimited and no memory limit is set; \
                     very large runs may exhaust memory"
                );
            }
        }

        let cutoff = cutoff_for(now, args.max_age_days);

        Ok(Self {
            root,
            max_age_days: args.max_age_days,
            cutoff,
            scan_slots,
            delete_slots,
            subdir_slots: args.max_concurrent_subdirs,
            task_batch_size: args.task_batch_size,
            soft_limit_mb: args.memory_limit_mb,
            hard_memory_ratio: HARD_MEMORY_RATIO,
            remove_empty_dirs: args.remove_empty_dirs,
            max_empty_dirs_per_run: args.max_empty_dirs_to_delete,
            dry_run: args.dry_run,
            log_level: args.log_level,
        })
    }

    /// Size of the blocking worker pool behind directory listings.
    ///
    /// Scales with `subdir_slots`: an undersized pool serializes listings and
    /// caps directory throughput no matter how many subdir slots exist.
    pub fn listing_pool_size(&self) -> usize {
        (self.subdir_slots / 10).clamp(LISTING_POOL_MIN, LISTING_POOL_MAX)
    }
}

/// Compute the mtime cutoff `now - max_age_days`, clamped at the epoch.
/// Ages too large for a Duration clamp the same way.
pub fn cutoff_for(now: SystemTime, max_age_days: f64) -> SystemTime {
    match Duration::try_from_secs_f64(max_age_days * 86_400.0) {
        Ok(age) => now.checked_sub(age).unwrap_or(UNIX_EPOCH),
        Err(_) => UNIX_EPOCH,
    }
}

/// Reject roots that are, or resolve inside, a protected system prefix.
///
/// Resolution catches the case where the supplied root is a symlink into a
/// protected tree; an unresolvable root is checked as given.
fn check_root_blocked(root: &Path) -> Result<(), PurgeError> {
    let resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    for prefix in BLOCKED_PREFIXES {
        let prefix = Path::new(prefix);
        if resolved == prefix || resolved.starts_with(prefix) {
            return Err(PurgeError::RootBlocked {
                path: root.to_path_buf(),
                prefix: prefix.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(path: &str) -> CliArgs {
        CliArgs {
            path: PathBuf::from(path),
            max_age_days: 30.0,
            max_concurrency_scanning: None,
            max_concurrency_deletion: None,
            max_concurrency: None,
            max_concurrent_subdirs: 100,
            task_batch_size: 5000,
            memory_limit_mb: 800,
            dry_run: false,
            remove_empty_dirs: false,
            max_empty_dirs_to_delete: 500,
            log_level: LogLevel::Info,
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = PurgeConfig::from_args(base_args("/tmp/purge-me"), SystemTime::now()).unwrap();
        assert_eq!(config.scan_slots, DEFAULT_SLOTS);
        assert_eq!(config.delete_slots, DEFAULT_SLOTS);
        assert_eq!(config.subdir_slots, 100);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_legacy_concurrency_sets_both() {
        let mut args = base_args("/tmp/purge-me");
        args.max_concurrency = Some(250);
        let config = PurgeConfig::from_args(args, SystemTime::now()).unwrap();
        assert_eq!(config.scan_slots, 250);
        assert_eq!(config.delete_slots, 250);
    }

    #[test]
    fn test_explicit_wins_over_legacy() {
        let mut args = base_args("/tmp/purge-me");
        args.max_concurrency = Some(250);
        args.max_concurrency_scanning = Some(800);
        let config = PurgeConfig::from_args(args, SystemTime::now()).unwrap();
        assert_eq!(config.scan_slots, 800);
        assert_eq!(config.delete_slots, 250);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut args = base_args("/tmp/purge-me");
        args.max_age_days = -1.0;
        assert!(PurgeConfig::from_args(args, SystemTime::now()).is_err());

        let mut args = base_args("/tmp/purge-me");
        args.max_age_days = f64::INFINITY;
        assert!(PurgeConfig::from_args(args, SystemTime::now()).is_err());

        let mut args = base_args("/tmp/purge-me");
        args.task_batch_size = 0;
        assert!(PurgeConfig::from_args(args, SystemTime::now()).is_err());

        let mut args = base_args("/tmp/purge-me");
        args.max_concurrent_subdirs = 0;
        assert!(PurgeConfig::from_args(args, SystemTime::now()).is_err());
    }

    #[test]
    fn test_blocked_roots_rejected() {
        for path in ["/proc", "/etc", "/dev/shm", "/usr/lib/systemd"] {
            let err = PurgeConfig::from_args(base_args(path), SystemTime::now()).unwrap_err();
            assert!(
                matches!(err, PurgeError::RootBlocked { .. }),
                "expected RootBlocked for {path}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_lib64_does_not_shadow_similar_names() {
        // /library is not under /lib; component-wise prefix matching matters
        assert!(PurgeConfig::from_args(base_args("/library/data"), SystemTime::now()).is_ok());
    }

    #[test]
    fn test_cutoff_clamps_at_epoch() {
        let cutoff = cutoff_for(SystemTime::now(), 1.0e9);
        assert_eq!(cutoff, UNIX_EPOCH);
    }

    #[test]
    fn test_listing_pool_size_bounds() {
        let mut config =
            PurgeConfig::from_args(base_args("/tmp/purge-me"), SystemTime::now()).unwrap();
        config.subdir_slots = 100;
        assert_eq!(config.listing_pool_size(), 32);
        config.subdir_slots = 1000;
        assert_eq!(config.listing_pool_size(), 100);
        config.subdir_slots = 50_000;
        assert_eq!(config.listing_pool_size(), 500);
    }
}
