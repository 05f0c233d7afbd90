//! Error types for efs-purger
//!
//! This module defines the error hierarchy for the purger:
//! - Configuration and CLI validation errors (fatal, pre-I/O)
//! - Root-path safety refusals (fatal, pre-I/O)
//! - A classification helper for the I/O failures the engine recovers from
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include context about what to do
//! - Only configuration problems propagate; everything encountered during
//!   the walk is recovered locally and reflected in the run statistics

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the efs-purger application
#[derive(Error, Debug)]
pub enum PurgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Root path is (or resolves inside) a protected system prefix
    #[error(
        "Refusing to purge system directory '{path}': it is inside '{prefix}' \
         which contains critical system files"
    )]
    RootBlocked { path: PathBuf, prefix: PathBuf },

    /// I/O errors that escaped before any work began
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid file age threshold
    #[error("Invalid max_age_days {value}: must be a finite number >= 0")]
    InvalidMaxAge { value: f64 },

    /// Invalid concurrency limit
    #[error("Invalid {name} {value}: must be >= 1")]
    InvalidConcurrency { name: &'static str, value: usize },

    /// Invalid task batch size
    #[error("Invalid task_batch_size {size}: must be >= 1")]
    InvalidBatchSize { size: usize },

    /// Root path does not exist
    #[error("Root path does not exist: '{path}'")]
    RootMissing { path: PathBuf },

    /// Root path is not a directory
    #[error("Root path is not a directory: '{path}'")]
    RootNotDirectory { path: PathBuf },
}

/// Classification of an I/O failure seen during the walk.
///
/// The engine never aborts on these; the class decides the severity it is
/// logged at and whether it counts against `Stats.errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// The path disappeared between observation and use. Expected under
    /// concurrent mutation of the tree; logged at debug, not counted.
    TransientGone,
    /// Counted as an error, logged at warning severity.
    PermissionDenied,
    /// Anything else; counted as an error, logged at error severity.
    Unexpected,
}

/// Classify an I/O error into the recovery policy buckets.
pub fn classify_io(err: &io::Error) -> IoClass {
    match err.kind() {
        io::ErrorKind::NotFound => IoClass::TransientGone,
        io::ErrorKind::PermissionDenied => IoClass::PermissionDenied,
        _ => IoClass::Unexpected,
    }
}

/// Result type alias for PurgeError
pub type Result<T> = std::result::Result<T, PurgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io() {
        let gone = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(classify_io(&gone), IoClass::TransientGone);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_io(&denied), IoClass::PermissionDenied);

        let other = io::Error::other("boom");
        assert_eq!(classify_io(&other), IoClass::Unexpected);
    }

    #[test]
    fn test_error_conversion() {
        let cfg_err = ConfigError::InvalidBatchSize { size: 0 };
        let purge_err: PurgeError = cfg_err.into();
        assert!(matches!(purge_err, PurgeError::Config(_)));
    }
}
