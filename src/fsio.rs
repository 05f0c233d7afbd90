//! Filesystem access layer
//!
//! Thin async wrappers over the blocking native calls the purger needs:
//! directory listing, metadata snapshots, and emptiness probes. Listings are
//! dispatched to the runtime's blocking pool, which `main` sizes from the
//! subdir-slot count (see [`crate::config::PurgeConfig::listing_pool_size`]);
//! an undersized pool serializes listings and becomes the throughput ceiling.
//!
//! This module is also the test seam: everything above it deals in
//! [`DirEntryInfo`] and [`FileMeta`] values rather than raw `std::fs` types.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::task;

/// Classification of one directory entry, from the kind hint the listing
/// call returns without an extra stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symlink of any kind; never followed, never deleted
    Symlink,
    /// Socket, FIFO, block or char device; never deleted
    Other,
}

/// One entry of a listed directory
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Metadata snapshot of a single file
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub len: u64,
    pub mtime: SystemTime,
    pub is_file: bool,
}

/// List one directory's entries as a fully-materialized batch.
///
/// Runs the blocking native listing on the worker pool so it cannot starve
/// the cooperative scheduler.
pub async fn list_dir(path: &Path) -> io::Result<Vec<DirEntryInfo>> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::Other
            };
            entries.push(DirEntryInfo {
                name: entry.file_name(),
                path: entry.path(),
                kind,
            });
        }
        Ok(entries)
    })
    .await
    .expect("listing task panicked")
}

/// Stat a file without following symlinks.
pub async fn file_meta(path: &Path) -> io::Result<FileMeta> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    Ok(FileMeta {
        len: meta.len(),
        mtime: meta.modified()?,
        is_file: meta.is_file(),
    })
}

/// Check whether a directory is empty at this observation.
///
/// Cheaper than a full listing: stops at the first entry.
pub async fn is_dir_empty(path: &Path) -> io::Result<bool> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        let mut entries = std::fs::read_dir(&path)?;
        match entries.next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e),
        }
    })
    .await
    .expect("emptiness probe panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_list_dir_classifies_entries() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::os::unix::fs::symlink("/nonexistent", dir.path().join("link")).unwrap();

        let mut entries = list_dir(dir.path()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].kind, EntryKind::Symlink);
        assert_eq!(entries[2].kind, EntryKind::Dir);
    }

    #[tokio::test]
    async fn test_list_dir_missing_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = list_dir(&missing).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_is_dir_empty() {
        let dir = tempdir().unwrap();
        assert!(is_dir_empty(dir.path()).await.unwrap());
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        assert!(!is_dir_empty(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_meta_does_not_follow_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, b"payload").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let meta = file_meta(&link).await.unwrap();
        assert!(!meta.is_file, "symlink metadata must not report a regular file");
    }
}
