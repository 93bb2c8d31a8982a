//! Filesystem access used by the resource detectors.
//!
//! Detectors only ever need to stat a path and read a small file as text.
//! Going through [`FileSystem`] keeps them testable against fabricated
//! `/proc` and directory trees.

use std::future::Future;
use std::io;
use std::path::Path;

/// What a path points to, after following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// Anything else (socket, device, fifo...).
    Other,
}

/// Read-only filesystem capability.
pub trait FileSystem: Send + Sync {
    /// Reads a whole file as text, replacing invalid UTF-8 sequences.
    fn read_to_string(&self, path: &Path) -> impl Future<Output = io::Result<String>> + Send;

    /// Stats a path, following symlinks.
    fn entry_kind(&self, path: &Path) -> impl Future<Output = io::Result<EntryKind>> + Send;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFs;

impl FileSystem for TokioFs {
    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn entry_kind(&self, path: &Path) -> io::Result<EntryKind> {
        let file_type = tokio::fs::metadata(path).await?.file_type();
        Ok(if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        })
    }
}
