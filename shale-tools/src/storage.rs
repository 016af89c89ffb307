//! The storage capability consumed by the block storage core.
//!
//! Errors use `std::io::Error`; the error kind carries the semantic
//! (`NotFound`, `AlreadyExists`, `PermissionDenied`, ...), which the core
//! maps into its own error vocabulary.

use std::io;
use std::path::{Path, PathBuf};

/// One entry produced by [`StorageProvider::read_dir_recursive`].
///
/// `path` is relative to the enumerated root.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

/// Read handle for an open file.
pub trait StorageReader: Send {
    fn size(&self) -> io::Result<u64>;

    /// Fill `buf` completely from `offset`, or fail.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Write handle for an open file. Closed on drop.
pub trait StorageWriter: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn set_size(&mut self, size: u64) -> io::Result<()>;
}

/// Advisory lock held on a file; released on drop.
pub trait FileLockGuard: Send {}

/// Byte-level file and directory access.
///
/// Implementations must be safe to share between threads; all methods take
/// `&self`.
pub trait StorageProvider: Send + Sync {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageReader>>;

    /// Create (or truncate) a file sized to `initial_size`.
    fn open_write(&self, path: &Path, initial_size: u64) -> io::Result<Box<dyn StorageWriter>>;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Move `from` to `to`. Fails with `AlreadyExists` when the target is
    /// already present - callers decide whether losing that race matters.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn is_file(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn get_permissions(&self, path: &Path) -> io::Result<u16>;

    fn set_permissions(&self, path: &Path, permissions: u16) -> io::Result<()>;

    /// Depth-first enumeration of everything below `root`.
    fn read_dir_recursive(
        &self,
        root: &Path,
    ) -> io::Result<Box<dyn Iterator<Item = io::Result<DirEntry>> + Send>>;

    /// Take the advisory lock for `path`, creating the file if needed.
    ///
    /// Blocks with internal retry/backoff; gives up after a bounded number
    /// of attempts with `PermissionDenied`.
    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLockGuard>>;

    /// Slurp a whole file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let reader = self.open_read(path)?;
        let size = reader.size()?;
        let mut data = vec![0u8; size as usize];
        reader.read_at(0, &mut data)?;
        Ok(data)
    }

    /// Write a whole file in one go.
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut writer = self.open_write(path, data.len() as u64)?;
        writer.write_at(0, data)?;
        Ok(())
    }
}
