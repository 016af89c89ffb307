//! [`StorageProvider`] backed by the local filesystem.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::{DirEntry, FileLockGuard, StorageProvider, StorageReader, StorageWriter};

// fcntl record locks are advisory and per-process; two FsStorage instances
// in the same process do not exclude each other on the same path.
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Filesystem-backed storage.
#[derive(Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

struct FsReader {
    file: File,
}

impl StorageReader for FsReader {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

struct FsWriter {
    file: File,
}

impl StorageWriter for FsWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }
}

struct FsFileLock {
    file: File,
    path: PathBuf,
}

impl FileLockGuard for FsFileLock {}

impl Drop for FsFileLock {
    fn drop(&mut self) {
        let op = libc::flock {
            l_type: libc::F_UNLCK as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        if let Err(err) = nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op))
        {
            log::error!("unable to release lock on {:?} - {err}", self.path);
        }
    }
}

fn try_write_lock(file: &File) -> nix::Result<libc::c_int> {
    let op = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op))
}

impl StorageProvider for FsStorage {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageReader>> {
        let file = File::open(path)?;
        Ok(Box::new(FsReader { file }))
    }

    fn open_write(&self, path: &Path, initial_size: u64) -> io::Result<Box<dyn StorageWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        file.set_len(initial_size)?;
        Ok(Box::new(FsWriter { file }))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        // plain rename() would silently replace the target
        if to.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rename target {to:?} already exists"),
            ));
        }
        std::fs::rename(from, to)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn get_permissions(&self, path: &Path) -> io::Result<u16> {
        let metadata = std::fs::metadata(path)?;
        Ok((metadata.permissions().mode() & 0o7777) as u16)
    }

    fn set_permissions(&self, path: &Path, permissions: u16) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions as u32))
    }

    fn read_dir_recursive(
        &self,
        root: &Path,
    ) -> io::Result<Box<dyn Iterator<Item = io::Result<DirEntry>> + Send>> {
        let root = root.to_path_buf();
        let walker = walkdir::WalkDir::new(&root)
            .min_depth(1)
            .into_iter()
            .map(move |entry| {
                let entry = entry.map_err(io::Error::from)?;
                let metadata = entry.metadata().map_err(io::Error::from)?;
                let path = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
                    .to_path_buf();
                Ok(DirEntry {
                    path,
                    size: metadata.len(),
                    is_dir: metadata.is_dir(),
                })
            });
        Ok(Box::new(walker))
    }

    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        for attempt in 0..LOCK_ATTEMPTS {
            match try_write_lock(&file) {
                Ok(_) => {
                    return Ok(Box::new(FsFileLock {
                        file,
                        path: path.to_path_buf(),
                    }));
                }
                Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => {
                    log::debug!(
                        "lock on {path:?} is busy, retrying ({}/{LOCK_ATTEMPTS})",
                        attempt + 1
                    );
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("unable to lock {path:?} after {LOCK_ATTEMPTS} attempts"),
        ))
    }
}

#[test]
fn test_fs_storage_roundtrip() {
    let dir = std::path::PathBuf::from(".testdir-fs-storage");
    if let Err(_e) = std::fs::remove_dir_all(&dir) { /* ignore */ }

    let storage = FsStorage::new();
    storage.create_dir_all(&dir.join("a/b")).unwrap();
    storage.write_file(&dir.join("a/b/f1"), b"payload").unwrap();
    assert_eq!(storage.read_file(&dir.join("a/b/f1")).unwrap(), b"payload");
    assert!(storage.is_file(&dir.join("a/b/f1")));
    assert!(storage.is_dir(&dir.join("a")));

    storage.rename(&dir.join("a/b/f1"), &dir.join("a/b/f2")).unwrap();
    storage.write_file(&dir.join("a/b/f1"), b"other").unwrap();
    let err = storage.rename(&dir.join("a/b/f1"), &dir.join("a/b/f2")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

    let entries: Vec<_> = storage
        .read_dir_recursive(&dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| !entry.is_dir)
        .map(|entry| entry.path)
        .collect();
    assert_eq!(entries.len(), 2);

    let _lock = storage.lock_file(&dir.join("a.lock")).unwrap();

    if let Err(_e) = std::fs::remove_dir_all(&dir) { /* ignore */ }
}
