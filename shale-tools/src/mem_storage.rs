//! [`StorageProvider`] keeping everything in process memory.
//!
//! Used as the fast tier in two-tier setups and as the storage double in
//! tests. Semantics mirror [`FsStorage`](crate::fs_storage::FsStorage):
//! rename refuses existing targets, directories must exist before files are
//! created inside them, locks are advisory with bounded retry.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::{DirEntry, FileLockGuard, StorageProvider, StorageReader, StorageWriter};

const LOCK_ATTEMPTS: u32 = 200;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);

const DEFAULT_FILE_PERMISSIONS: u16 = 0o644;
const DIR_PERMISSIONS: u16 = 0o755;

enum Entry {
    File { data: Vec<u8>, permissions: u16 },
    Dir,
}

#[derive(Default)]
struct MemState {
    entries: HashMap<PathBuf, Entry>,
    locked: HashMap<PathBuf, ()>,
}

/// In-memory storage tree.
#[derive(Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path:?} not found"))
}

// Collapse `.` and verbatim prefixes so the same file is reachable through
// equivalent spellings of its path.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

impl MemState {
    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(parent) if parent.as_os_str().is_empty() => true,
            Some(parent) => matches!(self.entries.get(parent), Some(Entry::Dir)),
        }
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemReader {
    data: Vec<u8>,
}

impl StorageReader for MemReader {
    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "read beyond end of file")
            })?;
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }
}

struct MemWriter {
    state: Arc<Mutex<MemState>>,
    path: PathBuf,
}

impl StorageWriter for MemWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(&self.path) {
            Some(Entry::File { data: content, .. }) => {
                let offset = offset as usize;
                let end = offset + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(not_found(&self.path)),
        }
    }

    fn set_size(&mut self, size: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(&self.path) {
            Some(Entry::File { data, .. }) => {
                data.resize(size as usize, 0);
                Ok(())
            }
            _ => Err(not_found(&self.path)),
        }
    }
}

struct MemFileLock {
    state: Arc<Mutex<MemState>>,
    path: PathBuf,
}

impl FileLockGuard for MemFileLock {}

impl Drop for MemFileLock {
    fn drop(&mut self) {
        self.state.lock().unwrap().locked.remove(&self.path);
    }
}

impl StorageProvider for MemStorage {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageReader>> {
        let path = normalize(path);
        let state = self.state.lock().unwrap();
        match state.entries.get(&path) {
            Some(Entry::File { data, .. }) => Ok(Box::new(MemReader { data: data.clone() })),
            _ => Err(not_found(&path)),
        }
    }

    fn open_write(&self, path: &Path, initial_size: u64) -> io::Result<Box<dyn StorageWriter>> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        if matches!(state.entries.get(&path), Some(Entry::Dir)) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path:?} is a directory"),
            ));
        }
        if !state.parent_exists(&path) {
            return Err(not_found(&path));
        }
        state.entries.insert(
            path.clone(),
            Entry::File {
                data: vec![0u8; initial_size as usize],
                permissions: DEFAULT_FILE_PERMISSIONS,
            },
        );
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            path,
        }))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path:?} already exists"),
            ));
        }
        if !state.parent_exists(&path) {
            return Err(not_found(&path));
        }
        state.entries.insert(path, Entry::Dir);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            match state.entries.get(&current) {
                Some(Entry::Dir) => continue,
                Some(Entry::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{current:?} exists and is not a directory"),
                    ));
                }
                None => {
                    state.entries.insert(current.clone(), Entry::Dir);
                }
            }
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rename target {to:?} already exists"),
            ));
        }
        if !state.parent_exists(&to) {
            return Err(not_found(&to));
        }
        match state.entries.remove(&from) {
            Some(entry) => {
                state.entries.insert(to, entry);
                Ok(())
            }
            None => Err(not_found(&from)),
        }
    }

    fn is_file(&self, path: &Path) -> bool {
        let path = normalize(path);
        matches!(
            self.state.lock().unwrap().entries.get(&path),
            Some(Entry::File { .. })
        )
    }

    fn is_dir(&self, path: &Path) -> bool {
        let path = normalize(path);
        matches!(self.state.lock().unwrap().entries.get(&path), Some(Entry::Dir))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        match state.entries.get(&path) {
            Some(Entry::File { .. }) => {
                state.entries.remove(&path);
                Ok(())
            }
            _ => Err(not_found(&path)),
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        match state.entries.get(&path) {
            Some(Entry::Dir) => {
                let occupied = state
                    .entries
                    .keys()
                    .any(|key| key != &path && key.starts_with(&path));
                if occupied {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("directory {path:?} is not empty"),
                    ));
                }
                state.entries.remove(&path);
                Ok(())
            }
            _ => Err(not_found(&path)),
        }
    }

    fn get_permissions(&self, path: &Path) -> io::Result<u16> {
        let path = normalize(path);
        let state = self.state.lock().unwrap();
        match state.entries.get(&path) {
            Some(Entry::File { permissions, .. }) => Ok(*permissions),
            Some(Entry::Dir) => Ok(DIR_PERMISSIONS),
            None => Err(not_found(&path)),
        }
    }

    fn set_permissions(&self, path: &Path, permissions: u16) -> io::Result<()> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(&path) {
            Some(Entry::File { permissions: p, .. }) => {
                *p = permissions;
                Ok(())
            }
            Some(Entry::Dir) => Ok(()),
            None => Err(not_found(&path)),
        }
    }

    fn read_dir_recursive(
        &self,
        root: &Path,
    ) -> io::Result<Box<dyn Iterator<Item = io::Result<DirEntry>> + Send>> {
        let root = normalize(root);
        let state = self.state.lock().unwrap();
        if !matches!(state.entries.get(&root), Some(Entry::Dir)) {
            return Err(not_found(&root));
        }
        let mut entries: Vec<DirEntry> = state
            .entries
            .iter()
            .filter(|(path, _)| **path != root && path.starts_with(&root))
            .map(|(path, entry)| DirEntry {
                path: path.strip_prefix(&root).unwrap().to_path_buf(),
                size: match entry {
                    Entry::File { data, .. } => data.len() as u64,
                    Entry::Dir => 0,
                },
                is_dir: matches!(entry, Entry::Dir),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLockGuard>> {
        let path = normalize(path);
        for _attempt in 0..LOCK_ATTEMPTS {
            {
                let mut state = self.state.lock().unwrap();
                if !state.entries.contains_key(&path) {
                    if !state.parent_exists(&path) {
                        return Err(not_found(&path));
                    }
                    state.entries.insert(
                        path.clone(),
                        Entry::File {
                            data: Vec::new(),
                            permissions: DEFAULT_FILE_PERMISSIONS,
                        },
                    );
                }
                if !state.locked.contains_key(&path) {
                    state.locked.insert(path.clone(), ());
                    return Ok(Box::new(MemFileLock {
                        state: Arc::clone(&self.state),
                        path,
                    }));
                }
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("unable to lock {path:?} after {LOCK_ATTEMPTS} attempts"),
        ))
    }
}
