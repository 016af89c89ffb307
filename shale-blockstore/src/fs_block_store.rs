//! Block store persisting blocks through a [`StorageProvider`].

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use shale_tools::cancel::CancelToken;
use shale_tools::scatter::scatter_gather;
use shale_tools::storage::StorageProvider;

use crate::block_index::BlockIndex;
use crate::block_store::{BlockStore, BlockStoreStats, StatCounters, StatU64, StoreError};
use crate::content_index::ContentIndex;
use crate::stored_block::StoredBlock;
use crate::BlockHash;

pub const DEFAULT_BLOCK_EXTENSION: &str = ".lrb";

const CHUNKS_DIR: &str = "chunks";
const CONTENT_INDEX_NAME: &str = "store.lci";
const CONTENT_INDEX_LOCK_NAME: &str = "store.lci.sync";

// backoff while a concurrent writer finishes the same block
const WRITE_RACE_BACKOFF: Duration = Duration::from_millis(1);

/// Tuning knobs for an [`FsBlockStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsBlockStoreOptions {
    /// Targeted maximum payload size of newly packed blocks.
    pub max_block_size: u32,
    /// Targeted maximum chunk count of newly packed blocks.
    pub max_chunks_per_block: u32,
    /// Extension of block files, including the leading dot.
    pub block_extension: String,
    /// Worker threads used when rebuilding the store index by scanning.
    pub scan_threads: usize,
}

impl Default for FsBlockStoreOptions {
    fn default() -> Self {
        Self {
            max_block_size: 8 * 1024 * 1024,
            max_chunks_per_block: 1024,
            block_extension: DEFAULT_BLOCK_EXTENSION.to_string(),
            scan_threads: 4,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Writing,
    Present,
}

#[derive(Default)]
struct StoreState {
    block_state: HashMap<BlockHash, BlockState>,
    content_index: Option<ContentIndex>,
    pending_blocks: Vec<BlockIndex>,
}

struct StoreInner {
    storage: Arc<dyn StorageProvider>,
    content_path: PathBuf,
    options: FsBlockStoreOptions,
    // tags temp files so concurrent store instances never collide
    unique_tag: String,
    state: Mutex<StoreState>,
    stats: StatCounters,
    cancel: Option<Arc<dyn CancelToken>>,
}

/// Filesystem-backed block store.
///
/// Blocks live under `<root>/chunks/HHHH/0x<block_hash><ext>` where `HHHH`
/// are the top 16 bits of the hash; the store manifest is persisted to
/// `<root>/store.lci` on [`flush`](BlockStore::flush) and lazily rebuilt
/// from the block files when missing.
#[derive(Clone)]
pub struct FsBlockStore {
    inner: Arc<StoreInner>,
}

fn unique_store_tag() -> String {
    static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);
    let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let probe = Box::new(0u8);
    let address = &*probe as *const u8 as u64;
    let id = ((std::process::id() as u64) << 32)
        ^ address.rotate_left(16)
        ^ instance.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    format!("{id:016x}")
}

// `HHHH/0x<hash><ext>`, relative to the chunks directory
fn block_file_name(block_hash: BlockHash, extension: &str) -> String {
    format!(
        "{:04x}/0x{:016x}{}",
        (block_hash >> 48) as u16,
        block_hash,
        extension
    )
}

fn read_block_index(
    storage: &dyn StorageProvider,
    path: &Path,
) -> Result<BlockIndex, StoreError> {
    let reader = storage.open_read(path)?;
    let file_size = reader.size()?;
    if (file_size as usize) < BlockIndex::header_size() {
        return Err(StoreError::MalformedData(format!(
            "block file is only {file_size} bytes"
        )));
    }
    let mut header = vec![0u8; BlockIndex::header_size()];
    reader.read_at(0, &mut header)?;
    let index_size = BlockIndex::encoded_size_from_prefix(&header)?;
    if (file_size as usize) < index_size {
        return Err(StoreError::MalformedData(format!(
            "block file is {file_size} bytes, index needs {index_size}"
        )));
    }
    let mut buf = vec![0u8; index_size];
    reader.read_at(0, &mut buf)?;
    let (index, _) = BlockIndex::decode(&buf)?;
    Ok(index)
}

impl FsBlockStore {
    /// Open a store rooted at `content_path`, creating it lazily on first
    /// write.
    pub fn open(
        storage: Arc<dyn StorageProvider>,
        content_path: impl Into<PathBuf>,
        options: FsBlockStoreOptions,
    ) -> Result<Self, StoreError> {
        Self::open_with_cancel(storage, content_path, options, None)
    }

    /// Like [`open`](Self::open), with a token polled by long running
    /// scans.
    pub fn open_with_cancel(
        storage: Arc<dyn StorageProvider>,
        content_path: impl Into<PathBuf>,
        options: FsBlockStoreOptions,
        cancel: Option<Arc<dyn CancelToken>>,
    ) -> Result<Self, StoreError> {
        if options.max_block_size == 0 || options.max_chunks_per_block == 0 {
            return Err(StoreError::InvalidArgument(
                "max_block_size and max_chunks_per_block must be non-zero".to_string(),
            ));
        }
        if !options.block_extension.starts_with('.') {
            return Err(StoreError::InvalidArgument(format!(
                "block extension {:?} must start with a dot",
                options.block_extension
            )));
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                storage,
                content_path: content_path.into(),
                unique_tag: unique_store_tag(),
                options,
                state: Mutex::new(StoreState::default()),
                stats: StatCounters::default(),
                cancel,
            }),
        })
    }

    pub fn content_path(&self) -> &Path {
        &self.inner.content_path
    }
}

impl StoreInner {
    fn block_path(&self, block_hash: BlockHash) -> PathBuf {
        self.content_path
            .join(CHUNKS_DIR)
            .join(block_file_name(block_hash, &self.options.block_extension))
    }

    fn temp_block_path(&self, block_hash: BlockHash) -> PathBuf {
        self.content_path
            .join(CHUNKS_DIR)
            .join(block_file_name(block_hash, &format!(".{}", self.unique_tag)))
    }

    fn write_block_file(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let block_hash = block.block_index().block_hash();
        let block_path = self.block_path(block_hash);

        if self.storage.is_file(&block_path) {
            // the in-memory state was stale; the bytes are content
            // addressed, so whatever is there is what we would write
            log::debug!("block file {block_path:?} already present, skipping write");
            return Ok(());
        }

        if let Some(parent) = block_path.parent() {
            self.storage.create_dir_all(parent)?;
        }

        let tmp_path = self.temp_block_path(block_hash);
        self.storage.write_file(&tmp_path, &block.to_bytes())?;

        if let Err(err) = self.storage.rename(&tmp_path, &block_path) {
            let _ = self.storage.remove_file(&tmp_path);
            if self.storage.is_file(&block_path) {
                // a concurrent writer won the rename
                log::debug!("block file {block_path:?} appeared concurrently");
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn scan_blocks(&self) -> Result<ContentIndex, StoreError> {
        let chunks_dir = self.content_path.join(CHUNKS_DIR);
        if !self.storage.is_dir(&chunks_dir) {
            return ContentIndex::from_blocks(
                self.options.max_block_size,
                self.options.max_chunks_per_block,
                &[],
            );
        }

        let mut candidates = Vec::new();
        for entry in self.storage.read_dir_recursive(&chunks_dir)? {
            if let Some(cancel) = &self.cancel {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
            }
            let entry = entry?;
            if entry.is_dir {
                continue;
            }
            let name = entry.path.to_string_lossy();
            if !name.ends_with(&self.options.block_extension) {
                continue;
            }
            candidates.push(entry.path);
        }

        let discarded = AtomicU64::new(0);
        let blocks = scatter_gather(
            "block scan",
            self.options.scan_threads,
            candidates,
            self.cancel.as_deref(),
            |rel_path: PathBuf| {
                let file_path = chunks_dir.join(&rel_path);
                let index = match read_block_index(self.storage.as_ref(), &file_path) {
                    Ok(index) => index,
                    Err(err) => {
                        log::warn!("skipping unreadable block file {file_path:?} - {err}");
                        discarded.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                };
                let expected =
                    block_file_name(index.block_hash(), &self.options.block_extension);
                if !rel_path.to_string_lossy().eq_ignore_ascii_case(&expected) {
                    log::warn!(
                        "skipping block file {file_path:?}, name does not match block hash 0x{:016x}",
                        index.block_hash()
                    );
                    discarded.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(index)
            },
        )
        .map_err(StoreError::other)?;

        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
        }

        log::info!(
            "store {:?}: scanned {} blocks, skipped {}",
            self.content_path,
            blocks.len(),
            discarded.load(Ordering::Relaxed)
        );

        ContentIndex::from_blocks(
            self.options.max_block_size,
            self.options.max_chunks_per_block,
            &blocks,
        )
    }

    /// Make sure the in-memory content index exists, reading the persisted
    /// manifest or scanning the block directory.
    fn hydrate_content_index(&self) -> Result<(), StoreError> {
        {
            let state = self.state.lock().unwrap();
            if state.content_index.is_some() {
                return Ok(());
            }
        }

        self.storage.create_dir_all(&self.content_path)?;
        let index_path = self.content_path.join(CONTENT_INDEX_NAME);
        let persisted = {
            let _lock = self
                .storage
                .lock_file(&self.content_path.join(CONTENT_INDEX_LOCK_NAME))?;
            if self.storage.is_file(&index_path) {
                match ContentIndex::read_from_file(self.storage.as_ref(), &index_path) {
                    Ok(index) => Some(index),
                    Err(err) => {
                        log::warn!(
                            "discarding unreadable content index {index_path:?} - {err}"
                        );
                        None
                    }
                }
            } else {
                None
            }
        };

        let hydrated = match persisted {
            Some(index) => index,
            None => self.scan_blocks()?,
        };

        let mut state = self.state.lock().unwrap();
        let merged = match &state.content_index {
            // another thread hydrated while we scanned; keep both
            Some(existing) => existing.merge(&hydrated)?,
            None => hydrated,
        };
        for &block_hash in merged.block_hashes() {
            state
                .block_state
                .entry(block_hash)
                .or_insert(BlockState::Present);
        }
        state.content_index = Some(merged);
        Ok(())
    }

    /// Hydrated index with all pending added blocks folded in; the caller
    /// gets an independent copy.
    fn updated_content_index(&self) -> Result<ContentIndex, StoreError> {
        self.hydrate_content_index()?;

        let mut state = self.state.lock().unwrap();
        if !state.pending_blocks.is_empty() {
            let added = ContentIndex::from_blocks(
                self.options.max_block_size,
                self.options.max_chunks_per_block,
                &state.pending_blocks,
            )?;
            let folded = match &state.content_index {
                Some(current) => current.add(&added)?,
                None => added,
            };
            state.content_index = Some(folded);
            state.pending_blocks.clear();
        }
        match &state.content_index {
            Some(index) => Ok(index.clone()),
            None => Ok(ContentIndex::new_empty(
                0,
                self.options.max_block_size,
                self.options.max_chunks_per_block,
            )),
        }
    }

    fn flush_sync(&self) -> Result<(), StoreError> {
        self.stats.add(StatU64::FlushCount, 1);
        let result = self.flush_index();
        if let Err(err) = &result {
            self.stats.add(StatU64::FlushFailCount, 1);
            log::error!(
                "flushing content index for {:?} failed - {err}",
                self.content_path
            );
        }
        result
    }

    fn flush_index(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        let added = !state.pending_blocks.is_empty();
        if added {
            let pending = ContentIndex::from_blocks(
                self.options.max_block_size,
                self.options.max_chunks_per_block,
                &state.pending_blocks,
            )?;
            let folded = match &state.content_index {
                Some(current) => current.add(&pending)?,
                None => pending,
            };
            state.content_index = Some(folded);
            state.pending_blocks.clear();
        }

        if state.content_index.is_none() {
            return Ok(());
        }

        let index_path = self.content_path.join(CONTENT_INDEX_NAME);
        self.storage.create_dir_all(&self.content_path)?;
        let _lock = self
            .storage
            .lock_file(&self.content_path.join(CONTENT_INDEX_LOCK_NAME))?;
        if added || !self.storage.is_file(&index_path) {
            self.write_content_index(&mut state)?;
        }
        Ok(())
    }

    // caller holds the state mutex and the content index file lock
    fn write_content_index(&self, state: &mut StoreState) -> Result<(), StoreError> {
        let index_path = self.content_path.join(CONTENT_INDEX_NAME);
        let tmp_path = self
            .content_path
            .join(format!("{CONTENT_INDEX_NAME}.{}", self.unique_tag));

        let current = match &state.content_index {
            Some(index) => index,
            None => return Ok(()),
        };

        // fold in whatever a concurrent process persisted since our read;
        // the on-disk side keeps its chunk placement
        let merged = if self.storage.is_file(&index_path) {
            match ContentIndex::read_from_file(self.storage.as_ref(), &index_path) {
                Ok(on_disk) => on_disk.merge(current)?,
                Err(err) => {
                    log::warn!("replacing unreadable content index {index_path:?} - {err}");
                    current.clone()
                }
            }
        } else {
            current.clone()
        };

        let write_result = (|| -> Result<(), StoreError> {
            merged.write_to_file(self.storage.as_ref(), &tmp_path)?;
            if self.storage.is_file(&index_path) {
                self.storage.remove_file(&index_path)?;
            }
            self.storage.rename(&tmp_path, &index_path)?;
            Ok(())
        })();

        if let Err(err) = write_result {
            if self.storage.is_file(&tmp_path) {
                let _ = self.storage.remove_file(&tmp_path);
            }
            return Err(err);
        }

        state.content_index = Some(merged);
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // best effort; failures are logged by flush_sync
        let _ = self.flush_sync();
    }
}

impl BlockStore for FsBlockStore {
    fn put_stored_block<'a>(
        &'a self,
        block: Arc<StoredBlock>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let index = block.block_index();
            let block_hash = index.block_hash();
            inner.stats.add(StatU64::PutCount, 1);
            inner
                .stats
                .add(StatU64::PutChunkCount, index.chunk_count() as u64);
            inner
                .stats
                .add(StatU64::PutByteCount, block.encoded_size() as u64);

            {
                let mut state = inner.state.lock().unwrap();
                if state.block_state.contains_key(&block_hash) {
                    // writer-wins: someone already stores (or is storing)
                    // this exact content
                    log::debug!("block 0x{block_hash:016x} already known, skipping");
                    return Ok(());
                }
                state.block_state.insert(block_hash, BlockState::Writing);
            }

            let write_result = {
                let inner = Arc::clone(&inner);
                let block = Arc::clone(&block);
                match tokio::task::spawn_blocking(move || inner.write_block_file(&block)).await
                {
                    Ok(result) => result,
                    Err(err) => Err(StoreError::other(err)),
                }
            };

            match write_result {
                Ok(()) => {
                    let mut state = inner.state.lock().unwrap();
                    state.pending_blocks.push(block.block_index().clone());
                    state.block_state.insert(block_hash, BlockState::Present);
                    Ok(())
                }
                Err(err) => {
                    inner.state.lock().unwrap().block_state.remove(&block_hash);
                    inner.stats.add(StatU64::PutFailCount, 1);
                    log::warn!("storing block 0x{block_hash:016x} failed - {err}");
                    Err(err)
                }
            }
        })
    }

    fn get_stored_block<'a>(
        &'a self,
        block_hash: BlockHash,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<StoredBlock>, StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.stats.add(StatU64::GetCount, 1);

            enum Probe {
                Ready,
                Busy,
                Absent,
            }

            let block_path = inner.block_path(block_hash);
            loop {
                let probe = {
                    let mut state = inner.state.lock().unwrap();
                    match state.block_state.get(&block_hash) {
                        Some(BlockState::Present) => Probe::Ready,
                        Some(BlockState::Writing) => Probe::Busy,
                        None => {
                            if inner.storage.is_file(&block_path) {
                                state.block_state.insert(block_hash, BlockState::Present);
                                Probe::Ready
                            } else {
                                Probe::Absent
                            }
                        }
                    }
                };
                match probe {
                    Probe::Ready => break,
                    Probe::Absent => return Err(StoreError::NotFound),
                    // a concurrent put owns this hash; wait it out
                    Probe::Busy => tokio::time::sleep(WRITE_RACE_BACKOFF).await,
                }
            }

            let read_result = {
                let inner = Arc::clone(&inner);
                match tokio::task::spawn_blocking(move || {
                    let data = inner.storage.read_file(&inner.block_path(block_hash))?;
                    StoredBlock::from_bytes(&data)
                })
                .await
                {
                    Ok(result) => result,
                    Err(err) => Err(StoreError::other(err)),
                }
            };

            match read_result {
                Ok(block) => {
                    inner
                        .stats
                        .add(StatU64::GetChunkCount, block.block_index().chunk_count() as u64);
                    inner
                        .stats
                        .add(StatU64::GetByteCount, block.encoded_size() as u64);
                    Ok(Arc::new(block))
                }
                Err(err) => {
                    inner.stats.add(StatU64::GetFailCount, 1);
                    log::warn!("reading block 0x{block_hash:016x} failed - {err}");
                    Err(err)
                }
            }
        })
    }

    fn preflight_get(&self, _requested: &ContentIndex) -> Result<(), StoreError> {
        // nothing to warm up; block files are read on demand
        self.inner.stats.add(StatU64::PreflightCount, 1);
        Ok(())
    }

    fn retarget_content<'a>(
        &'a self,
        requested: &'a ContentIndex,
    ) -> Pin<Box<dyn Future<Output = Result<ContentIndex, StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.stats.add(StatU64::RetargetCount, 1);

            let store_index = {
                let inner = Arc::clone(&inner);
                match tokio::task::spawn_blocking(move || inner.updated_content_index()).await {
                    Ok(result) => result,
                    Err(err) => Err(StoreError::other(err)),
                }
            };

            let retargeted = store_index.and_then(|index| index.retarget(requested));
            if retargeted.is_err() {
                inner.stats.add(StatU64::RetargetFailCount, 1);
            }
            retargeted
        })
    }

    fn stats(&self) -> BlockStoreStats {
        self.inner.stats.add(StatU64::GetStatsCount, 1);
        self.inner.stats.snapshot()
    }

    fn flush<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || inner.flush_sync()).await {
                Ok(result) => result,
                Err(err) => Err(StoreError::other(err)),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_file_name() {
        assert_eq!(
            block_file_name(0xABCDEF0123456789, ".lrb"),
            "abcd/0xabcdef0123456789.lrb"
        );
        assert_eq!(block_file_name(0x1, ".lrb"), "0000/0x0000000000000001.lrb");
    }

    #[test]
    fn test_unique_store_tag() {
        let a = unique_store_tag();
        let b = unique_store_tag();
        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_validates_options() {
        let storage = Arc::new(shale_tools::MemStorage::new());
        let mut options = FsBlockStoreOptions::default();
        options.max_block_size = 0;
        assert!(matches!(
            FsBlockStore::open(storage.clone(), "store", options),
            Err(StoreError::InvalidArgument(_))
        ));

        let mut options = FsBlockStoreOptions::default();
        options.block_extension = "lrb".to_string();
        assert!(matches!(
            FsBlockStore::open(storage, "store", options),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
