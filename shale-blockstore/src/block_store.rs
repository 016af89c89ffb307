//! The asynchronous block store contract.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::content_index::ContentIndex;
use crate::stored_block::StoredBlock;
use crate::BlockHash;

/// Errors produced by the block storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("storage error: {0}")]
    Io(#[source] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("hash identifier mismatch ({0:#010x} != {1:#010x})")]
    HashIdentifierMismatch(u32, u32),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound,
            ErrorKind::AlreadyExists => StoreError::AlreadyExists,
            ErrorKind::PermissionDenied => StoreError::AccessDenied(err.to_string()),
            ErrorKind::OutOfMemory => StoreError::OutOfMemory,
            _ => StoreError::Io(err),
        }
    }
}

impl StoreError {
    pub(crate) fn other(err: impl std::fmt::Display) -> Self {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        ))
    }
}

/// Ids of the per-store counters.
///
/// The `Retry` counters exist for stores that re-issue failed requests
/// (e.g. network backed tiers) and stay zero here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum StatU64 {
    GetCount,
    GetFailCount,
    GetRetryCount,
    GetChunkCount,
    GetByteCount,
    PutCount,
    PutFailCount,
    PutRetryCount,
    PutChunkCount,
    PutByteCount,
    RetargetCount,
    RetargetFailCount,
    RetargetRetryCount,
    PreflightCount,
    PreflightFailCount,
    PreflightRetryCount,
    FlushCount,
    FlushFailCount,
    GetStatsCount,
}

const STAT_U64_COUNT: usize = StatU64::GetStatsCount as usize + 1;

/// Monotonically increasing per-store counters, updated with atomic adds.
#[derive(Default)]
pub(crate) struct StatCounters {
    counters: [AtomicU64; STAT_U64_COUNT],
}

impl StatCounters {
    pub fn add(&self, stat: StatU64, value: u64) {
        self.counters[stat as usize].fetch_add(value, Ordering::Relaxed);
    }

    /// Eventually consistent snapshot.
    pub fn snapshot(&self) -> BlockStoreStats {
        let mut counters = [0u64; STAT_U64_COUNT];
        for (slot, counter) in counters.iter_mut().zip(self.counters.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        BlockStoreStats { counters }
    }
}

/// Counter snapshot returned by [`BlockStore::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    counters: [u64; STAT_U64_COUNT],
}

impl BlockStoreStats {
    pub fn get(&self, stat: StatU64) -> u64 {
        self.counters[stat as usize]
    }
}

/// The uniform asynchronous block store contract.
///
/// All operations return quickly; awaiting the returned future delivers the
/// outcome of the long-running work, exactly once. An error returned by an
/// immediately-ready future means no work was dispatched.
pub trait BlockStore: Send + Sync {
    /// Durably place a block, deduplicating against already stored ones.
    fn put_stored_block<'a>(
        &'a self,
        block: Arc<StoredBlock>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Fetch a block by hash. The returned block is shared with the store's
    /// own machinery (e.g. a cache tier writing it back), never mutated.
    fn get_stored_block<'a>(
        &'a self,
        block_hash: BlockHash,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<StoredBlock>, StoreError>> + Send + 'a>>;

    /// Hint that the blocks covering `requested` will soon be fetched.
    ///
    /// Synchronous ack; any prefetching happens in the background.
    fn preflight_get(&self, requested: &ContentIndex) -> Result<(), StoreError>;

    /// Rewrite `requested` in terms of the blocks known to this store.
    fn retarget_content<'a>(
        &'a self,
        requested: &'a ContentIndex,
    ) -> Pin<Box<dyn Future<Output = Result<ContentIndex, StoreError>> + Send + 'a>>;

    /// Counter snapshot.
    fn stats(&self) -> BlockStoreStats;

    /// Resolves once all previously accepted work has completed.
    fn flush<'a>(&'a self)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}
