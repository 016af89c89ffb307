//! Two-tier block store composition.
//!
//! Reads hit the fast *local* store first and fall back to the slow
//! *remote* store, populating the local store on the way back. Writes fan
//! out to both tiers: the remote tier is authoritative for durability, the
//! local tier is a best-effort cache whose failures are logged, never
//! surfaced.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::block_store::{BlockStore, BlockStoreStats, StatCounters, StatU64, StoreError};
use crate::content_index::ContentIndex;
use crate::stored_block::StoredBlock;
use crate::BlockHash;

struct CacheInner {
    local: Arc<dyn BlockStore>,
    remote: Arc<dyn BlockStore>,
    pending_request_count: AtomicU32,
    flush_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    stats: StatCounters,
}

/// Tracks one in-flight request; completing the last one releases all
/// queued flush waiters.
struct RequestGuard {
    inner: Arc<CacheInner>,
}

impl CacheInner {
    fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.pending_request_count.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            inner: Arc::clone(self),
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.inner.pending_request_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let waiters = std::mem::take(&mut *self.inner.flush_waiters.lock().unwrap());
            // completions fire outside the lock
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

/// Composition of a local cache tier over an authoritative remote tier.
#[derive(Clone)]
pub struct CacheBlockStore {
    inner: Arc<CacheInner>,
}

impl CacheBlockStore {
    pub fn new(local: Arc<dyn BlockStore>, remote: Arc<dyn BlockStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                local,
                remote,
                pending_request_count: AtomicU32::new(0),
                flush_waiters: Mutex::new(Vec::new()),
                stats: StatCounters::default(),
            }),
        }
    }
}

async fn preflight_pipeline(
    inner: &Arc<CacheInner>,
    requested: &ContentIndex,
) -> Result<(), StoreError> {
    let local_retargeted = inner.local.retarget_content(requested).await?;
    inner.local.preflight_get(&local_retargeted)?;
    let missing = requested.missing_in(&local_retargeted)?;
    inner.remote.preflight_get(&missing)?;
    Ok(())
}

impl BlockStore for CacheBlockStore {
    /// Stores to both tiers; resolves once both are done with the remote
    /// tier's outcome.
    fn put_stored_block<'a>(
        &'a self,
        block: Arc<StoredBlock>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let index = block.block_index();
            inner.stats.add(StatU64::PutCount, 1);
            inner
                .stats
                .add(StatU64::PutChunkCount, index.chunk_count() as u64);
            inner
                .stats
                .add(StatU64::PutByteCount, block.encoded_size() as u64);

            // both tiers run regardless of what the caller does with this
            // future; the guards keep flush() honest about them
            let remote_task = {
                let guard = inner.begin_request();
                let remote = Arc::clone(&inner.remote);
                let block = Arc::clone(&block);
                tokio::spawn(async move {
                    let result = remote.put_stored_block(block).await;
                    drop(guard);
                    result
                })
            };
            let local_task = {
                let guard = inner.begin_request();
                let local = Arc::clone(&inner.local);
                let block = Arc::clone(&block);
                let block_hash = index.block_hash();
                tokio::spawn(async move {
                    if let Err(err) = local.put_stored_block(block).await {
                        log::warn!(
                            "failed to cache block 0x{block_hash:016x} locally - {err}"
                        );
                    }
                    drop(guard);
                })
            };

            let (remote_result, _) = futures::future::join(remote_task, local_task).await;
            let remote_result = match remote_result {
                Ok(result) => result,
                Err(err) => Err(StoreError::other(err)),
            };

            if remote_result.is_err() {
                inner.stats.add(StatU64::PutFailCount, 1);
            }
            remote_result
        })
    }

    fn get_stored_block<'a>(
        &'a self,
        block_hash: BlockHash,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<StoredBlock>, StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.stats.add(StatU64::GetCount, 1);
            let _request = inner.begin_request();

            let local_result = inner.local.get_stored_block(block_hash).await;
            let block = match local_result {
                Ok(block) => block,
                Err(StoreError::NotFound) | Err(StoreError::AccessDenied(_)) => {
                    match inner.remote.get_stored_block(block_hash).await {
                        Ok(block) => {
                            // hand the same bytes to the caller and to the
                            // local tier; Arc keeps both owners honest
                            let guard = inner.begin_request();
                            let local = Arc::clone(&inner.local);
                            let writeback = Arc::clone(&block);
                            tokio::spawn(async move {
                                if let Err(err) =
                                    local.put_stored_block(writeback).await
                                {
                                    log::warn!(
                                        "failed to populate local store with block 0x{block_hash:016x} - {err}"
                                    );
                                }
                                drop(guard);
                            });
                            block
                        }
                        Err(err) => {
                            inner.stats.add(StatU64::GetFailCount, 1);
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    inner.stats.add(StatU64::GetFailCount, 1);
                    return Err(err);
                }
            };

            inner
                .stats
                .add(StatU64::GetChunkCount, block.block_index().chunk_count() as u64);
            inner
                .stats
                .add(StatU64::GetByteCount, block.encoded_size() as u64);
            Ok(block)
        })
    }

    /// Forwards the hint to both tiers in the background.
    fn preflight_get(&self, requested: &ContentIndex) -> Result<(), StoreError> {
        self.inner.stats.add(StatU64::PreflightCount, 1);
        let inner = Arc::clone(&self.inner);
        let requested = requested.clone();
        let guard = inner.begin_request();
        tokio::spawn(async move {
            if let Err(err) = preflight_pipeline(&inner, &requested).await {
                inner.stats.add(StatU64::PreflightFailCount, 1);
                log::warn!("preflight forwarding failed - {err}");
            }
            drop(guard);
        });
        Ok(())
    }

    /// Two-step pipeline: whatever the local tier cannot serve is
    /// retargeted against the remote tier and both views are combined.
    fn retarget_content<'a>(
        &'a self,
        requested: &'a ContentIndex,
    ) -> Pin<Box<dyn Future<Output = Result<ContentIndex, StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.stats.add(StatU64::RetargetCount, 1);
            let _request = inner.begin_request();

            let result = async {
                let local_retargeted = inner.local.retarget_content(requested).await?;
                let local_missing = requested.missing_in(&local_retargeted)?;
                if local_missing.block_count() == 0 {
                    return Ok(local_retargeted);
                }
                let remote_retargeted =
                    inner.remote.retarget_content(&local_missing).await?;
                local_retargeted.add(&remote_retargeted)
            }
            .await;

            if result.is_err() {
                inner.stats.add(StatU64::RetargetFailCount, 1);
            }
            result
        })
    }

    fn stats(&self) -> BlockStoreStats {
        self.inner.stats.add(StatU64::GetStatsCount, 1);
        self.inner.stats.snapshot()
    }

    /// Resolves once every request accepted before this call has fully
    /// completed, including local write-backs.
    fn flush<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.stats.add(StatU64::FlushCount, 1);
            let waiter = {
                let mut waiters = inner.flush_waiters.lock().unwrap();
                if inner.pending_request_count.load(Ordering::Acquire) == 0 {
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
            };
            if let Some(rx) = waiter {
                let _ = rx.await;
            }
            Ok(())
        })
    }
}
