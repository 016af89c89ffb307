//! Platform layer for the shale content delivery engine.
//!
//! Everything in here is deliberately ignorant of blocks, chunks and
//! content indexes. The block storage core consumes these capabilities
//! through the [`StorageProvider`](storage::StorageProvider) and
//! [`CancelToken`](cancel::CancelToken) interfaces plus the
//! [`scatter_gather`](scatter::scatter_gather) batch helper only, so hosts
//! can swap implementations (on-disk, in-memory, instrumented test
//! doubles) without touching the core.

pub mod cancel;
pub mod fs_storage;
pub mod mem_storage;
pub mod scatter;
pub mod storage;

pub use cancel::{CancelToken, NeverCancelled};
pub use fs_storage::FsStorage;
pub use mem_storage::MemStorage;
pub use scatter::scatter_gather;
pub use storage::{DirEntry, FileLockGuard, StorageProvider, StorageReader, StorageWriter};
