//! This crate implements the block storage layer of the shale content
//! delivery engine.
//!
//! # Data formats
//!
//! Shale splits file-tree versions into variable sized chunks and packs
//! chunks into immutable *blocks*, stored deduplicated using a content
//! addressable format. A block is identified by a 64 bit content hash
//! computed by the producer; the hash doubles as the on-disk file name.
//!
//! Every block starts with a [`BlockIndex`]: the block hash, the hash
//! family identifier, an opaque tag (usually a compression identifier) and
//! the hash and size of every chunk in the block, immediately followed by
//! the raw chunk payload.
//!
//! A [`ContentIndex`] is the manifest of a store (or a view of one): the
//! list of known blocks plus a mapping from every chunk hash to the block
//! holding it. Manifests are immutable values; all algebra on them
//! (concatenation, deduplicating merge, retargeting a requested chunk set
//! onto a store's blocks) returns freshly built indexes.
//!
//! # Stores
//!
//! A [`BlockStore`] is the uniform asynchronous contract for putting,
//! getting, preflighting, retargeting, flushing and observing blocks.
//! [`FsBlockStore`] persists blocks through a
//! [`StorageProvider`](shale_tools::StorageProvider) and maintains the
//! store manifest on disk (`store.lci`), rebuilding it by scanning the
//! block directory when it is missing. [`CacheBlockStore`] composes a fast
//! local store with an authoritative remote store: reads fall back to the
//! remote tier and populate the local tier, writes fan out to both.
//!
//! # Locking
//!
//! It is valid to have multiple writers on one store, even for the same
//! block: block files are written to a uniquely named temp file and renamed
//! into place, so concurrent writers of the same hash produce the same
//! file and the first rename wins. Within one process an in-memory block
//! state map additionally deduplicates the work. Manifest writes are
//! serialized across processes by an advisory lock on `store.lci.sync`;
//! readers go without the lock because the rename makes updates observably
//! atomic.

pub mod block_index;
pub mod block_store;
pub mod cache_block_store;
mod codec;
pub mod content_index;
pub mod fs_block_store;
pub mod stored_block;
pub mod version;

/// Identifier of a packed block, computed over its payload.
pub type BlockHash = u64;

/// Identifier of a single content chunk.
pub type ChunkHash = u64;

/// Tag identifying the hash family that produced a set of hashes.
///
/// Indexes are only combinable when their identifiers match.
pub type HashIdentifier = u32;

pub use block_index::BlockIndex;
pub use block_store::{BlockStore, BlockStoreStats, StatU64, StoreError};
pub use cache_block_store::CacheBlockStore;
pub use content_index::ContentIndex;
pub use fs_block_store::{FsBlockStore, FsBlockStoreOptions};
pub use stored_block::StoredBlock;
pub use version::VersionContent;
