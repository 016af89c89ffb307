use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shale_blockstore::{
    BlockIndex, BlockStore, ContentIndex, FsBlockStore, FsBlockStoreOptions, StatU64,
    StoredBlock, StoreError,
};
use shale_tools::storage::{DirEntry, FileLockGuard, StorageProvider, StorageReader, StorageWriter};
use shale_tools::{FsStorage, MemStorage};

fn test_options() -> FsBlockStoreOptions {
    FsBlockStoreOptions {
        max_block_size: 65536,
        max_chunks_per_block: 1024,
        ..Default::default()
    }
}

fn build_block(block_hash: u64, hash_identifier: u32, chunks: &[(u64, &[u8])]) -> Arc<StoredBlock> {
    let chunk_hashes = chunks.iter().map(|(hash, _)| *hash).collect();
    let chunk_sizes = chunks.iter().map(|(_, data)| data.len() as u32).collect();
    let index = BlockIndex::new(block_hash, hash_identifier, 0, chunk_hashes, chunk_sizes).unwrap();
    let mut payload = Vec::new();
    for (_, data) in chunks {
        payload.extend_from_slice(data);
    }
    Arc::new(StoredBlock::new(index, payload).unwrap())
}

fn request_all(store_index_blocks: &[&StoredBlock]) -> ContentIndex {
    let indexes: Vec<BlockIndex> = store_index_blocks
        .iter()
        .map(|block| block.block_index().clone())
        .collect();
    ContentIndex::from_blocks(65536, 1024, &indexes).unwrap()
}

#[tokio::test]
async fn test_fs_store_put_get_roundtrip() {
    let root = Path::new(".testdir-fs-store-roundtrip");
    if let Err(_e) = std::fs::remove_dir_all(root) { /* ignore */ }

    let storage: Arc<dyn StorageProvider> = Arc::new(FsStorage::new());
    let store = FsBlockStore::open(storage, root, test_options()).unwrap();

    let block = build_block(0xABCDEF0123456789, 0xbeef, &[(0xc1, b"abcdefg")]);
    store.put_stored_block(Arc::clone(&block)).await.unwrap();

    let fetched = store.get_stored_block(0xABCDEF0123456789).await.unwrap();
    assert_eq!(fetched.to_bytes(), block.to_bytes());
    assert_eq!(fetched.chunk_data(0).unwrap(), b"abcdefg");

    // content addressed layout: top 16 hash bits as fan-out directory
    assert!(root
        .join("chunks/abcd/0xabcdef0123456789.lrb")
        .is_file());

    assert!(matches!(
        store.get_stored_block(0x0000000000000042).await,
        Err(StoreError::NotFound)
    ));

    let stats = store.stats();
    assert_eq!(stats.get(StatU64::PutCount), 1);
    assert_eq!(stats.get(StatU64::PutChunkCount), 1);
    assert_eq!(stats.get(StatU64::GetCount), 2);
    assert_eq!(stats.get(StatU64::GetFailCount), 0);
    assert_eq!(stats.get(StatU64::PutFailCount), 0);

    if let Err(_e) = std::fs::remove_dir_all(root) { /* ignore */ }
}

/// Counts file creations to observe how often a store actually writes.
struct CountingStorage {
    inner: MemStorage,
    writes: AtomicU64,
}

impl CountingStorage {
    fn new() -> Self {
        Self {
            inner: MemStorage::new(),
            writes: AtomicU64::new(0),
        }
    }
}

impl StorageProvider for CountingStorage {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StorageReader>> {
        self.inner.open_read(path)
    }
    fn open_write(&self, path: &Path, initial_size: u64) -> io::Result<Box<dyn StorageWriter>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.open_write(path, initial_size)
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn is_file(&self, path: &Path) -> bool {
        self.inner.is_file(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path)
    }
    fn get_permissions(&self, path: &Path) -> io::Result<u16> {
        self.inner.get_permissions(path)
    }
    fn set_permissions(&self, path: &Path, permissions: u16) -> io::Result<()> {
        self.inner.set_permissions(path, permissions)
    }
    fn read_dir_recursive(
        &self,
        root: &Path,
    ) -> io::Result<Box<dyn Iterator<Item = io::Result<DirEntry>> + Send>> {
        self.inner.read_dir_recursive(root)
    }
    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLockGuard>> {
        self.inner.lock_file(path)
    }
}

#[tokio::test]
async fn test_concurrent_puts_write_once() {
    let storage = Arc::new(CountingStorage::new());
    let store =
        FsBlockStore::open(Arc::clone(&storage) as Arc<dyn StorageProvider>, "store", test_options())
            .unwrap();

    let block = build_block(0x1234, 0xbeef, &[(0xc1, b"payload"), (0xc2, b"more")]);

    let mut puts = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let block = Arc::clone(&block);
        puts.push(tokio::spawn(async move {
            store.put_stored_block(block).await
        }));
    }
    for put in puts {
        put.await.unwrap().unwrap();
    }

    // one block file write; every other put deduplicated against the state map
    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().get(StatU64::PutCount), 8);
    assert_eq!(store.stats().get(StatU64::PutFailCount), 0);
}

#[tokio::test]
async fn test_scan_reconstructs_index() {
    let storage: Arc<dyn StorageProvider> = Arc::new(MemStorage::new());

    let blocks = [
        build_block(0x1111111111111111, 0xbeef, &[(0xa1, b"one"), (0xa2, b"two")]),
        build_block(0x2222222222222222, 0xbeef, &[(0xb1, b"three")]),
        build_block(0x3333333333333333, 0xbeef, &[(0xd1, b"four"), (0xd2, b"five")]),
    ];

    let requested = request_all(&[&blocks[0], &blocks[1], &blocks[2]]);

    let expected = {
        let store =
            FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
        for block in &blocks {
            store.put_stored_block(Arc::clone(block)).await.unwrap();
        }
        let retargeted = store.retarget_content(&requested).await.unwrap();
        store.flush().await.unwrap();
        retargeted
    };
    assert_eq!(expected.block_count(), 3);
    assert_eq!(expected.chunk_count(), 5);

    // the flushed manifest is picked up by a fresh store
    assert!(storage.is_file(Path::new("store/store.lci")));
    let reloaded = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
    let retargeted = reloaded.retarget_content(&requested).await.unwrap();
    assert_eq!(retargeted.block_count(), 3);
    drop(reloaded);

    // with the manifest gone the block directory scan rebuilds the same view
    storage.remove_file(Path::new("store/store.lci")).unwrap();
    let rebuilt = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
    let retargeted = rebuilt.retarget_content(&requested).await.unwrap();
    assert_eq!(retargeted.block_count(), 3);
    assert_eq!(retargeted.chunk_count(), 5);
    for block in &blocks {
        let hash = block.block_index().block_hash();
        assert!(retargeted.block_hashes().contains(&hash));
    }
    for (chunk, expected_block) in [
        (0xa1u64, 0x1111111111111111u64),
        (0xb1, 0x2222222222222222),
        (0xd2, 0x3333333333333333),
    ] {
        assert_eq!(retargeted.block_for_chunk(chunk), Some(expected_block));
    }
}

#[tokio::test]
async fn test_scan_skips_misnamed_block_file() {
    let storage: Arc<dyn StorageProvider> = Arc::new(MemStorage::new());

    let good = build_block(0x1010101010101010, 0xbeef, &[(0xa1, b"good")]);
    let evil = build_block(0xBEEFBEEFBEEFBEEF, 0xbeef, &[(0xa2, b"evil")]);

    {
        let store =
            FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
        store.put_stored_block(Arc::clone(&good)).await.unwrap();
    }

    // a block whose file name does not match its content hash
    storage.create_dir_all(Path::new("store/chunks/0000")).unwrap();
    storage
        .write_file(
            Path::new("store/chunks/0000/0x00000000deadbeef.lrb"),
            &evil.to_bytes(),
        )
        .unwrap();
    // and a file that is not a block at all
    storage
        .write_file(Path::new("store/chunks/0000/0x0000000000000000.lrb"), b"junk")
        .unwrap();
    storage.remove_file(Path::new("store/store.lci")).unwrap();

    let store = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
    let requested = request_all(&[&good, &evil]);
    let retargeted = store.retarget_content(&requested).await.unwrap();

    assert_eq!(retargeted.block_count(), 1);
    assert_eq!(retargeted.block_hashes(), &[0x1010101010101010]);
}

#[tokio::test]
async fn test_cancelled_scan_aborts_hydration() {
    use std::sync::atomic::AtomicBool;

    let storage: Arc<dyn StorageProvider> = Arc::new(MemStorage::new());
    let block = build_block(0x1111111111111111, 0xbeef, &[(0xa1, b"one")]);
    {
        let store =
            FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
        store.put_stored_block(Arc::clone(&block)).await.unwrap();
    }
    storage.remove_file(Path::new("store/store.lci")).unwrap();

    let cancel = Arc::new(AtomicBool::new(true));
    let store = FsBlockStore::open_with_cancel(
        Arc::clone(&storage),
        "store",
        test_options(),
        Some(cancel),
    )
    .unwrap();

    let requested = request_all(&[&block]);
    assert!(matches!(
        store.retarget_content(&requested).await,
        Err(StoreError::Cancelled)
    ));
}

#[tokio::test]
async fn test_flush_merges_concurrent_manifest() {
    let storage: Arc<dyn StorageProvider> = Arc::new(MemStorage::new());

    let first = build_block(0x0101010101010101, 0xbeef, &[(0xa1, b"first")]);
    let second = build_block(0x0202020202020202, 0xbeef, &[(0xa2, b"second")]);

    let store_a = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
    let store_b = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();

    store_a.put_stored_block(Arc::clone(&first)).await.unwrap();
    store_b.put_stored_block(Arc::clone(&second)).await.unwrap();

    store_a.flush().await.unwrap();
    store_b.flush().await.unwrap();

    // the second flush folded the first store's manifest in instead of
    // clobbering it
    let manifest =
        ContentIndex::read_from_file(storage.as_ref(), Path::new("store/store.lci")).unwrap();
    assert!(manifest.block_hashes().contains(&0x0101010101010101));
    assert!(manifest.block_hashes().contains(&0x0202020202020202));
    assert_eq!(manifest.block_for_chunk(0xa1), Some(0x0101010101010101));
    assert_eq!(manifest.block_for_chunk(0xa2), Some(0x0202020202020202));
}

#[tokio::test]
async fn test_put_existing_block_file_is_dedup() {
    let storage: Arc<dyn StorageProvider> = Arc::new(MemStorage::new());
    let block = build_block(0x4242424242424242, 0xbeef, &[(0xa1, b"data")]);

    {
        let store =
            FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
        store.put_stored_block(Arc::clone(&block)).await.unwrap();
    }

    // fresh store instance, stale in-memory state, file already on disk
    let store = FsBlockStore::open(Arc::clone(&storage), "store", test_options()).unwrap();
    store.put_stored_block(Arc::clone(&block)).await.unwrap();

    let fetched = store.get_stored_block(0x4242424242424242).await.unwrap();
    assert_eq!(fetched.to_bytes(), block.to_bytes());
}
