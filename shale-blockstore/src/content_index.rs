//! The store manifest: which chunks live in which blocks.
//!
//! All operations on content indexes are pure - inputs are read only and
//! results are freshly built. That keeps the concurrency story of the
//! stores trivial: a handed-out index can never change under its consumer.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use endian_trait::Endian;

use shale_tools::storage::StorageProvider;

use crate::block_index::BlockIndex;
use crate::block_store::StoreError;
use crate::codec;
use crate::{BlockHash, ChunkHash, HashIdentifier};

/// Current serialization version.
pub const CONTENT_INDEX_VERSION: u32 = 1;

/// On-disk content index header
///
/// (VERSION || HASH_IDENTIFIER || MAX_BLOCK_SIZE || MAX_CHUNKS_PER_BLOCK ||
/// BLOCK_COUNT || CHUNK_COUNT), little endian, followed by `block_count`
/// u64 block hashes, `chunk_count` u64 chunk hashes and `chunk_count` u64
/// chunk-to-block indexes.
#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
struct ContentIndexHeader {
    version: u32,
    hash_identifier: u32,
    max_block_size: u32,
    max_chunks_per_block: u32,
    block_count: u64,
    chunk_count: u64,
}

const CONTENT_INDEX_HEADER_SIZE: usize = std::mem::size_of::<ContentIndexHeader>();

/// Manifest mapping chunk hashes to the blocks holding them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentIndex {
    hash_identifier: HashIdentifier,
    max_block_size: u32,
    max_chunks_per_block: u32,
    block_hashes: Vec<BlockHash>,
    chunk_hashes: Vec<ChunkHash>,
    chunk_block_indexes: Vec<u64>,
}

impl ContentIndex {
    /// A well-formed index with no blocks and no chunks.
    pub fn new_empty(
        hash_identifier: HashIdentifier,
        max_block_size: u32,
        max_chunks_per_block: u32,
    ) -> Self {
        Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes: Vec::new(),
            chunk_hashes: Vec::new(),
            chunk_block_indexes: Vec::new(),
        }
    }

    /// Derive the chunk-to-block mapping from a list of block indexes.
    ///
    /// The first block carrying a chunk wins; later duplicates of the same
    /// chunk hash are not mapped again.
    pub fn from_blocks(
        max_block_size: u32,
        max_chunks_per_block: u32,
        blocks: &[BlockIndex],
    ) -> Result<Self, StoreError> {
        let hash_identifier = blocks
            .first()
            .map(|block| block.hash_identifier())
            .unwrap_or(0);

        let mut block_hashes = Vec::with_capacity(blocks.len());
        let mut chunk_hashes = Vec::new();
        let mut chunk_block_indexes = Vec::new();
        let mut seen_chunks = HashSet::new();

        for (block_index, block) in blocks.iter().enumerate() {
            if block.hash_identifier() != hash_identifier {
                return Err(StoreError::HashIdentifierMismatch(
                    hash_identifier,
                    block.hash_identifier(),
                ));
            }
            block_hashes.push(block.block_hash());
            for &chunk_hash in block.chunk_hashes() {
                if seen_chunks.insert(chunk_hash) {
                    chunk_hashes.push(chunk_hash);
                    chunk_block_indexes.push(block_index as u64);
                }
            }
        }

        Ok(Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes,
            chunk_hashes,
            chunk_block_indexes,
        })
    }

    pub fn hash_identifier(&self) -> HashIdentifier {
        self.hash_identifier
    }

    pub fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    pub fn max_chunks_per_block(&self) -> u32 {
        self.max_chunks_per_block
    }

    pub fn block_count(&self) -> u64 {
        self.block_hashes.len() as u64
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_hashes.len() as u64
    }

    pub fn block_hashes(&self) -> &[BlockHash] {
        &self.block_hashes
    }

    pub fn chunk_hashes(&self) -> &[ChunkHash] {
        &self.chunk_hashes
    }

    pub fn chunk_block_indexes(&self) -> &[u64] {
        &self.chunk_block_indexes
    }

    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty() && self.chunk_hashes.is_empty()
    }

    /// Block hash holding `chunk_hash`, if known.
    pub fn block_for_chunk(&self, chunk_hash: ChunkHash) -> Option<BlockHash> {
        self.chunk_hashes
            .iter()
            .position(|&hash| hash == chunk_hash)
            .map(|i| self.block_hashes[self.chunk_block_indexes[i] as usize])
    }

    fn chunk_lookup(&self) -> HashMap<ChunkHash, u64> {
        let mut lookup = HashMap::with_capacity(self.chunk_hashes.len());
        for (i, &chunk_hash) in self.chunk_hashes.iter().enumerate() {
            lookup
                .entry(chunk_hash)
                .or_insert(self.chunk_block_indexes[i]);
        }
        lookup
    }

    /// Chunk positions grouped per block.
    fn chunks_per_block(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.block_hashes.len()];
        for (i, &block_index) in self.chunk_block_indexes.iter().enumerate() {
            groups[block_index as usize].push(i);
        }
        groups
    }

    fn check_combinable(&self, other: &Self) -> Result<(), StoreError> {
        if !self.is_empty() && !other.is_empty() && self.hash_identifier != other.hash_identifier {
            return Err(StoreError::HashIdentifierMismatch(
                self.hash_identifier,
                other.hash_identifier,
            ));
        }
        Ok(())
    }

    // identity parameters come from self unless self is the empty index
    fn combined_params(&self, other: &Self) -> (HashIdentifier, u32, u32) {
        if self.is_empty() && !other.is_empty() {
            (
                other.hash_identifier,
                other.max_block_size,
                other.max_chunks_per_block,
            )
        } else {
            (
                self.hash_identifier,
                self.max_block_size,
                self.max_chunks_per_block,
            )
        }
    }

    /// Plain concatenation; no deduplication.
    pub fn add(&self, other: &Self) -> Result<Self, StoreError> {
        self.check_combinable(other)?;
        let (hash_identifier, max_block_size, max_chunks_per_block) =
            self.combined_params(other);

        let mut block_hashes = self.block_hashes.clone();
        block_hashes.extend_from_slice(&other.block_hashes);
        let mut chunk_hashes = self.chunk_hashes.clone();
        chunk_hashes.extend_from_slice(&other.chunk_hashes);

        let shift = self.block_hashes.len() as u64;
        let mut chunk_block_indexes = self.chunk_block_indexes.clone();
        chunk_block_indexes.extend(other.chunk_block_indexes.iter().map(|index| index + shift));

        Ok(Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes,
            chunk_hashes,
            chunk_block_indexes,
        })
    }

    /// Deduplicating union; `self` wins.
    ///
    /// Chunks already present keep their block assignment. A block of
    /// `other` is copied (whole) exactly when it contributes at least one
    /// chunk that is not yet covered.
    pub fn merge(&self, other: &Self) -> Result<Self, StoreError> {
        self.check_combinable(other)?;
        let (hash_identifier, max_block_size, max_chunks_per_block) =
            self.combined_params(other);

        let mut block_hashes = self.block_hashes.clone();
        let mut chunk_hashes = self.chunk_hashes.clone();
        let mut chunk_block_indexes = self.chunk_block_indexes.clone();
        let mut covered: HashSet<ChunkHash> = chunk_hashes.iter().copied().collect();

        for (other_block, group) in other.chunks_per_block().into_iter().enumerate() {
            let fresh: Vec<usize> = group
                .into_iter()
                .filter(|&i| !covered.contains(&other.chunk_hashes[i]))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            let merged_block = block_hashes.len() as u64;
            block_hashes.push(other.block_hashes[other_block]);
            for i in fresh {
                let chunk_hash = other.chunk_hashes[i];
                covered.insert(chunk_hash);
                chunk_hashes.push(chunk_hash);
                chunk_block_indexes.push(merged_block);
            }
        }

        Ok(Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes,
            chunk_hashes,
            chunk_block_indexes,
        })
    }

    /// The sub-index of `self` whose blocks are not fully covered by
    /// `reference`.
    ///
    /// A block is kept (whole, with all its chunk entries) when at least
    /// one of its chunks is unknown to `reference`.
    pub fn missing_in(&self, reference: &Self) -> Result<Self, StoreError> {
        self.check_combinable(reference)?;

        let reference_chunks: HashSet<ChunkHash> =
            reference.chunk_hashes.iter().copied().collect();

        let mut result = Self::new_empty(
            self.hash_identifier,
            self.max_block_size,
            self.max_chunks_per_block,
        );

        for (block, group) in self.chunks_per_block().into_iter().enumerate() {
            let uncovered = group
                .iter()
                .any(|&i| !reference_chunks.contains(&self.chunk_hashes[i]));
            if !uncovered {
                continue;
            }
            let result_block = result.block_hashes.len() as u64;
            result.block_hashes.push(self.block_hashes[block]);
            for i in group {
                result.chunk_hashes.push(self.chunk_hashes[i]);
                result.chunk_block_indexes.push(result_block);
            }
        }

        Ok(result)
    }

    /// The blocks of `self` that cover chunks of `requested`.
    ///
    /// Returns `self`'s block layout restricted to blocks contributing at
    /// least one requested chunk; requested chunks unknown to `self` are
    /// omitted.
    pub fn retarget(&self, requested: &Self) -> Result<Self, StoreError> {
        self.check_combinable(requested)?;

        let lookup = self.chunk_lookup();
        let mut wanted_blocks = vec![false; self.block_hashes.len()];
        for &chunk_hash in &requested.chunk_hashes {
            if let Some(&block) = lookup.get(&chunk_hash) {
                wanted_blocks[block as usize] = true;
            }
        }

        let mut result = Self::new_empty(
            self.hash_identifier,
            self.max_block_size,
            self.max_chunks_per_block,
        );

        let mut remapped = vec![u64::MAX; self.block_hashes.len()];
        for (block, wanted) in wanted_blocks.iter().enumerate() {
            if *wanted {
                remapped[block] = result.block_hashes.len() as u64;
                result.block_hashes.push(self.block_hashes[block]);
            }
        }
        for (i, &block) in self.chunk_block_indexes.iter().enumerate() {
            if wanted_blocks[block as usize] {
                result.chunk_hashes.push(self.chunk_hashes[i]);
                result.chunk_block_indexes.push(remapped[block as usize]);
            }
        }

        Ok(result)
    }

    pub fn encoded_size(&self) -> usize {
        CONTENT_INDEX_HEADER_SIZE
            + self.block_hashes.len() * 8
            + self.chunk_hashes.len() * 16
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = ContentIndexHeader {
            version: CONTENT_INDEX_VERSION,
            hash_identifier: self.hash_identifier,
            max_block_size: self.max_block_size,
            max_chunks_per_block: self.max_chunks_per_block,
            block_count: self.block_hashes.len() as u64,
            chunk_count: self.chunk_hashes.len() as u64,
        }
        .to_le();

        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(codec::struct_bytes(&header));
        codec::write_u64_slice(&mut buf, &self.block_hashes);
        codec::write_u64_slice(&mut buf, &self.chunk_hashes);
        codec::write_u64_slice(&mut buf, &self.chunk_block_indexes);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < CONTENT_INDEX_HEADER_SIZE {
            return Err(StoreError::MalformedData(format!(
                "truncated content index header ({} of {CONTENT_INDEX_HEADER_SIZE} bytes)",
                buf.len()
            )));
        }
        let header = codec::read_struct::<ContentIndexHeader>(buf).from_le();
        let version = header.version;
        if version != CONTENT_INDEX_VERSION {
            return Err(StoreError::MalformedData(format!(
                "unsupported content index version {}",
                version
            )));
        }
        let block_count = header.block_count as usize;
        let chunk_count = header.chunk_count as usize;
        let encoded_size = block_count
            .checked_mul(8)
            .and_then(|blocks| chunk_count.checked_mul(16).map(|chunks| (blocks, chunks)))
            .and_then(|(blocks, chunks)| blocks.checked_add(chunks))
            .and_then(|arrays| arrays.checked_add(CONTENT_INDEX_HEADER_SIZE))
            .ok_or_else(|| {
                StoreError::MalformedData(format!(
                    "invalid content index counts ({block_count} blocks, {chunk_count} chunks)"
                ))
            })?;
        if buf.len() != encoded_size {
            return Err(StoreError::MalformedData(format!(
                "content index is {} bytes, header declares {encoded_size}",
                buf.len()
            )));
        }

        let blocks_start = CONTENT_INDEX_HEADER_SIZE;
        let chunks_start = blocks_start + block_count * 8;
        let indexes_start = chunks_start + chunk_count * 8;
        let block_hashes = codec::read_u64_slice(&buf[blocks_start..], block_count);
        let chunk_hashes = codec::read_u64_slice(&buf[chunks_start..], chunk_count);
        let chunk_block_indexes = codec::read_u64_slice(&buf[indexes_start..], chunk_count);

        for &block in &chunk_block_indexes {
            if block >= block_count as u64 {
                return Err(StoreError::MalformedData(format!(
                    "chunk references block {block} of {block_count}"
                )));
            }
        }

        Ok(Self {
            hash_identifier: header.hash_identifier,
            max_block_size: header.max_block_size,
            max_chunks_per_block: header.max_chunks_per_block,
            block_hashes,
            chunk_hashes,
            chunk_block_indexes,
        })
    }

    /// Slurp and decode an index file.
    pub fn read_from_file(
        storage: &dyn StorageProvider,
        path: &Path,
    ) -> Result<Self, StoreError> {
        let data = storage.read_file(path)?;
        Self::from_bytes(&data)
    }

    /// Encode and write an index file, creating parent directories.
    pub fn write_to_file(
        &self,
        storage: &dyn StorageProvider,
        path: &Path,
    ) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                storage.create_dir_all(parent)?;
            }
        }
        storage.write_file(path, &self.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block(hash: BlockHash, chunks: &[(ChunkHash, u32)]) -> BlockIndex {
        BlockIndex::new(
            hash,
            0xbeef,
            0,
            chunks.iter().map(|(hash, _)| *hash).collect(),
            chunks.iter().map(|(_, size)| *size).collect(),
        )
        .unwrap()
    }

    fn index(blocks: &[BlockIndex]) -> ContentIndex {
        ContentIndex::from_blocks(65536, 1024, blocks).unwrap()
    }

    #[test]
    fn test_from_blocks() {
        let ci = index(&[
            block(0x10, &[(1, 10), (2, 20)]),
            block(0x20, &[(3, 30), (2, 20)]),
        ]);
        assert_eq!(ci.block_count(), 2);
        // duplicate chunk 2 keeps its first assignment
        assert_eq!(ci.chunk_count(), 3);
        assert_eq!(ci.block_for_chunk(2), Some(0x10));
        assert_eq!(ci.block_for_chunk(3), Some(0x20));
        assert_eq!(ci.block_for_chunk(4), None);

        let empty = ContentIndex::from_blocks(65536, 1024, &[]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_add_identity() {
        let a = index(&[block(0x10, &[(1, 10)]), block(0x20, &[(2, 20)])]);
        let empty = ContentIndex::new_empty(0xbeef, 65536, 1024);

        let sum = a.add(&empty).unwrap();
        assert_eq!(sum, a);

        let sum = empty.add(&a).unwrap();
        assert_eq!(sum.block_hashes(), a.block_hashes());
        assert_eq!(sum.chunk_hashes(), a.chunk_hashes());
        assert_eq!(sum.hash_identifier(), a.hash_identifier());
    }

    #[test]
    fn test_add_shifts_block_indexes() {
        let a = index(&[block(0x10, &[(1, 10)])]);
        let b = index(&[block(0x20, &[(2, 20)])]);
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.block_hashes(), &[0x10, 0x20]);
        assert_eq!(sum.chunk_block_indexes(), &[0, 1]);
        assert_eq!(sum.block_for_chunk(2), Some(0x20));
    }

    #[test]
    fn test_merge_idempotent() {
        let a = index(&[
            block(0x10, &[(1, 10), (2, 20)]),
            block(0x20, &[(3, 30)]),
        ]);
        let merged = a.merge(&a).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_merge_local_wins() {
        // A has block X with chunk c1; B has block Y with chunks c1 and c2
        let a = index(&[block(0x10, &[(1, 10)])]);
        let b = index(&[block(0x20, &[(1, 10), (2, 20)])]);

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.block_hashes(), &[0x10, 0x20]);
        assert_eq!(merged.block_for_chunk(1), Some(0x10));
        assert_eq!(merged.block_for_chunk(2), Some(0x20));
    }

    #[test]
    fn test_merge_skips_covered_blocks() {
        let a = index(&[block(0x10, &[(1, 10), (2, 20)])]);
        let b = index(&[block(0x20, &[(1, 10)]), block(0x30, &[(2, 20), (3, 5)])]);

        let merged = a.merge(&b).unwrap();
        // block 0x20 adds nothing, block 0x30 contributes chunk 3
        assert_eq!(merged.block_hashes(), &[0x10, 0x30]);
        assert_eq!(merged.block_for_chunk(3), Some(0x30));
    }

    #[test]
    fn test_hash_identifier_mismatch() {
        let a = index(&[block(0x10, &[(1, 10)])]);
        let mut other_family = block(0x20, &[(2, 20)]);
        other_family = BlockIndex::new(
            other_family.block_hash(),
            0xf00d,
            0,
            other_family.chunk_hashes().to_vec(),
            other_family.chunk_sizes().to_vec(),
        )
        .unwrap();
        let b = ContentIndex::from_blocks(65536, 1024, &[other_family]).unwrap();

        assert!(matches!(
            a.merge(&b),
            Err(StoreError::HashIdentifierMismatch(0xbeef, 0xf00d))
        ));
        assert!(matches!(
            a.add(&b),
            Err(StoreError::HashIdentifierMismatch(0xbeef, 0xf00d))
        ));
    }

    #[test]
    fn test_missing_in() {
        let r = index(&[
            block(0x10, &[(1, 10), (2, 20)]),
            block(0x20, &[(3, 30)]),
        ]);

        // nothing missing against itself
        assert_eq!(r.missing_in(&r).unwrap().block_count(), 0);

        // reference covering only chunk 1: both blocks of r have uncovered chunks
        let partial = index(&[block(0x99, &[(1, 10)])]);
        let missing = r.missing_in(&partial).unwrap();
        assert_eq!(missing.block_hashes(), &[0x10, 0x20]);
        // blocks are copied whole, covered chunk 1 included
        assert_eq!(missing.chunk_count(), 3);

        // reference covering chunks 1 and 2: only block 0x20 remains
        let partial = index(&[block(0x99, &[(1, 10), (2, 20)])]);
        let missing = r.missing_in(&partial).unwrap();
        assert_eq!(missing.block_hashes(), &[0x20]);
    }

    #[test]
    fn test_retarget() {
        let r = index(&[
            block(0x10, &[(1, 10), (2, 20)]),
            block(0x20, &[(3, 30)]),
            block(0x30, &[(4, 40)]),
        ]);

        // request chunks 2 and 3 (and one unknown chunk)
        let q = index(&[block(0x99, &[(2, 20), (3, 30), (77, 7)])]);
        let hit = r.retarget(&q).unwrap();

        // every covering block, no others; chunk 77 is omitted
        assert_eq!(hit.block_hashes(), &[0x10, 0x20]);
        assert_eq!(hit.chunk_count(), 3);
        assert_eq!(hit.block_for_chunk(1), Some(0x10));
        assert_eq!(hit.block_for_chunk(3), Some(0x20));
        assert_eq!(hit.block_for_chunk(77), None);
        assert_eq!(hit.block_for_chunk(4), None);
    }

    #[test]
    fn test_content_index_roundtrip() {
        let ci = index(&[
            block(0x10, &[(1, 10), (2, 20)]),
            block(0x20, &[(3, 30)]),
        ]);
        let bytes = ci.to_bytes();
        assert_eq!(bytes.len(), ci.encoded_size());
        let decoded = ContentIndex::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, ci);
        assert_eq!(decoded.to_bytes(), bytes);

        let empty = ContentIndex::new_empty(0xbeef, 65536, 1024);
        let decoded = ContentIndex::from_bytes(&empty.to_bytes()).unwrap();
        assert_eq!(decoded, empty);
    }

    #[test]
    fn test_content_index_malformed() {
        let ci = index(&[block(0x10, &[(1, 10)])]);
        let bytes = ci.to_bytes();

        assert!(matches!(
            ContentIndex::from_bytes(&bytes[..bytes.len() - 1]),
            Err(StoreError::MalformedData(_))
        ));

        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(
            ContentIndex::from_bytes(&long),
            Err(StoreError::MalformedData(_))
        ));

        // chunk pointing past the block list
        let mut mangled = bytes;
        let indexes_start = mangled.len() - 8;
        mangled[indexes_start..].copy_from_slice(&5u64.to_le_bytes());
        assert!(matches!(
            ContentIndex::from_bytes(&mangled),
            Err(StoreError::MalformedData(_))
        ));
    }

    #[test]
    fn test_content_index_file_io() {
        let storage = shale_tools::MemStorage::new();
        let ci = index(&[block(0x10, &[(1, 10)])]);
        let path = Path::new("store/store.lci");
        ci.write_to_file(&storage, path).unwrap();
        let read = ContentIndex::read_from_file(&storage, path).unwrap();
        assert_eq!(read, ci);
    }
}
