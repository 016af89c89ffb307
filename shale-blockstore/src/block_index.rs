//! Header of one packed block.

use endian_trait::Endian;

use crate::block_store::StoreError;
use crate::codec;
use crate::{BlockHash, ChunkHash, HashIdentifier};

/// On-disk block index header
///
/// (BLOCK_HASH || HASH_IDENTIFIER || TAG || CHUNK_COUNT), little endian,
/// immediately followed by `chunk_count` u64 chunk hashes and `chunk_count`
/// u32 chunk sizes.
#[derive(Endian, Clone, Copy)]
#[repr(C, packed)]
struct BlockIndexHeader {
    block_hash: u64,
    hash_identifier: u32,
    tag: u32,
    chunk_count: u32,
}

const BLOCK_INDEX_HEADER_SIZE: usize = std::mem::size_of::<BlockIndexHeader>();

/// Per-chunk cost in the serialized form: one u64 hash plus one u32 size.
const CHUNK_ENTRY_SIZE: usize = 8 + 4;

/// Describes the chunks packed into one block.
///
/// Immutable once constructed; the serialized form is the layout documented
/// on [`BlockIndexHeader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    block_hash: BlockHash,
    hash_identifier: HashIdentifier,
    tag: u32,
    chunk_hashes: Vec<ChunkHash>,
    chunk_sizes: Vec<u32>,
}

impl BlockIndex {
    pub fn new(
        block_hash: BlockHash,
        hash_identifier: HashIdentifier,
        tag: u32,
        chunk_hashes: Vec<ChunkHash>,
        chunk_sizes: Vec<u32>,
    ) -> Result<Self, StoreError> {
        if chunk_hashes.len() != chunk_sizes.len() {
            return Err(StoreError::InvalidArgument(format!(
                "chunk hash/size count mismatch ({} != {})",
                chunk_hashes.len(),
                chunk_sizes.len()
            )));
        }
        if chunk_hashes.len() > u32::MAX as usize {
            return Err(StoreError::InvalidArgument(format!(
                "too many chunks in block ({})",
                chunk_hashes.len()
            )));
        }
        Ok(Self {
            block_hash,
            hash_identifier,
            tag,
            chunk_hashes,
            chunk_sizes,
        })
    }

    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    pub fn hash_identifier(&self) -> HashIdentifier {
        self.hash_identifier
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    pub fn chunk_hashes(&self) -> &[ChunkHash] {
        &self.chunk_hashes
    }

    pub fn chunk_sizes(&self) -> &[u32] {
        &self.chunk_sizes
    }

    /// Total size of the chunk payload described by this index.
    pub fn payload_size(&self) -> u64 {
        self.chunk_sizes.iter().map(|size| *size as u64).sum()
    }

    /// Size of the serialized index.
    pub fn encoded_size(&self) -> usize {
        BLOCK_INDEX_HEADER_SIZE + self.chunk_hashes.len() * CHUNK_ENTRY_SIZE
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let header = BlockIndexHeader {
            block_hash: self.block_hash,
            hash_identifier: self.hash_identifier,
            tag: self.tag,
            chunk_count: self.chunk_hashes.len() as u32,
        }
        .to_le();
        buf.extend_from_slice(codec::struct_bytes(&header));
        codec::write_u64_slice(buf, &self.chunk_hashes);
        codec::write_u32_slice(buf, &self.chunk_sizes);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode an index from the start of `buf`.
    ///
    /// Returns the index and the number of bytes consumed; trailing bytes
    /// are left for the caller (block files carry the payload there).
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), StoreError> {
        if buf.len() < BLOCK_INDEX_HEADER_SIZE {
            return Err(StoreError::MalformedData(format!(
                "truncated block index header ({} of {BLOCK_INDEX_HEADER_SIZE} bytes)",
                buf.len()
            )));
        }
        let header = codec::read_struct::<BlockIndexHeader>(buf).from_le();
        let chunk_count = header.chunk_count as usize;
        let encoded_size = chunk_count
            .checked_mul(CHUNK_ENTRY_SIZE)
            .and_then(|arrays| arrays.checked_add(BLOCK_INDEX_HEADER_SIZE))
            .ok_or_else(|| {
                StoreError::MalformedData(format!("invalid chunk count {chunk_count}"))
            })?;
        if buf.len() < encoded_size {
            return Err(StoreError::MalformedData(format!(
                "truncated block index ({} of {encoded_size} bytes)",
                buf.len()
            )));
        }
        let hashes_start = BLOCK_INDEX_HEADER_SIZE;
        let sizes_start = hashes_start + chunk_count * 8;
        let chunk_hashes = codec::read_u64_slice(&buf[hashes_start..], chunk_count);
        let chunk_sizes = codec::read_u32_slice(&buf[sizes_start..], chunk_count);
        Ok((
            Self {
                block_hash: header.block_hash,
                hash_identifier: header.hash_identifier,
                tag: header.tag,
                chunk_hashes,
                chunk_sizes,
            },
            encoded_size,
        ))
    }

    /// Decode a buffer holding exactly one index and nothing else.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        let (index, consumed) = Self::decode(buf)?;
        if consumed != buf.len() {
            return Err(StoreError::MalformedData(format!(
                "{} trailing bytes after block index",
                buf.len() - consumed
            )));
        }
        Ok(index)
    }

    /// Serialized size of an index with `chunk_count` chunks.
    pub fn encoded_size_for(chunk_count: u32) -> usize {
        BLOCK_INDEX_HEADER_SIZE + chunk_count as usize * CHUNK_ENTRY_SIZE
    }

    /// Number of bytes needed to know how large a serialized index is.
    pub const fn header_size() -> usize {
        BLOCK_INDEX_HEADER_SIZE
    }

    /// Full serialized size of the index whose header starts `buf`.
    ///
    /// Lets readers size a second read instead of slurping whole block
    /// files just for their index.
    pub fn encoded_size_from_prefix(buf: &[u8]) -> Result<usize, StoreError> {
        if buf.len() < BLOCK_INDEX_HEADER_SIZE {
            return Err(StoreError::MalformedData(format!(
                "truncated block index header ({} of {BLOCK_INDEX_HEADER_SIZE} bytes)",
                buf.len()
            )));
        }
        let header = codec::read_struct::<BlockIndexHeader>(buf).from_le();
        let chunk_count = header.chunk_count;
        (chunk_count as usize)
            .checked_mul(CHUNK_ENTRY_SIZE)
            .and_then(|arrays| arrays.checked_add(BLOCK_INDEX_HEADER_SIZE))
            .ok_or_else(|| {
                StoreError::MalformedData(format!(
                    "invalid chunk count {}",
                    chunk_count
                ))
            })
    }
}
