//! Admission-time validation against a version's chunk requirements.
//!
//! The version index itself is produced elsewhere (chunker + hasher); this
//! module only consumes the narrow view the storage layer needs: which
//! chunks a version requires, how large they are, and how assets are
//! assembled from them.

use crate::content_index::ContentIndex;
use crate::block_store::StoreError;
use crate::{ChunkHash, HashIdentifier};

/// The chunk requirements of one version.
///
/// `asset_chunk_indexes` holds, for every asset, `asset_chunk_counts[i]`
/// consecutive positions into `chunk_hashes`/`chunk_sizes` starting at
/// `asset_chunk_index_starts[i]`.
#[derive(Clone, Debug, Default)]
pub struct VersionContent {
    pub hash_identifier: HashIdentifier,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
    pub asset_sizes: Vec<u64>,
    pub asset_chunk_counts: Vec<u32>,
    pub asset_chunk_index_starts: Vec<u32>,
    pub asset_chunk_indexes: Vec<u32>,
}

impl VersionContent {
    fn check_shape(&self) -> Result<(), StoreError> {
        if self.chunk_hashes.len() != self.chunk_sizes.len() {
            return Err(StoreError::InvalidArgument(format!(
                "chunk hash/size count mismatch ({} != {})",
                self.chunk_hashes.len(),
                self.chunk_sizes.len()
            )));
        }
        let asset_count = self.asset_sizes.len();
        if self.asset_chunk_counts.len() != asset_count
            || self.asset_chunk_index_starts.len() != asset_count
        {
            return Err(StoreError::InvalidArgument(
                "asset table column lengths differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Iterate the chunk positions of asset `asset` or fail on a table
    /// entry pointing outside `asset_chunk_indexes`/`chunk_hashes`.
    fn asset_chunks(&self, asset: usize) -> Result<&[u32], StoreError> {
        let start = self.asset_chunk_index_starts[asset] as usize;
        let count = self.asset_chunk_counts[asset] as usize;
        let span = self
            .asset_chunk_indexes
            .get(start..start + count)
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "asset {asset} chunk span {start}..{} exceeds index table",
                    start + count
                ))
            })?;
        for &chunk in span {
            if chunk as usize >= self.chunk_hashes.len() {
                return Err(StoreError::InvalidArgument(format!(
                    "asset {asset} references chunk {chunk} of {}",
                    self.chunk_hashes.len()
                )));
            }
        }
        Ok(span)
    }
}

/// Check that `content_index` can serve every chunk `version` requires and
/// that reassembling each asset from its chunks yields the recorded size.
pub fn validate_content(
    content_index: &ContentIndex,
    version: &VersionContent,
) -> Result<(), StoreError> {
    version.check_shape()?;
    if !content_index.is_empty()
        && !version.chunk_hashes.is_empty()
        && content_index.hash_identifier() != version.hash_identifier
    {
        return Err(StoreError::HashIdentifierMismatch(
            content_index.hash_identifier(),
            version.hash_identifier,
        ));
    }

    let known: std::collections::HashSet<ChunkHash> =
        content_index.chunk_hashes().iter().copied().collect();
    for &chunk_hash in &version.chunk_hashes {
        if !known.contains(&chunk_hash) {
            return Err(StoreError::InvalidArgument(format!(
                "chunk 0x{chunk_hash:016x} is not reachable in the content index"
            )));
        }
    }

    validate_asset_sizes(version)
}

/// Check that `version` accounts for every chunk `content_index` holds, and
/// that its asset sizes reconstruct.
pub fn validate_version(
    content_index: &ContentIndex,
    version: &VersionContent,
) -> Result<(), StoreError> {
    version.check_shape()?;
    if !content_index.is_empty()
        && !version.chunk_hashes.is_empty()
        && content_index.hash_identifier() != version.hash_identifier
    {
        return Err(StoreError::HashIdentifierMismatch(
            content_index.hash_identifier(),
            version.hash_identifier,
        ));
    }

    let required: std::collections::HashSet<ChunkHash> =
        version.chunk_hashes.iter().copied().collect();
    for &chunk_hash in content_index.chunk_hashes() {
        if !required.contains(&chunk_hash) {
            return Err(StoreError::InvalidArgument(format!(
                "content index chunk 0x{chunk_hash:016x} is unknown to the version"
            )));
        }
    }

    validate_asset_sizes(version)
}

fn validate_asset_sizes(version: &VersionContent) -> Result<(), StoreError> {
    for asset in 0..version.asset_sizes.len() {
        let reassembled: u64 = version
            .asset_chunks(asset)?
            .iter()
            .map(|&chunk| version.chunk_sizes[chunk as usize] as u64)
            .sum();
        if reassembled != version.asset_sizes[asset] {
            return Err(StoreError::InvalidArgument(format!(
                "asset {asset} reassembles to {reassembled} bytes, version records {}",
                version.asset_sizes[asset]
            )));
        }
    }
    Ok(())
}
