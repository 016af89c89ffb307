//! A block index together with its chunk payload.

use crate::block_index::BlockIndex;
use crate::block_store::StoreError;

/// One complete block: index plus raw chunk bytes.
///
/// Block files are exactly the serialized form of this type: the block
/// index immediately followed by the payload. Stores share fetched blocks
/// between consumers as `Arc<StoredBlock>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    block_index: BlockIndex,
    block_data: Vec<u8>,
}

impl StoredBlock {
    pub fn new(block_index: BlockIndex, block_data: Vec<u8>) -> Result<Self, StoreError> {
        let payload_size = block_index.payload_size();
        if payload_size != block_data.len() as u64 {
            return Err(StoreError::InvalidArgument(format!(
                "block data size {} does not match chunk sizes (sum {payload_size})",
                block_data.len()
            )));
        }
        Ok(Self {
            block_index,
            block_data,
        })
    }

    pub fn block_index(&self) -> &BlockIndex {
        &self.block_index
    }

    pub fn block_data(&self) -> &[u8] {
        &self.block_data
    }

    /// Payload of the chunk at `chunk_index` within this block.
    pub fn chunk_data(&self, chunk_index: usize) -> Option<&[u8]> {
        let sizes = self.block_index.chunk_sizes();
        if chunk_index >= sizes.len() {
            return None;
        }
        let start: usize = sizes[..chunk_index].iter().map(|size| *size as usize).sum();
        let len = sizes[chunk_index] as usize;
        Some(&self.block_data[start..start + len])
    }

    pub fn encoded_size(&self) -> usize {
        self.block_index.encoded_size() + self.block_data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.block_index.encode_into(&mut buf);
        buf.extend_from_slice(&self.block_data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        let (block_index, consumed) = BlockIndex::decode(buf)?;
        let payload = &buf[consumed..];
        if payload.len() as u64 != block_index.payload_size() {
            return Err(StoreError::MalformedData(format!(
                "block payload is {} bytes, index declares {}",
                payload.len(),
                block_index.payload_size()
            )));
        }
        Ok(Self {
            block_index,
            block_data: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stored_block_roundtrip() {
        let index = BlockIndex::new(0x42, 1, 0, vec![0xa, 0xb], vec![3, 4]).unwrap();
        let block = StoredBlock::new(index, b"abcdefg".to_vec()).unwrap();

        assert_eq!(block.chunk_data(0).unwrap(), b"abc");
        assert_eq!(block.chunk_data(1).unwrap(), b"defg");
        assert!(block.chunk_data(2).is_none());

        let bytes = block.to_bytes();
        let decoded = StoredBlock::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn test_stored_block_size_mismatch() {
        let index = BlockIndex::new(0x42, 1, 0, vec![0xa], vec![4]).unwrap();
        assert!(matches!(
            StoredBlock::new(index.clone(), b"abc".to_vec()),
            Err(StoreError::InvalidArgument(_))
        ));

        let good = StoredBlock::new(index, b"abcd".to_vec()).unwrap();
        let mut bytes = good.to_bytes();
        bytes.pop();
        assert!(matches!(
            StoredBlock::from_bytes(&bytes),
            Err(StoreError::MalformedData(_))
        ));
    }
}
