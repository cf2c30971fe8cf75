//! In-memory block storage
//!
//! Provides CID-indexed block storage with SHA-256 verification. Lookups are
//! synchronous so that presence checks stay cheap for callers that hold
//! their own locks.

use cid::Cid;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::cid_sha2::{block_cid, verify_block, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    NotFound(Cid),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a new block from data, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, CidError> {
        let cid = block_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_block(&data, &cid)?;
        Ok(Self { cid, data })
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// In-memory block storage with CID-based indexing
///
/// `has` takes a read lock on an in-memory map and never blocks on I/O.
pub struct BlockStore {
    blocks: RwLock<HashMap<Cid, Block>>,
}

impl BlockStore {
    /// Create a new empty block store
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Store a block, verifying its CID. Storing the same block twice is a
    /// no-op.
    pub fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_block(&block.data, &block.cid)?;

        let mut blocks = self.blocks.write().expect("block store lock poisoned");
        if blocks.contains_key(&block.cid) {
            debug!(cid = %block.cid, "block already exists");
            return Ok(());
        }

        debug!(cid = %block.cid, size = block.size(), "stored block");
        blocks.insert(block.cid, block);
        Ok(())
    }

    /// Store raw data, computing its CID
    pub fn put_data(&self, data: Vec<u8>) -> Result<Cid, StorageError> {
        let block = Block::new(data)?;
        let cid = block.cid;
        self.put(block)?;
        Ok(cid)
    }

    /// Retrieve a block by CID
    pub fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        blocks
            .get(cid)
            .cloned()
            .ok_or(StorageError::NotFound(*cid))
    }

    /// Check if a block exists
    pub fn has(&self, cid: &Cid) -> bool {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        blocks.contains_key(cid)
    }

    /// Delete a block
    pub fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write().expect("block store lock poisoned");
        blocks.remove(cid).ok_or(StorageError::NotFound(*cid))?;
        debug!(%cid, "deleted block");
        Ok(())
    }

    /// Number of blocks in the store
    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of all stored blocks in bytes
    pub fn total_size(&self) -> usize {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        blocks.values().map(Block::size).sum()
    }

    /// Get all CIDs in the store
    pub fn list_cids(&self) -> Vec<Cid> {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        blocks.values().map(|block| block.cid).collect()
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_new() {
        let data = b"hello world".to_vec();
        let block = Block::new(data.clone()).unwrap();

        assert_eq!(block.data, data);
        assert_eq!(block.size(), data.len());
    }

    #[test]
    fn test_block_from_cid_and_data() {
        let data = b"hello world".to_vec();
        let block1 = Block::new(data.clone()).unwrap();

        // Should succeed with matching CID
        let block2 = Block::from_cid_and_data(block1.cid, data.clone()).unwrap();
        assert_eq!(block1, block2);

        // Should fail with mismatched CID
        let other_data = b"goodbye world".to_vec();
        let result = Block::from_cid_and_data(block1.cid, other_data);
        assert!(result.is_err());
    }

    #[test]
    fn test_store_put_get() {
        let store = BlockStore::new();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        store.put(block.clone()).unwrap();

        let retrieved = store.get(&cid).unwrap();
        assert_eq!(retrieved, block);
    }

    #[test]
    fn test_store_get_missing() {
        let store = BlockStore::new();
        let cid = block_cid(b"never stored").unwrap();

        match store.get(&cid) {
            Err(StorageError::NotFound(missing)) => assert_eq!(missing, cid),
            other => panic!("Expected NotFound, got {:?}", other.map(|b| b.cid)),
        }
    }

    #[test]
    fn test_store_has() {
        let store = BlockStore::new();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        assert!(!store.has(&cid));
        store.put(block).unwrap();
        assert!(store.has(&cid));
    }

    #[test]
    fn test_store_delete() {
        let store = BlockStore::new();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        store.put(block).unwrap();
        assert!(store.has(&cid));

        store.delete(&cid).unwrap();
        assert!(!store.has(&cid));
        assert!(store.get(&cid).is_err());
    }

    #[test]
    fn test_store_idempotent_put() {
        let store = BlockStore::new();
        let block = Block::new(b"hello world".to_vec()).unwrap();

        store.put(block.clone()).unwrap();
        store.put(block).unwrap();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_rejects_forged_block() {
        let store = BlockStore::new();
        let cid = block_cid(b"claimed content").unwrap();
        let forged = Block {
            cid,
            data: b"actual content".to_vec(),
        };

        assert!(store.put(forged).is_err());
        assert!(!store.has(&cid));
    }

    #[test]
    fn test_store_total_size() {
        let store = BlockStore::new();

        store.put_data(vec![1u8; 100]).unwrap();
        store.put_data(vec![2u8; 200]).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.total_size(), 300);
    }

    #[test]
    fn test_store_list_cids() {
        let store = BlockStore::new();

        let cid1 = store.put_data(b"block 1".to_vec()).unwrap();
        let cid2 = store.put_data(b"block 2".to_vec()).unwrap();

        let cids = store.list_cids();
        assert_eq!(cids.len(), 2);
        assert!(cids.contains(&cid1));
        assert!(cids.contains(&cid2));
    }
}
