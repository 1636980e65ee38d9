//! # Storage Module
//!
//! The seam between the log core and wherever its bytes actually live.
//!
//! ## Architecture
//!
//! ```text
//! tiplist.rs: offset-indexed append/tail-delete sequence
//! overlay.rs: StorageOverlay (mergeable diff) + MemoryOverlay (diff over any storage)
//! memory.rs : MemoryStorage, a fully merged overlay and nothing else
//! disk.rs   : DiskStorage, sled for bulk data + an oplog for metadata
//! ```
//!
//! ## Batches
//!
//! Every access goes through a batch. A [`ReadBatch`] answers point lookups
//! with `Ok(None)` for "absent"; a [`WriteBatch`] records changes into a
//! fresh [`StorageOverlay`] and hands the whole thing to the backend on
//! `flush`. Backends only have to implement one write path: `apply`.
//!
//! Read batches never hold a lock across calls. Each getter locks, copies
//! what it needs, and lets go.

pub mod disk;
pub mod memory;
pub mod overlay;
pub mod tiplist;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Hash, PublicKey, Signature};
use crate::oplog::OplogError;
use crate::tree::TreeNode;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use overlay::{MemoryOverlay, StorageOverlay};
pub use tiplist::{TipList, TipListError};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("oplog error: {0}")]
    Oplog(#[from] OplogError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("tip list error: {0}")]
    TipList(#[from] TipListError),

    /// The backend does not support this operation.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Stored Values
// ---------------------------------------------------------------------------

/// The signed summary of the tree: everything needed to check the root set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreHead {
    pub fork: u64,
    pub length: u64,
    pub root_hash: Hash,
    pub signature: Option<Signature>,
}

/// The log's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAuth {
    pub key: PublicKey,
    pub discovery_key: Hash,
}

/// The writer's keypair, persisted next to the log it signs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalKeyPair {
    pub public_key: PublicKey,
    pub secret_key: [u8; 32],
}

impl std::fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInfo {
    pub version: u32,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Point reads against one consistent-enough view of storage.
pub trait ReadBatch {
    fn get_core_head(&self) -> StorageResult<Option<CoreHead>>;
    fn get_core_auth(&self) -> StorageResult<Option<CoreAuth>>;
    fn get_local_key_pair(&self) -> StorageResult<Option<LocalKeyPair>>;
    fn get_encryption_key(&self) -> StorageResult<Option<Bytes>>;
    fn get_data_info(&self) -> StorageResult<Option<DataInfo>>;
    fn get_user_data(&self, key: &str) -> StorageResult<Option<Bytes>>;

    fn has_block(&self, index: u64) -> StorageResult<bool> {
        Ok(self.get_block(index)?.is_some())
    }
    fn get_block(&self, index: u64) -> StorageResult<Option<Bytes>>;

    fn has_tree_node(&self, index: u64) -> StorageResult<bool> {
        Ok(self.get_tree_node(index)?.is_some())
    }
    fn get_tree_node(&self, index: u64) -> StorageResult<Option<TreeNode>>;

    fn get_bitfield_page(&self, page: u64) -> StorageResult<Option<Bytes>>;

    /// Dispatches any reads the backend has been coalescing. Backends that
    /// answer eagerly have nothing to do.
    fn try_flush(&self) {}
}

/// A set of changes, applied all at once on [`flush`](WriteBatch::flush).
pub struct WriteBatch<'a> {
    storage: &'a dyn CoreStorage,
    overlay: StorageOverlay,
}

impl<'a> WriteBatch<'a> {
    pub fn new(storage: &'a dyn CoreStorage) -> Self {
        Self {
            storage,
            overlay: StorageOverlay::default(),
        }
    }

    pub fn set_core_head(&mut self, head: CoreHead) {
        self.overlay.head = Some(head);
    }

    pub fn set_core_auth(&mut self, auth: CoreAuth) {
        self.overlay.auth = Some(auth);
    }

    pub fn set_local_key_pair(&mut self, key_pair: LocalKeyPair) {
        self.overlay.local_key_pair = Some(key_pair);
    }

    pub fn set_encryption_key(&mut self, key: Bytes) {
        self.overlay.encryption_key = Some(key);
    }

    pub fn set_data_info(&mut self, info: DataInfo) {
        self.overlay.data_info = Some(info);
    }

    /// Sets (or with `None`, deletes) a user-data entry.
    pub fn set_user_data(&mut self, key: impl Into<String>, value: Option<Bytes>) {
        self.overlay
            .user_data
            .get_or_insert_with(Default::default)
            .insert(key.into(), value);
    }

    pub fn put_block(&mut self, index: u64, data: Bytes) -> StorageResult<()> {
        self.overlay
            .blocks
            .get_or_insert_with(TipList::new)
            .put(index, data)?;
        Ok(())
    }

    pub fn delete_block(&mut self, _index: u64) -> StorageResult<()> {
        Err(StorageError::Unimplemented("delete_block"))
    }

    pub fn delete_block_range(&mut self, start: u64, end: u64) -> StorageResult<()> {
        self.overlay
            .blocks
            .get_or_insert_with(TipList::new)
            .delete(start, end)?;
        Ok(())
    }

    pub fn put_tree_node(&mut self, node: TreeNode) {
        self.overlay
            .tree_nodes
            .get_or_insert_with(Default::default)
            .insert(node.index, Some(node));
    }

    pub fn delete_tree_node(&mut self, _index: u64) -> StorageResult<()> {
        Err(StorageError::Unimplemented("delete_tree_node"))
    }

    /// Tombstones every node in `[start, end)`.
    pub fn delete_tree_node_range(&mut self, start: u64, end: u64) {
        let nodes = self.overlay.tree_nodes.get_or_insert_with(Default::default);
        for index in start..end {
            nodes.insert(index, None);
        }
    }

    /// Tombstones each listed node.
    pub fn delete_tree_nodes(&mut self, indices: impl IntoIterator<Item = u64>) {
        let nodes = self.overlay.tree_nodes.get_or_insert_with(Default::default);
        for index in indices {
            nodes.insert(index, None);
        }
    }

    pub fn put_bitfield_page(&mut self, page: u64, data: Bytes) -> StorageResult<()> {
        self.overlay
            .bitfields
            .get_or_insert_with(TipList::new)
            .put(page, data)?;
        Ok(())
    }

    pub fn delete_bitfield_page_range(&mut self, start: u64, end: u64) -> StorageResult<()> {
        self.overlay
            .bitfields
            .get_or_insert_with(TipList::new)
            .delete(start, end)?;
        Ok(())
    }

    /// Whether anything has been recorded.
    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// Hands the recorded changes to the backend.
    pub fn flush(self) -> StorageResult<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        self.storage.apply(self.overlay)
    }
}

/// A place a log's state lives.
pub trait CoreStorage: Send + Sync {
    fn read_batch(&self) -> Box<dyn ReadBatch + '_>;

    fn write_batch(&self) -> WriteBatch<'_>;

    /// Applies a set of changes. Either all of it becomes visible or the
    /// call fails.
    fn apply(&self, overlay: StorageOverlay) -> StorageResult<()>;
}
