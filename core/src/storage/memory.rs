//! Volatile storage: the whole log lives in one merged [`StorageOverlay`].
//!
//! Useful for tests and for logs that don't need to survive the process.

use bytes::Bytes;
use parking_lot::RwLock;

use super::overlay::StorageOverlay;
use super::{
    CoreAuth, CoreHead, CoreStorage, DataInfo, LocalKeyPair, ReadBatch, StorageResult, WriteBatch,
};
use crate::tree::TreeNode;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StorageOverlay>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks currently held.
    pub fn block_count(&self) -> usize {
        self.state.read().blocks.as_ref().map_or(0, |b| b.len())
    }
}

impl CoreStorage for MemoryStorage {
    fn read_batch(&self) -> Box<dyn ReadBatch + '_> {
        Box::new(MemoryReadBatch { storage: self })
    }

    fn write_batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    fn apply(&self, overlay: StorageOverlay) -> StorageResult<()> {
        let mut state = self.state.write();
        state.merge(overlay)?;
        state.prune_tombstones();
        Ok(())
    }
}

struct MemoryReadBatch<'a> {
    storage: &'a MemoryStorage,
}

impl ReadBatch for MemoryReadBatch<'_> {
    fn get_core_head(&self) -> StorageResult<Option<CoreHead>> {
        Ok(self.storage.state.read().head.clone())
    }

    fn get_core_auth(&self) -> StorageResult<Option<CoreAuth>> {
        Ok(self.storage.state.read().auth.clone())
    }

    fn get_local_key_pair(&self) -> StorageResult<Option<LocalKeyPair>> {
        Ok(self.storage.state.read().local_key_pair.clone())
    }

    fn get_encryption_key(&self) -> StorageResult<Option<Bytes>> {
        Ok(self.storage.state.read().encryption_key.clone())
    }

    fn get_data_info(&self) -> StorageResult<Option<DataInfo>> {
        Ok(self.storage.state.read().data_info)
    }

    fn get_user_data(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.storage.state.read().user_data_entry(key).flatten())
    }

    fn get_block(&self, index: u64) -> StorageResult<Option<Bytes>> {
        Ok(self.storage.state.read().block(index).flatten())
    }

    fn get_tree_node(&self, index: u64) -> StorageResult<Option<TreeNode>> {
        Ok(self.storage.state.read().tree_node(index).flatten())
    }

    fn get_bitfield_page(&self, page: u64) -> StorageResult<Option<Bytes>> {
        Ok(self.storage.state.read().bitfield_page(page).flatten())
    }
}
