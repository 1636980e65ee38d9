//! In-memory storage diffs.
//!
//! A [`StorageOverlay`] is one layer of changes: a handful of scalars that
//! are either set or "defer to whatever is underneath", plus collections that
//! merge structurally. Write batches fill a fresh overlay; backends merge it
//! into their state.
//!
//! [`MemoryOverlay`] keeps such a layer in front of another [`CoreStorage`].
//! Write batches flushed against it only merge into the layer, so several of
//! them compose without any I/O until [`MemoryOverlay::commit`].

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::tiplist::{TipList, TipListError};
use super::{
    CoreAuth, CoreHead, CoreStorage, DataInfo, LocalKeyPair, ReadBatch, StorageError,
    StorageResult, WriteBatch,
};
use crate::tree::TreeNode;

/// One layer of storage changes. `None` means "not touched here".
#[derive(Debug, Clone, Default)]
pub struct StorageOverlay {
    pub head: Option<CoreHead>,
    pub auth: Option<CoreAuth>,
    pub local_key_pair: Option<LocalKeyPair>,
    pub encryption_key: Option<Bytes>,
    pub data_info: Option<DataInfo>,
    /// `None` values are deletions.
    pub user_data: Option<BTreeMap<String, Option<Bytes>>>,
    pub blocks: Option<TipList<Bytes>>,
    /// `None` values are deletions.
    pub tree_nodes: Option<BTreeMap<u64, Option<TreeNode>>>,
    pub bitfields: Option<TipList<Bytes>>,
}

impl StorageOverlay {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
            && self.auth.is_none()
            && self.local_key_pair.is_none()
            && self.encryption_key.is_none()
            && self.data_info.is_none()
            && self.user_data.is_none()
            && self.blocks.is_none()
            && self.tree_nodes.is_none()
            && self.bitfields.is_none()
    }

    /// Layers `other` on top. Scalars set in `other` win outright; user data
    /// and tree nodes are replaced key by key; the tip lists merge.
    ///
    /// Fails without modifying `self` if either tip list merge is invalid.
    pub fn merge(&mut self, other: StorageOverlay) -> Result<(), TipListError> {
        if let (Some(ours), Some(theirs)) = (&self.blocks, &other.blocks) {
            ours.check_merge(theirs)?;
        }
        if let (Some(ours), Some(theirs)) = (&self.bitfields, &other.bitfields) {
            ours.check_merge(theirs)?;
        }

        if other.head.is_some() {
            self.head = other.head;
        }
        if other.auth.is_some() {
            self.auth = other.auth;
        }
        if other.local_key_pair.is_some() {
            self.local_key_pair = other.local_key_pair;
        }
        if other.encryption_key.is_some() {
            self.encryption_key = other.encryption_key;
        }
        if other.data_info.is_some() {
            self.data_info = other.data_info;
        }

        merge_map(&mut self.user_data, other.user_data);
        merge_map(&mut self.tree_nodes, other.tree_nodes);
        merge_tip(&mut self.blocks, other.blocks)?;
        merge_tip(&mut self.bitfields, other.bitfields)?;
        Ok(())
    }

    /// Drops deletion markers. Only valid for the bottom layer, where there
    /// is nothing underneath for them to hide.
    pub(crate) fn prune_tombstones(&mut self) {
        if let Some(map) = &mut self.user_data {
            map.retain(|_, v| v.is_some());
        }
        if let Some(map) = &mut self.tree_nodes {
            map.retain(|_, v| v.is_some());
        }
    }

    // -- Layered lookups ----------------------------------------------------
    //
    // Outer `None`: this layer doesn't know, ask the one below.
    // `Some(None)`: this layer says the value is absent.

    pub fn block(&self, index: u64) -> Option<Option<Bytes>> {
        tip_lookup(self.blocks.as_ref()?, index)
    }

    pub fn bitfield_page(&self, page: u64) -> Option<Option<Bytes>> {
        tip_lookup(self.bitfields.as_ref()?, page)
    }

    pub fn tree_node(&self, index: u64) -> Option<Option<TreeNode>> {
        self.tree_nodes.as_ref()?.get(&index).copied()
    }

    pub fn user_data_entry(&self, key: &str) -> Option<Option<Bytes>> {
        self.user_data.as_ref()?.get(key).cloned()
    }
}

fn tip_lookup(tip: &TipList<Bytes>, index: u64) -> Option<Option<Bytes>> {
    if !tip.covers(index) {
        return None;
    }
    Some(tip.get(index).cloned())
}

fn merge_map<K: Ord, V>(ours: &mut Option<BTreeMap<K, V>>, theirs: Option<BTreeMap<K, V>>) {
    let Some(theirs) = theirs else { return };
    match ours {
        Some(map) => map.extend(theirs),
        None => *ours = Some(theirs),
    }
}

fn merge_tip<T>(ours: &mut Option<TipList<T>>, theirs: Option<TipList<T>>) -> Result<(), TipListError> {
    let Some(theirs) = theirs else { return Ok(()) };
    match ours {
        Some(list) => list.merge(theirs),
        None => {
            *ours = Some(theirs);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryOverlay
// ---------------------------------------------------------------------------

/// Uncommitted changes layered over another storage.
///
/// Reads see the layer first and fall through to the wrapped storage for
/// anything the layer doesn't cover. Nothing reaches the wrapped storage
/// until [`commit`](Self::commit).
///
/// Secondary batch registration, snapshots and the enumeration streams are
/// not supported yet and fail with [`StorageError::Unimplemented`].
pub struct MemoryOverlay {
    storage: Arc<dyn CoreStorage>,
    overlay: RwLock<StorageOverlay>,
}

impl MemoryOverlay {
    pub fn new(storage: Arc<dyn CoreStorage>) -> Self {
        Self {
            storage,
            overlay: RwLock::new(StorageOverlay::default()),
        }
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &Arc<dyn CoreStorage> {
        &self.storage
    }

    /// Copy of the pending layer.
    pub fn pending(&self) -> StorageOverlay {
        self.overlay.read().clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.overlay.read().is_empty()
    }

    /// Pushes the pending layer into the wrapped storage as one write.
    ///
    /// The layer is kept if the write fails.
    pub fn commit(&self) -> StorageResult<()> {
        let mut overlay = self.overlay.write();
        if overlay.is_empty() {
            return Ok(());
        }
        self.storage.apply(overlay.clone())?;
        *overlay = StorageOverlay::default();
        Ok(())
    }

    /// Throws the pending layer away.
    pub fn discard(&self) {
        *self.overlay.write() = StorageOverlay::default();
    }

    pub fn register_batch(&self) -> StorageResult<()> {
        Err(StorageError::Unimplemented("MemoryOverlay::register_batch"))
    }

    pub fn snapshot(&self) -> StorageResult<MemoryOverlay> {
        Err(StorageError::Unimplemented("MemoryOverlay::snapshot"))
    }

    pub fn block_stream(&self, _start: u64, _end: u64) -> StorageResult<Vec<(u64, Bytes)>> {
        Err(StorageError::Unimplemented("MemoryOverlay::block_stream"))
    }

    pub fn tree_node_stream(&self, _start: u64, _end: u64) -> StorageResult<Vec<TreeNode>> {
        Err(StorageError::Unimplemented("MemoryOverlay::tree_node_stream"))
    }

    pub fn user_data_stream(&self) -> StorageResult<Vec<(String, Bytes)>> {
        Err(StorageError::Unimplemented("MemoryOverlay::user_data_stream"))
    }

    pub fn bitfield_stream(&self) -> StorageResult<Vec<(u64, Bytes)>> {
        Err(StorageError::Unimplemented("MemoryOverlay::bitfield_stream"))
    }
}

impl CoreStorage for MemoryOverlay {
    fn read_batch(&self) -> Box<dyn ReadBatch + '_> {
        Box::new(OverlayReadBatch {
            overlay: &self.overlay,
            base: self.storage.read_batch(),
        })
    }

    fn write_batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    fn apply(&self, overlay: StorageOverlay) -> StorageResult<()> {
        self.overlay.write().merge(overlay)?;
        Ok(())
    }
}

struct OverlayReadBatch<'a> {
    overlay: &'a RwLock<StorageOverlay>,
    base: Box<dyn ReadBatch + 'a>,
}

impl ReadBatch for OverlayReadBatch<'_> {
    fn get_core_head(&self) -> StorageResult<Option<CoreHead>> {
        if let Some(head) = self.overlay.read().head.clone() {
            return Ok(Some(head));
        }
        self.base.get_core_head()
    }

    fn get_core_auth(&self) -> StorageResult<Option<CoreAuth>> {
        if let Some(auth) = self.overlay.read().auth.clone() {
            return Ok(Some(auth));
        }
        self.base.get_core_auth()
    }

    fn get_local_key_pair(&self) -> StorageResult<Option<LocalKeyPair>> {
        if let Some(kp) = self.overlay.read().local_key_pair.clone() {
            return Ok(Some(kp));
        }
        self.base.get_local_key_pair()
    }

    fn get_encryption_key(&self) -> StorageResult<Option<Bytes>> {
        if let Some(key) = self.overlay.read().encryption_key.clone() {
            return Ok(Some(key));
        }
        self.base.get_encryption_key()
    }

    fn get_data_info(&self) -> StorageResult<Option<DataInfo>> {
        if let Some(info) = self.overlay.read().data_info {
            return Ok(Some(info));
        }
        self.base.get_data_info()
    }

    fn get_user_data(&self, key: &str) -> StorageResult<Option<Bytes>> {
        match self.overlay.read().user_data_entry(key) {
            Some(value) => Ok(value),
            None => self.base.get_user_data(key),
        }
    }

    fn get_block(&self, index: u64) -> StorageResult<Option<Bytes>> {
        match self.overlay.read().block(index) {
            Some(value) => Ok(value),
            None => self.base.get_block(index),
        }
    }

    fn get_tree_node(&self, index: u64) -> StorageResult<Option<TreeNode>> {
        match self.overlay.read().tree_node(index) {
            Some(value) => Ok(value),
            None => self.base.get_tree_node(index),
        }
    }

    fn get_bitfield_page(&self, page: u64) -> StorageResult<Option<Bytes>> {
        match self.overlay.read().bitfield_page(page) {
            Some(value) => Ok(value),
            None => self.base.get_bitfield_page(page),
        }
    }

    fn try_flush(&self) {
        self.base.try_flush();
    }
}
