//! # DiskStorage
//!
//! Persistent storage for a single log, split by how the data behaves:
//!
//! | Where            | What                                   | Encoding          |
//! |------------------|----------------------------------------|-------------------|
//! | sled `blocks`    | block index (8B BE) → raw block bytes  | raw               |
//! | sled `tree`      | flat index (8B BE) → node              | `bincode(TreeNode)` |
//! | sled `bitfield`  | page number (8B BE) → page bytes       | raw               |
//! | sled `user_data` | key (UTF-8) → value                    | raw               |
//! | `oplog` file     | head, auth, keypair, encryption key, data info | `bincode(Metadata)` |
//!
//! Indices are big-endian so sled's lexicographic order is numeric order and
//! tail truncation is one range scan.
//!
//! ## Write ordering
//!
//! `apply` writes bulk data to sled and flushes it *before* it appends the
//! metadata entry to the oplog. A crash in between leaves blocks nobody has
//! signed for yet, never a head pointing at blocks that aren't there.
//!
//! The oplog header always holds the complete metadata snapshot; entries are
//! partial updates on top. Once the entries pass `checkpoint_bytes` the
//! snapshot is flushed as a new header, which already contains every
//! dropped entry.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::overlay::StorageOverlay;
use super::tiplist::TipList;
use super::{
    CoreAuth, CoreHead, CoreStorage, DataInfo, LocalKeyPair, ReadBatch, StorageResult, WriteBatch,
};
use crate::config::{DiskConfig, OplogConfig};
use crate::oplog::Oplog;
use crate::tree::TreeNode;

const OPLOG_FILE: &str = "oplog";
const DB_DIR: &str = "db";

/// Scalar state kept in the oplog. As a header every field is the current
/// value; as an entry `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Metadata {
    head: Option<CoreHead>,
    auth: Option<CoreAuth>,
    local_key_pair: Option<LocalKeyPair>,
    encryption_key: Option<Bytes>,
    data_info: Option<DataInfo>,
}

impl Metadata {
    fn from_overlay(overlay: &mut StorageOverlay) -> Self {
        Self {
            head: overlay.head.take(),
            auth: overlay.auth.take(),
            local_key_pair: overlay.local_key_pair.take(),
            encryption_key: overlay.encryption_key.take(),
            data_info: overlay.data_info.take(),
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn update(&mut self, other: Metadata) {
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
    }
}

struct MetaLog {
    oplog: Oplog<File, Metadata, Metadata>,
    state: Metadata,
}

/// On-disk storage for one log, rooted at a directory.
pub struct DiskStorage {
    path: PathBuf,
    db: Db,
    blocks: Tree,
    tree_nodes: Tree,
    bitfield: Tree,
    user_data: Tree,
    meta: Mutex<MetaLog>,
    config: DiskConfig,
}

impl std::fmt::Debug for DiskStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStorage")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiskStorage {
    /// Opens (or creates) the storage in `dir` with default settings.
    pub fn open<P: AsRef<Path>>(dir: P) -> StorageResult<Self> {
        Self::open_with(dir, DiskConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, config: DiskConfig) -> StorageResult<Self> {
        let path = dir.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let db = sled::open(path.join(DB_DIR))?;
        let blocks = db.open_tree("blocks")?;
        let tree_nodes = db.open_tree("tree")?;
        let bitfield = db.open_tree("bitfield")?;
        let user_data = db.open_tree("user_data")?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(OPLOG_FILE))?;
        let (mut oplog, recovered) = Oplog::<File, Metadata, Metadata>::open(
            file,
            OplogConfig {
                page_size: config.page_size,
            },
        )?;

        let state = match recovered.header {
            Some(mut state) => {
                for entry in recovered.entries {
                    state.update(entry);
                }
                state
            }
            None => {
                let state = Metadata::default();
                oplog.flush(&state)?;
                state
            }
        };

        info!(
            path = %path.display(),
            length = state.head.as_ref().map_or(0, |h| h.length),
            blocks = blocks.len(),
            "opened disk storage"
        );

        Ok(Self {
            path,
            db,
            blocks,
            tree_nodes,
            bitfield,
            user_data,
            meta: Mutex::new(MetaLog { oplog, state }),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks on disk.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes of metadata entries waiting for the next checkpoint.
    pub fn pending_metadata_bytes(&self) -> u64 {
        self.meta.lock().oplog.byte_length()
    }

    /// Forces a metadata checkpoint and flushes sled.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.db.flush()?;
        let mut meta = self.meta.lock();
        let snapshot = meta.state.clone();
        meta.oplog.flush(&snapshot)?;
        Ok(())
    }

    fn write_bulk(&self, overlay: &StorageOverlay) -> StorageResult<bool> {
        let mut touched = false;

        if let Some(blocks) = &overlay.blocks {
            apply_tip(&self.blocks, blocks)?;
            touched = true;
        }
        if let Some(pages) = &overlay.bitfields {
            apply_tip(&self.bitfield, pages)?;
            touched = true;
        }

        if let Some(nodes) = &overlay.tree_nodes {
            let mut batch = Batch::default();
            for (index, node) in nodes {
                match node {
                    Some(node) => batch.insert(&index.to_be_bytes(), bincode::serialize(node)?),
                    None => batch.remove(&index.to_be_bytes()),
                }
            }
            self.tree_nodes.apply_batch(batch)?;
            touched = true;
        }

        if let Some(entries) = &overlay.user_data {
            let mut batch = Batch::default();
            for (key, value) in entries {
                match value {
                    Some(value) => batch.insert(key.as_bytes(), value.as_ref()),
                    None => batch.remove(key.as_bytes()),
                }
            }
            self.user_data.apply_batch(batch)?;
            touched = true;
        }

        if touched {
            self.db.flush()?;
        }
        Ok(touched)
    }
}

/// Replays a tip list onto a sled tree: drop everything from the truncation
/// point, then write the buffered run.
fn apply_tip(tree: &Tree, tip: &TipList<Bytes>) -> StorageResult<()> {
    let mut batch = Batch::default();

    if let Some(from) = tip.truncated_from() {
        for key in tree.range(from.to_be_bytes()..).keys() {
            batch.remove(key?);
        }
    }
    for (index, value) in tip.iter() {
        batch.insert(&index.to_be_bytes(), value.as_ref());
    }

    tree.apply_batch(batch)?;
    Ok(())
}

impl CoreStorage for DiskStorage {
    fn read_batch(&self) -> Box<dyn ReadBatch + '_> {
        Box::new(DiskReadBatch { storage: self })
    }

    fn write_batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    fn apply(&self, mut overlay: StorageOverlay) -> StorageResult<()> {
        let update = Metadata::from_overlay(&mut overlay);
        self.write_bulk(&overlay)?;

        if update.is_empty() {
            return Ok(());
        }

        let mut meta = self.meta.lock();
        meta.oplog.append(&update)?;
        meta.state.update(update);

        if meta.oplog.byte_length() >= self.config.checkpoint_bytes {
            let snapshot = meta.state.clone();
            meta.oplog.flush(&snapshot)?;
            debug!(path = %self.path.display(), "metadata checkpoint");
        }
        Ok(())
    }
}

struct DiskReadBatch<'a> {
    storage: &'a DiskStorage,
}

fn get_raw(tree: &Tree, key: impl AsRef<[u8]>) -> StorageResult<Option<Bytes>> {
    Ok(tree.get(key)?.map(|v| Bytes::copy_from_slice(&v)))
}

impl ReadBatch for DiskReadBatch<'_> {
    fn get_core_head(&self) -> StorageResult<Option<CoreHead>> {
        Ok(self.storage.meta.lock().state.head.clone())
    }

    fn get_core_auth(&self) -> StorageResult<Option<CoreAuth>> {
        Ok(self.storage.meta.lock().state.auth.clone())
    }

    fn get_local_key_pair(&self) -> StorageResult<Option<LocalKeyPair>> {
        Ok(self.storage.meta.lock().state.local_key_pair.clone())
    }

    fn get_encryption_key(&self) -> StorageResult<Option<Bytes>> {
        Ok(self.storage.meta.lock().state.encryption_key.clone())
    }

    fn get_data_info(&self) -> StorageResult<Option<DataInfo>> {
        Ok(self.storage.meta.lock().state.data_info)
    }

    fn get_user_data(&self, key: &str) -> StorageResult<Option<Bytes>> {
        get_raw(&self.storage.user_data, key.as_bytes())
    }

    fn has_block(&self, index: u64) -> StorageResult<bool> {
        Ok(self.storage.blocks.contains_key(index.to_be_bytes())?)
    }

    fn get_block(&self, index: u64) -> StorageResult<Option<Bytes>> {
        get_raw(&self.storage.blocks, index.to_be_bytes())
    }

    fn has_tree_node(&self, index: u64) -> StorageResult<bool> {
        Ok(self.storage.tree_nodes.contains_key(index.to_be_bytes())?)
    }

    fn get_tree_node(&self, index: u64) -> StorageResult<Option<TreeNode>> {
        match self.storage.tree_nodes.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_bitfield_page(&self, page: u64) -> StorageResult<Option<Bytes>> {
        get_raw(&self.storage.bitfield, page.to_be_bytes())
    }
}
