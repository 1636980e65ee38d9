//! # Writer
//!
//! The single owner of a log's mutations.
//!
//! Every append and truncation runs under one async mutex (the one guarding
//! the committed [`MerkleTree`]), so within a writer they are totally ordered
//! by lock acquisition. The guard is scoped: any `?` on the way out releases
//! it.
//!
//! ## Append
//!
//! ```text
//! lock
//!   stage blocks into a TreeBatch          (nothing committed yet)
//!   sign batch.signable()                  (or check a supplied signature)
//!   write blocks                           (write batch A)
//!   write head: fork, length, signature    (write batch B)
//!   mark bitfield, commit tree
//! unlock
//! publish Append / Upgrade / Range
//! flush deferred tree nodes + bitfield     (write batch C)
//! ```
//!
//! Blocks land before the signature, so a crash leaves bytes that can be
//! re-verified rather than a head pointing at nothing. Tree nodes and
//! bitfield pages are written last because both can be recomputed from the
//! head and the blocks; see [`MerkleTree::rebuild`].

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::config::{WriterConfig, BITFIELD_PAGE_BITS, STORAGE_VERSION};
use crate::crypto::{discovery_key, Hash, KeyPair, PublicKey, Signature};
use crate::error::{CoreError, CoreResult};
use crate::storage::{CoreAuth, CoreStorage, DataInfo, LocalKeyPair};
use crate::tree::{flat, MerkleTree, TreeBatch, TreeNode};

/// A block to append: bytes as-is, or a value to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    Raw(Bytes),
    Encoded(T),
}

impl<T> Payload<T> {
    pub fn raw(data: impl Into<Bytes>) -> Self {
        Payload::Raw(data.into())
    }
}

/// Resolves payloads to block bytes. Encodable values go through bincode.
pub fn encode_payloads<T: Serialize>(payloads: Vec<Payload<T>>) -> CoreResult<Vec<Bytes>> {
    payloads
        .into_iter()
        .map(|p| match p {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Encoded(value) => Ok(Bytes::from(bincode::serialize(&value)?)),
        })
        .collect()
}

/// Who signs the head an append produces.
#[derive(Debug, Clone, Default)]
pub enum HeadSigner {
    /// The keypair the writer was opened with.
    #[default]
    Own,
    /// Another keypair holding the log's secret key.
    KeyPair(KeyPair),
    /// A signature made elsewhere over the new head's signable.
    Signature(Signature),
}

/// Something that happened to the log, published after the mutation lock is
/// released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Blocks `[start, length)` were appended.
    Append {
        start: u64,
        length: u64,
        byte_length: u64,
    },
    /// The log was cut back to `length` on a new fork.
    Truncate { length: u64, fork: u64 },
    /// A new signed head exists.
    Upgrade {
        length: u64,
        fork: u64,
        root_hash: Hash,
        signature: Option<Signature>,
    },
    /// Blocks `[start, end)` are now available locally.
    Range { start: u64, end: u64 },
}

/// A snapshot of where the log stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    pub key: PublicKey,
    pub discovery_key: Hash,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub root_hash: Hash,
    pub writable: bool,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Log length after the append.
    pub length: u64,
    pub byte_length: u64,
}

pub struct Writer {
    storage: Arc<dyn CoreStorage>,
    key_pair: Option<KeyPair>,
    public_key: PublicKey,
    discovery_key: Hash,
    /// The mutation lock.
    tree: AsyncMutex<MerkleTree>,
    /// Copy of the committed tree for lock-free readers.
    committed: RwLock<MerkleTree>,
    bitfield: Mutex<Bitfield>,
    pending_nodes: Mutex<Vec<TreeNode>>,
    /// Serializes deferred flushes so an older page never lands after a newer one.
    deferred: Mutex<()>,
    events: broadcast::Sender<CoreEvent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.committed.read();
        f.debug_struct("Writer")
            .field("key", &self.public_key)
            .field("length", &tree.length)
            .field("fork", &tree.fork)
            .field("writable", &self.key_pair.is_some())
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Opens a writable log. First open stores the identity; later opens
    /// check the stored head against `key_pair`.
    pub fn open(storage: Arc<dyn CoreStorage>, key_pair: KeyPair) -> CoreResult<Self> {
        Self::open_with(storage, key_pair, WriterConfig::default())
    }

    pub fn open_with(
        storage: Arc<dyn CoreStorage>,
        key_pair: KeyPair,
        config: WriterConfig,
    ) -> CoreResult<Self> {
        let public_key = key_pair.public_key();
        Self::init(storage, Some(key_pair), public_key, config)
    }

    /// Opens a log that can be read and verified but not written.
    pub fn open_read_only(storage: Arc<dyn CoreStorage>, public_key: PublicKey) -> CoreResult<Self> {
        Self::init(storage, None, public_key, WriterConfig::default())
    }

    /// Reopens a log using the keypair stored with it, read-only if none was
    /// stored.
    pub fn resume(storage: Arc<dyn CoreStorage>) -> CoreResult<Self> {
        let (auth, local) = {
            let read = storage.read_batch();
            (read.get_core_auth()?, read.get_local_key_pair()?)
        };
        match (auth, local) {
            (_, Some(local)) => {
                let key_pair = KeyPair::from_parts(&local.public_key, &local.secret_key)?;
                Self::open(storage, key_pair)
            }
            (Some(auth), None) => Self::open_read_only(storage, auth.key),
            (None, None) => Err(CoreError::NotWritable),
        }
    }

    fn init(
        storage: Arc<dyn CoreStorage>,
        key_pair: Option<KeyPair>,
        public_key: PublicKey,
        config: WriterConfig,
    ) -> CoreResult<Self> {
        let (auth, local) = {
            let read = storage.read_batch();
            (read.get_core_auth()?, read.get_local_key_pair()?)
        };

        if let Some(auth) = &auth {
            if auth.key != public_key {
                return Err(CoreError::KeyMismatch);
            }
        }
        if let (Some(local), Some(_)) = (&local, &key_pair) {
            if local.public_key != public_key {
                return Err(CoreError::KeyMismatch);
            }
        }

        let discovery_key = discovery_key(&public_key);

        let mut write = storage.write_batch();
        if auth.is_none() {
            write.set_core_auth(CoreAuth {
                key: public_key,
                discovery_key,
            });
            write.set_data_info(DataInfo {
                version: STORAGE_VERSION,
            });
        }
        if let (None, Some(kp)) = (&local, &key_pair) {
            write.set_local_key_pair(LocalKeyPair {
                public_key,
                secret_key: kp.secret_key_bytes(),
            });
        }
        write.flush()?;

        let (tree, rebuilt, bitfield) = {
            let read = storage.read_batch();
            let (tree, rebuilt) = match MerkleTree::load(read.as_ref()) {
                Ok(tree) => (tree, Vec::new()),
                Err(CoreError::MissingTreeNode { index }) => {
                    warn!(index, "tree node missing on open, rebuilding from blocks");
                    MerkleTree::rebuild(read.as_ref())?
                }
                Err(CoreError::RootHashMismatch { length }) => {
                    warn!(
                        length,
                        "stored tree nodes disagree with head, rebuilding from blocks"
                    );
                    MerkleTree::rebuild(read.as_ref())?
                }
                Err(e) => return Err(e),
            };
            let bitfield = Bitfield::load(read.as_ref(), tree.length)?;
            (tree, rebuilt, bitfield)
        };

        if !tree.verify(&public_key) {
            return Err(CoreError::InvalidSignature {
                length: tree.length,
                fork: tree.fork,
            });
        }

        let mut bitfield = bitfield;
        reconcile_bitfield(&mut bitfield, tree.length);

        info!(
            key = %public_key,
            length = tree.length,
            fork = tree.fork,
            writable = key_pair.is_some(),
            "opened log"
        );

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let writer = Self {
            storage,
            key_pair,
            public_key,
            discovery_key,
            committed: RwLock::new(tree.clone()),
            tree: AsyncMutex::new(tree),
            bitfield: Mutex::new(bitfield),
            pending_nodes: Mutex::new(rebuilt),
            deferred: Mutex::new(()),
            events,
            closed: AtomicBool::new(false),
        };
        writer.flush_deferred()?;
        Ok(writer)
    }

    // -- Accessors ----------------------------------------------------------

    pub fn key(&self) -> PublicKey {
        self.public_key
    }

    pub fn discovery_key(&self) -> Hash {
        self.discovery_key
    }

    pub fn storage(&self) -> &Arc<dyn CoreStorage> {
        &self.storage
    }

    pub fn is_writable(&self) -> bool {
        self.key_pair.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn length(&self) -> u64 {
        self.committed.read().length
    }

    pub fn byte_length(&self) -> u64 {
        self.committed.read().byte_length
    }

    pub fn fork(&self) -> u64 {
        self.committed.read().fork
    }

    pub fn info(&self) -> CoreInfo {
        let tree = self.committed.read();
        CoreInfo {
            key: self.public_key,
            discovery_key: self.discovery_key,
            length: tree.length,
            byte_length: tree.byte_length,
            fork: tree.fork,
            root_hash: tree.hash(),
            writable: self.is_writable(),
        }
    }

    /// A tree batch on top of the committed tree, for previews.
    pub fn tree_batch(&self) -> TreeBatch {
        self.committed.read().batch()
    }

    /// Copy of the committed tree state.
    pub fn tree(&self) -> MerkleTree {
        self.committed.read().clone()
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    // -- Reads --------------------------------------------------------------

    /// Whether block `index` is held locally.
    pub fn has(&self, index: u64) -> bool {
        index < self.length() && self.bitfield.lock().get(index)
    }

    /// Block `index`, or `None` if the log doesn't have it.
    pub fn get(&self, index: u64) -> CoreResult<Option<Bytes>> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed);
        }
        if !self.has(index) {
            return Ok(None);
        }
        Ok(self.storage.read_batch().get_block(index)?)
    }

    // -- Mutations ----------------------------------------------------------

    /// Encodes and appends a run of payloads.
    pub async fn append<T: Serialize>(&self, payloads: Vec<Payload<T>>) -> CoreResult<AppendOutcome> {
        let blocks = encode_payloads(payloads)?;
        self.append_raw(blocks).await
    }

    /// Appends already-encoded blocks.
    pub async fn append_raw(&self, blocks: Vec<Bytes>) -> CoreResult<AppendOutcome> {
        let mut tree = self.tree.lock().await;
        let start = tree.length;
        let outcome = self.append_locked(&mut tree, blocks, &HeadSigner::Own)?;
        drop(tree);

        self.after_append(start, outcome);
        Ok(outcome)
    }

    /// Appends whatever `catch_up` returns for the committed tree.
    ///
    /// `catch_up` runs under the mutation lock, so the tree it sees cannot
    /// move before its blocks land. Returning `Ok(None)` appends nothing and
    /// yields `Ok(None)`; an error is passed straight back.
    pub async fn append_with_catch_up<F>(&self, catch_up: F) -> CoreResult<Option<AppendOutcome>>
    where
        F: FnOnce(&MerkleTree) -> CoreResult<Option<Vec<Bytes>>>,
    {
        self.append_signed_with_catch_up(&HeadSigner::Own, catch_up)
            .await
    }

    /// [`append_with_catch_up`](Self::append_with_catch_up) with the new head
    /// signed by `signer`.
    ///
    /// A read-only writer can append this way when handed the key or a
    /// signature. Either has to verify against the log's public key.
    pub async fn append_signed_with_catch_up<F>(
        &self,
        signer: &HeadSigner,
        catch_up: F,
    ) -> CoreResult<Option<AppendOutcome>>
    where
        F: FnOnce(&MerkleTree) -> CoreResult<Option<Vec<Bytes>>>,
    {
        let mut tree = self.tree.lock().await;
        self.check_signer(signer)?;
        let start = tree.length;
        let Some(blocks) = catch_up(&tree)? else {
            return Ok(None);
        };
        let outcome = self.append_locked(&mut tree, blocks, signer)?;
        drop(tree);

        self.after_append(start, outcome);
        Ok(Some(outcome))
    }

    fn append_locked(
        &self,
        tree: &mut MerkleTree,
        blocks: Vec<Bytes>,
        signer: &HeadSigner,
    ) -> CoreResult<AppendOutcome> {
        self.check_signer(signer)?;

        let start = tree.length;
        if blocks.is_empty() {
            return Ok(AppendOutcome {
                length: tree.length,
                byte_length: tree.byte_length,
            });
        }

        let mut batch = tree.batch();
        for block in &blocks {
            batch.append(block);
        }
        self.sign_batch(&mut batch, signer)?;

        let mut write = self.storage.write_batch();
        for (i, block) in blocks.into_iter().enumerate() {
            write.put_block(start + i as u64, block)?;
        }
        write.flush()?;

        let mut write = self.storage.write_batch();
        write.set_core_head(batch.head());
        write.flush()?;

        self.bitfield.lock().set_range(start, batch.length(), true);
        let nodes = batch.commit(tree);
        self.pending_nodes.lock().extend(nodes);
        *self.committed.write() = tree.clone();

        debug!(start, length = tree.length, "appended");
        Ok(AppendOutcome {
            length: tree.length,
            byte_length: tree.byte_length,
        })
    }

    fn after_append(&self, start: u64, outcome: AppendOutcome) {
        if outcome.length == start {
            return;
        }
        self.publish(CoreEvent::Append {
            start,
            length: outcome.length,
            byte_length: outcome.byte_length,
        });
        self.publish_upgrade();
        self.publish(CoreEvent::Range {
            start,
            end: outcome.length,
        });
        if let Err(e) = self.flush_deferred() {
            warn!(error = %e, "deferred flush after append failed");
        }
    }

    /// Cuts the log back to `length`. The fork is bumped unless one is given.
    pub async fn truncate(&self, length: u64, fork: Option<u64>) -> CoreResult<()> {
        let mut tree = self.tree.lock().await;
        let key_pair = self.ensure_writable()?;

        let old = tree.length;
        if length > old {
            return Err(CoreError::InvalidTruncation {
                length,
                current: old,
            });
        }

        // Truncation reads roots back from storage.
        self.flush_deferred()?;

        let fork = fork.unwrap_or(tree.fork + 1);
        let mut batch = {
            let read = self.storage.read_batch();
            tree.truncate(length, fork, read.as_ref())?
        };
        batch.sign(key_pair);

        let mut write = self.storage.write_batch();
        write.set_core_head(batch.head());
        write.flush()?;

        if length < old {
            let mut write = self.storage.write_batch();
            write.delete_block_range(length, old)?;
            write.delete_tree_node_range(2 * length, 2 * old);
            write.delete_tree_nodes(flat::straddling_parents(2 * length, 2 * old));
            write.flush()?;
        }

        self.bitfield.lock().set_range(length, old, false);
        batch.commit(&mut tree);
        *self.committed.write() = tree.clone();
        drop(tree);

        debug!(from = old, to = length, fork, "truncated");
        self.publish(CoreEvent::Truncate { length, fork });
        self.publish_upgrade();
        self.flush_deferred()?;
        Ok(())
    }

    /// Writes pending tree nodes and dirty bitfield pages.
    pub fn flush_deferred(&self) -> CoreResult<()> {
        let _guard = self.deferred.lock();

        let nodes = std::mem::take(&mut *self.pending_nodes.lock());
        let pages = self.bitfield.lock().take_dirty();
        if nodes.is_empty() && pages.is_empty() {
            return Ok(());
        }

        let page_numbers: Vec<u64> = pages.iter().map(|(p, _)| *p).collect();
        let result = (|| {
            let mut write = self.storage.write_batch();
            for node in &nodes {
                write.put_tree_node(*node);
            }
            for (page, data) in pages {
                write.put_bitfield_page(page, data)?;
            }
            write.flush()
        })();

        if let Err(e) = result {
            let mut pending = self.pending_nodes.lock();
            let newer = std::mem::replace(&mut *pending, nodes);
            pending.extend(newer);
            self.bitfield.lock().mark_dirty(page_numbers);
            return Err(e.into());
        }
        Ok(())
    }

    /// Flushes deferred state and refuses further use.
    pub async fn close(&self) -> CoreResult<()> {
        let _tree = self.tree.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush_deferred()
    }

    fn ensure_writable(&self) -> CoreResult<&KeyPair> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed);
        }
        self.key_pair.as_ref().ok_or(CoreError::NotWritable)
    }

    fn check_signer(&self, signer: &HeadSigner) -> CoreResult<()> {
        match signer {
            HeadSigner::Own => self.ensure_writable().map(|_| ()),
            _ if self.is_closed() => Err(CoreError::SessionClosed),
            HeadSigner::KeyPair(kp) if kp.public_key() != self.public_key => {
                Err(CoreError::KeyMismatch)
            }
            HeadSigner::KeyPair(_) | HeadSigner::Signature(_) => Ok(()),
        }
    }

    fn sign_batch(&self, batch: &mut TreeBatch, signer: &HeadSigner) -> CoreResult<()> {
        match signer {
            HeadSigner::Own => {
                batch.sign(self.ensure_writable()?);
            }
            HeadSigner::KeyPair(kp) => {
                batch.sign(kp);
            }
            HeadSigner::Signature(signature) => {
                if !self.public_key.verify(&batch.signable(), signature) {
                    return Err(CoreError::InvalidSignature {
                        length: batch.length(),
                        fork: batch.fork(),
                    });
                }
                batch.set_signature(signature.clone());
            }
        }
        Ok(())
    }

    fn publish(&self, event: CoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_upgrade(&self) {
        let tree = self.committed.read().clone();
        self.publish(CoreEvent::Upgrade {
            length: tree.length,
            fork: tree.fork,
            root_hash: tree.hash(),
            signature: tree.signature,
        });
    }
}

/// Brings loaded presence bits in line with `length`: bits past the end are
/// cleared, and a log whose last block isn't marked gets `[0, length)` set.
fn reconcile_bitfield(bitfield: &mut Bitfield, length: u64) {
    let page_end = length.div_ceil(BITFIELD_PAGE_BITS) * BITFIELD_PAGE_BITS;
    bitfield.set_range(length, page_end, false);
    if length > 0 && !bitfield.get(length - 1) {
        bitfield.set_range(0, length, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn memory() -> Arc<dyn CoreStorage> {
        Arc::new(MemoryStorage::new())
    }

    fn raw(blocks: &[&'static str]) -> Vec<Bytes> {
        blocks.iter().map(|b| Bytes::from_static(b.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        let out = writer.append_raw(raw(&["hello", "world"])).await.unwrap();
        assert_eq!(out.length, 2);
        assert_eq!(out.byte_length, 10);

        assert_eq!(writer.get(0).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(writer.get(1).unwrap().unwrap(), &b"world"[..]);
        assert!(writer.get(2).unwrap().is_none());
        assert!(writer.has(1));
        assert!(!writer.has(2));
    }

    #[tokio::test]
    async fn test_encoded_payloads() {
        #[derive(Serialize)]
        struct Msg {
            n: u32,
        }
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        writer
            .append(vec![Payload::Encoded(Msg { n: 7 }), Payload::raw("raw")])
            .await
            .unwrap();
        let encoded = writer.get(0).unwrap().unwrap();
        assert_eq!(encoded, Bytes::from(bincode::serialize(&7u32).unwrap()));
        assert_eq!(writer.get(1).unwrap().unwrap(), &b"raw"[..]);
    }

    #[tokio::test]
    async fn test_head_is_signed_and_reopens() {
        let storage = memory();
        let kp = KeyPair::generate();
        let writer = Writer::open(storage.clone(), kp.clone()).unwrap();
        writer.append_raw(raw(&["a", "b", "c"])).await.unwrap();
        let info = writer.info();
        writer.close().await.unwrap();

        let reopened = Writer::open(storage.clone(), kp).unwrap();
        assert_eq!(reopened.info(), info);

        let read_only = Writer::open_read_only(storage, info.key).unwrap();
        assert!(!read_only.is_writable());
        assert_eq!(read_only.length(), 3);
        assert!(matches!(
            read_only.append_raw(raw(&["x"])).await,
            Err(CoreError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let storage = memory();
        Writer::open(storage.clone(), KeyPair::generate()).unwrap();
        assert!(matches!(
            Writer::open(storage, KeyPair::generate()),
            Err(CoreError::KeyMismatch)
        ));
    }

    #[tokio::test]
    async fn test_resume_uses_stored_key() {
        let storage = memory();
        let kp = KeyPair::generate();
        Writer::open(storage.clone(), kp.clone())
            .unwrap()
            .append_raw(raw(&["a"]))
            .await
            .unwrap();

        let resumed = Writer::resume(storage).unwrap();
        assert!(resumed.is_writable());
        assert_eq!(resumed.key(), kp.public_key());
        assert!(matches!(Writer::resume(memory()), Err(CoreError::NotWritable)));
    }

    #[tokio::test]
    async fn test_truncate_bumps_fork_and_clears_tail() {
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        writer
            .append_raw(raw(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();
        let mut events = writer.subscribe();

        writer.truncate(2, None).await.unwrap();
        assert_eq!(writer.length(), 2);
        assert_eq!(writer.fork(), 1);
        assert_eq!(writer.byte_length(), 2);
        assert!(!writer.has(2));
        assert!(writer.get(3).unwrap().is_none());

        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Truncate { length: 2, fork: 1 }
        );

        // Same roots as a log that only ever held a, b.
        let fresh = Writer::open(memory(), KeyPair::generate()).unwrap();
        fresh.append_raw(raw(&["a", "b"])).await.unwrap();
        assert_eq!(writer.info().root_hash, fresh.info().root_hash);

        writer.append_raw(raw(&["z"])).await.unwrap();
        assert_eq!(writer.get(2).unwrap().unwrap(), &b"z"[..]);
    }

    #[tokio::test]
    async fn test_truncate_past_end_fails() {
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        writer.append_raw(raw(&["a"])).await.unwrap();
        assert!(matches!(
            writer.truncate(5, None).await,
            Err(CoreError::InvalidTruncation { length: 5, current: 1 })
        ));
    }

    #[tokio::test]
    async fn test_events_after_append() {
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        let mut events = writer.subscribe();
        writer.append_raw(raw(&["one", "two"])).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Append {
                start: 0,
                length: 2,
                byte_length: 6
            }
        );
        match events.recv().await.unwrap() {
            CoreEvent::Upgrade {
                length, signature, ..
            } => {
                assert_eq!(length, 2);
                assert!(signature.is_some());
            }
            other => panic!("expected upgrade, got {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Range { start: 0, end: 2 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_ordered() {
        let writer = Arc::new(Writer::open(memory(), KeyPair::generate()).unwrap());
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let w = writer.clone();
            handles.push(tokio::spawn(async move {
                w.append_raw(vec![Bytes::from(vec![i])]).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(writer.length(), 8);
        let mut seen: Vec<u8> = (0..8).map(|i| writer.get(i).unwrap().unwrap()[0]).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_external_signers() {
        let storage = memory();
        let kp = KeyPair::generate();
        Writer::open(storage.clone(), kp.clone()).unwrap();
        let ro = Writer::open_read_only(storage.clone(), kp.public_key()).unwrap();

        let out = ro
            .append_signed_with_catch_up(&HeadSigner::KeyPair(kp.clone()), |_| {
                Ok(Some(raw(&["a"])))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.length, 1);

        // Sign the next head out of band.
        let mut preview = ro.tree_batch();
        preview.append(b"b");
        let signature = kp.sign(&preview.signable());
        ro.append_signed_with_catch_up(&HeadSigner::Signature(signature.clone()), |_| {
            Ok(Some(raw(&["b"])))
        })
        .await
        .unwrap();
        assert_eq!(ro.length(), 2);

        // Same signature over a different head.
        assert!(matches!(
            ro.append_signed_with_catch_up(&HeadSigner::Signature(signature), |_| {
                Ok(Some(raw(&["c"])))
            })
            .await,
            Err(CoreError::InvalidSignature { length: 3, .. })
        ));
        assert!(ro.get(2).unwrap().is_none());

        assert!(matches!(
            ro.append_signed_with_catch_up(&HeadSigner::KeyPair(KeyPair::generate()), |_| {
                Ok(Some(raw(&["c"])))
            })
            .await,
            Err(CoreError::KeyMismatch)
        ));
        assert!(matches!(
            ro.append_raw(raw(&["c"])).await,
            Err(CoreError::NotWritable)
        ));

        let reopened = Writer::open_read_only(storage, kp.public_key()).unwrap();
        assert_eq!(reopened.length(), 2);
    }

    #[tokio::test]
    async fn test_closed_writer_refuses_work() {
        let writer = Writer::open(memory(), KeyPair::generate()).unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());
        assert!(matches!(writer.get(0), Err(CoreError::SessionClosed)));
        assert!(matches!(
            writer.append_raw(raw(&["x"])).await,
            Err(CoreError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_missing_tree_nodes_are_rebuilt() {
        let storage = memory();
        let kp = KeyPair::generate();
        let writer = Writer::open(storage.clone(), kp.clone()).unwrap();
        writer.append_raw(raw(&["a", "b", "c"])).await.unwrap();
        let root = writer.info().root_hash;
        drop(writer);

        // Lose the root nodes, as if the deferred flush never happened.
        let mut write = storage.write_batch();
        write.delete_tree_node_range(0, 6);
        write.flush().unwrap();

        let reopened = Writer::open(storage.clone(), kp).unwrap();
        assert_eq!(reopened.info().root_hash, root);
        assert!(storage.read_batch().has_tree_node(1).unwrap());
    }

    /// Memory storage whose tree-node writes can be made to fail.
    struct LossyNodes {
        inner: Arc<MemoryStorage>,
        fail: AtomicBool,
    }

    impl CoreStorage for LossyNodes {
        fn read_batch(&self) -> Box<dyn crate::storage::ReadBatch + '_> {
            self.inner.read_batch()
        }

        fn write_batch(&self) -> crate::storage::WriteBatch<'_> {
            crate::storage::WriteBatch::new(self)
        }

        fn apply(&self, overlay: crate::storage::StorageOverlay) -> crate::storage::StorageResult<()> {
            let puts_nodes = overlay
                .tree_nodes
                .as_ref()
                .is_some_and(|nodes| nodes.values().any(Option::is_some));
            if puts_nodes && self.fail.load(Ordering::Acquire) {
                return Err(std::io::Error::other("tree node write lost").into());
            }
            self.inner.apply(overlay)
        }
    }

    #[tokio::test]
    async fn test_truncate_drops_parents_spanning_the_cut() {
        let storage = Arc::new(LossyNodes {
            inner: Arc::new(MemoryStorage::new()),
            fail: AtomicBool::new(false),
        });
        let kp = KeyPair::generate();
        let writer = Writer::open(storage.clone(), kp.clone()).unwrap();
        writer.append_raw(raw(&["a", "b", "c", "d", "e"])).await.unwrap();
        writer.truncate(3, None).await.unwrap();
        writer.flush_deferred().unwrap();

        {
            let read = storage.read_batch();
            assert!(read.has_tree_node(1).unwrap());
            assert!(read.has_tree_node(4).unwrap());
            assert!(!read.has_tree_node(3).unwrap());
            assert!(!read.has_tree_node(5).unwrap());
        }

        // The append lands but its tree nodes never reach storage.
        storage.fail.store(true, Ordering::Release);
        writer.append_raw(raw(&["X"])).await.unwrap();
        let root = writer.info().root_hash;
        drop(writer);

        let reopened = Writer::open(storage.inner.clone(), kp).unwrap();
        assert_eq!(reopened.length(), 4);
        assert_eq!(reopened.fork(), 1);
        assert_eq!(reopened.info().root_hash, root);
        assert_eq!(reopened.get(3).unwrap().unwrap(), &b"X"[..]);
    }

    #[tokio::test]
    async fn test_stale_tree_node_is_rebuilt() {
        let storage = memory();
        let kp = KeyPair::generate();
        let writer = Writer::open(storage.clone(), kp.clone()).unwrap();
        writer.append_raw(raw(&["a", "b"])).await.unwrap();
        let root = writer.info().root_hash;
        writer.close().await.unwrap();
        drop(writer);

        // A root node left over from some other history.
        let stale = TreeNode::parent_of(&TreeNode::leaf(0, b"x"), &TreeNode::leaf(1, b"y"));
        let mut write = storage.write_batch();
        write.put_tree_node(stale);
        write.flush().unwrap();

        let reopened = Writer::open(storage.clone(), kp).unwrap();
        assert_eq!(reopened.info().root_hash, root);
        assert_ne!(storage.read_batch().get_tree_node(1).unwrap(), Some(stale));
    }
}
