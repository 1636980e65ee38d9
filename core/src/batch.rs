//! # Batch
//!
//! A write session that buffers appends in memory until flushed.
//!
//! Reads below the length the batch was opened at go to the [`Writer`];
//! reads inside the buffer are served from it. Nothing touches storage until
//! [`flush`](Batch::flush).
//!
//! ## Flushing against a moving log
//!
//! Another session may append to the same writer while this batch is
//! buffering. `flush` hands the writer a catch-up hook that runs under the
//! writer's lock and sees the durable length at that moment:
//!
//! ```text
//! base = length when the batch last synced     count = blocks to flush
//!
//! durable == base            append buffer[..count]
//! base < durable ≤ base+count  skip buffer[..durable-base], append the rest
//! durable > base+count       nothing lands, flush returns false
//! ```
//!
//! Skipping is only allowed when the committed blocks are the ones buffered:
//! the hook replays the skipped prefix onto the tree the batch was built on
//! and compares root hashes with the committed tree. A different prefix means
//! another session wrote something else, and nothing lands. A changed fork is
//! an error.
//!
//! Flushes on the same batch queue behind each other. Flushes on different
//! batches only meet at the writer's lock.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::tree::{MerkleTree, TreeBatch};
use crate::writer::{encode_payloads, HeadSigner, Payload, Writer};

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Close the batch after the first flush that lands.
    pub auto_close: bool,
}

/// What [`Batch::flush_with`] commits and who signs the resulting head.
#[derive(Debug, Clone, Default)]
pub struct FlushOptions {
    /// Flush up to this length instead of the whole buffer.
    pub length: Option<u64>,
    pub signer: HeadSigner,
}

#[derive(Debug)]
struct BatchState {
    /// The committed tree this batch last synced with.
    base: MerkleTree,
    blocks: Vec<Bytes>,
    buffered_bytes: u64,
    closed: bool,
}

impl BatchState {
    fn length(&self) -> u64 {
        self.base.length + self.blocks.len() as u64
    }

    fn rebase(&mut self, base: MerkleTree) {
        self.base = base;
        self.blocks.clear();
        self.buffered_bytes = 0;
    }
}

#[derive(Debug)]
pub struct Batch {
    writer: Arc<Writer>,
    state: Mutex<BatchState>,
    flush_lock: AsyncMutex<()>,
    options: BatchOptions,
}

impl Batch {
    pub fn new(writer: Arc<Writer>) -> CoreResult<Self> {
        Self::with_options(writer, BatchOptions::default())
    }

    pub fn with_options(writer: Arc<Writer>, options: BatchOptions) -> CoreResult<Self> {
        if writer.is_closed() {
            return Err(CoreError::SessionClosed);
        }
        if !writer.is_writable() {
            return Err(CoreError::NotWritable);
        }

        let base = writer.tree();
        Ok(Self {
            writer,
            state: Mutex::new(BatchState {
                base,
                blocks: Vec::new(),
                buffered_bytes: 0,
                closed: false,
            }),
            flush_lock: AsyncMutex::new(()),
            options,
        })
    }

    /// Committed length this batch builds on plus everything buffered.
    pub fn length(&self) -> u64 {
        self.state.lock().length()
    }

    pub fn byte_length(&self) -> u64 {
        let state = self.state.lock();
        state.base.byte_length + state.buffered_bytes
    }

    pub fn fork(&self) -> u64 {
        self.state.lock().base.fork
    }

    /// Number of blocks waiting for a flush.
    pub fn buffered(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(&self, state: &BatchState) -> CoreResult<()> {
        if state.closed {
            return Err(CoreError::BatchClosed);
        }
        if self.writer.is_closed() {
            return Err(CoreError::SessionClosed);
        }
        Ok(())
    }

    /// Buffers blocks. Returns the new length.
    pub fn append(&self, blocks: Vec<Bytes>) -> CoreResult<u64> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !self.writer.is_writable() {
            return Err(CoreError::NotWritable);
        }
        for block in blocks {
            state.buffered_bytes += block.len() as u64;
            state.blocks.push(block);
        }
        Ok(state.length())
    }

    /// Encodes and buffers payloads.
    pub fn append_payloads<T: Serialize>(&self, payloads: Vec<Payload<T>>) -> CoreResult<u64> {
        self.append(encode_payloads(payloads)?)
    }

    /// Reads a block from the buffer or the underlying log.
    pub fn get(&self, index: u64) -> CoreResult<Bytes> {
        let (base, buffered) = {
            let state = self.state.lock();
            self.check_open(&state)?;
            let buffered = index
                .checked_sub(state.base.length)
                .and_then(|i| state.blocks.get(i as usize).cloned());
            (state.base.length, buffered)
        };

        if let Some(block) = buffered {
            return Ok(block);
        }
        if index < base {
            if let Some(block) = self.writer.get(index)? {
                return Ok(block);
            }
        }
        Err(CoreError::BlockNotAvailable { index })
    }

    /// Previews the tree the log would have at `length` if this batch's
    /// buffer, then `extra`, were appended.
    ///
    /// `length` defaults to everything. Returns `None` when the preview can't
    /// be built: the writer has moved since the batch last synced, or
    /// `length` is outside `[base, length + extra.len()]`.
    pub fn create_tree_batch(&self, length: Option<u64>, extra: &[Bytes]) -> Option<TreeBatch> {
        let state = self.state.lock();
        let current = state.length();
        let max = current + extra.len() as u64;
        let length = length.unwrap_or(max);

        let len = length.min(current);
        if len < state.base.length || length > max {
            return None;
        }

        let mut batch = self.writer.tree_batch();
        if batch.length() != state.base.length
            || batch.fork() != state.base.fork
            || batch.hash() != state.base.hash()
        {
            return None;
        }

        for block in &state.blocks[..(len - state.base.length) as usize] {
            batch.append(block);
        }
        if len < current {
            return Some(batch);
        }
        for block in &extra[..(length - len) as usize] {
            batch.append(block);
        }
        Some(batch)
    }

    /// Shrinks the batch to `length`.
    ///
    /// Within the buffer this only drops buffered blocks. Going below the
    /// committed length truncates the log itself and needs `force`.
    pub async fn truncate(&self, length: u64, force: bool) -> CoreResult<()> {
        let _flush = self.flush_lock.lock().await;

        let base = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            let current = state.length();
            if length > current {
                return Err(CoreError::InvalidTruncation { length, current });
            }
            if length >= state.base.length {
                let keep = (length - state.base.length) as usize;
                let dropped: u64 = state.blocks[keep..].iter().map(|b| b.len() as u64).sum();
                state.blocks.truncate(keep);
                state.buffered_bytes -= dropped;
                return Ok(());
            }
            if !force {
                return Err(CoreError::TruncateRequiresForce {
                    length,
                    committed: state.base.length,
                });
            }
            state.base.length
        };

        debug!(from = base, to = length, "batch rolling back committed blocks");
        self.writer.truncate(length, None).await?;

        let tree = self.writer.tree();
        self.state.lock().rebase(tree);
        Ok(())
    }

    /// Commits buffered blocks up to `length` (default: all of them).
    ///
    /// Returns `Ok(true)` when they landed and `Ok(false)` when another
    /// writer already took the log past them.
    pub async fn flush(&self, length: Option<u64>) -> CoreResult<bool> {
        self.flush_with(FlushOptions {
            length,
            ..Default::default()
        })
        .await
    }

    /// [`flush`](Self::flush) with a caller-chosen head signer.
    ///
    /// A [`HeadSigner::Signature`] has to cover the head the flush will
    /// produce, which [`create_tree_batch`](Self::create_tree_batch) previews.
    pub async fn flush_with(&self, options: FlushOptions) -> CoreResult<bool> {
        let FlushOptions { length, signer } = options;
        let _flush = self.flush_lock.lock().await;

        let (base, pending) = {
            let state = self.state.lock();
            self.check_open(&state)?;
            let wanted = length.unwrap_or_else(|| state.length());
            let count = wanted
                .saturating_sub(state.base.length)
                .min(state.blocks.len() as u64) as usize;
            (state.base.clone(), state.blocks[..count].to_vec())
        };

        if pending.is_empty() {
            self.maybe_auto_close();
            return Ok(true);
        }

        let count = pending.len() as u64;
        let start = base.length;
        let mut target = base.clone();
        {
            let mut batch = base.batch();
            for block in &pending {
                batch.append(block);
            }
            batch.commit(&mut target);
        }

        let outcome = self
            .writer
            .append_signed_with_catch_up(&signer, move |durable| {
                catch_up(&base, &pending, durable)
            })
            .await?;

        let Some(outcome) = outcome else {
            debug!(base = start, count, "batch flush overtaken");
            return Ok(false);
        };

        {
            let mut state = self.state.lock();
            let flushed: u64 = state.blocks[..count as usize]
                .iter()
                .map(|b| b.len() as u64)
                .sum();
            state.blocks.drain(..count as usize);
            state.buffered_bytes -= flushed;
            state.base = target;
        }

        debug!(length = outcome.length, "batch flushed");
        self.maybe_auto_close();
        Ok(true)
    }

    fn maybe_auto_close(&self) {
        if self.options.auto_close {
            self.close();
        }
    }

    /// Drops anything still buffered and refuses further use.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.blocks.clear();
        state.buffered_bytes = 0;
    }
}

/// Decides, under the writer lock, which of `pending` still has to be
/// appended on top of `durable`.
///
/// `None` when the log moved past the pending blocks or committed different
/// ones over the shared range.
fn catch_up(
    base: &MerkleTree,
    pending: &[Bytes],
    durable: &MerkleTree,
) -> CoreResult<Option<Vec<Bytes>>> {
    if durable.fork != base.fork {
        return Err(CoreError::ForkMismatch {
            expected: base.fork,
            actual: durable.fork,
        });
    }
    let count = pending.len() as u64;
    if durable.length < base.length || durable.length > base.length + count {
        return Ok(None);
    }

    let skip = (durable.length - base.length) as usize;
    let mut replay = base.batch();
    for block in &pending[..skip] {
        replay.append(block);
    }
    if replay.hash() != durable.hash() {
        debug!(
            base = base.length,
            durable = durable.length,
            "committed prefix differs from batch"
        );
        return Ok(None);
    }
    Ok(Some(pending[skip..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::storage::{CoreStorage, MemoryStorage};

    fn writer() -> Arc<Writer> {
        let storage: Arc<dyn CoreStorage> = Arc::new(MemoryStorage::new());
        Arc::new(Writer::open(storage, KeyPair::generate()).unwrap())
    }

    fn blocks(values: &[&'static str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_partial_flush_keeps_rest_buffered() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["hello", "world"])).unwrap();
        assert_eq!(batch.length(), 2);
        assert_eq!(writer.length(), 0);

        assert!(batch.flush(Some(1)).await.unwrap());
        assert_eq!(writer.length(), 1);
        assert_eq!(batch.buffered(), 1);
        assert_eq!(batch.length(), writer.length() + batch.buffered() as u64);
        assert_eq!(batch.get(0).unwrap(), &b"hello"[..]);
        assert_eq!(batch.get(1).unwrap(), &b"world"[..]);

        assert!(batch.flush(None).await.unwrap());
        assert_eq!(writer.length(), 2);
        assert_eq!(batch.buffered(), 0);
        assert_eq!(batch.length(), 2);
        assert_eq!(batch.byte_length(), writer.byte_length());
    }

    #[tokio::test]
    async fn test_get_out_of_range_is_not_available() {
        let writer = writer();
        writer.append_raw(blocks(&["a"])).await.unwrap();
        let batch = Batch::new(writer).unwrap();
        batch.append(blocks(&["b"])).unwrap();

        assert_eq!(batch.get(0).unwrap(), &b"a"[..]);
        assert_eq!(batch.get(1).unwrap(), &b"b"[..]);
        assert!(matches!(
            batch.get(2),
            Err(CoreError::BlockNotAvailable { index: 2 })
        ));
    }

    #[tokio::test]
    async fn test_closed_batch_and_closed_session_differ() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.close();
        assert!(matches!(batch.get(0), Err(CoreError::BatchClosed)));
        assert!(matches!(
            batch.append(blocks(&["x"])),
            Err(CoreError::BatchClosed)
        ));

        let other = Batch::new(writer.clone()).unwrap();
        writer.close().await.unwrap();
        assert!(matches!(other.get(0), Err(CoreError::SessionClosed)));
        assert!(matches!(
            Batch::new(writer),
            Err(CoreError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_only_writer_rejected() {
        let storage: Arc<dyn CoreStorage> = Arc::new(MemoryStorage::new());
        let kp = KeyPair::generate();
        let ro = Writer::open_read_only(storage, kp.public_key()).unwrap();
        assert!(matches!(
            Batch::new(Arc::new(ro)),
            Err(CoreError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn test_catch_up_skips_already_committed_prefix() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a", "b", "c"])).unwrap();

        // Someone else commits the first block while we buffer.
        writer.append_raw(blocks(&["a"])).await.unwrap();

        assert!(batch.flush(None).await.unwrap());
        assert_eq!(writer.length(), 3);
        assert_eq!(writer.get(1).unwrap().unwrap(), &b"b"[..]);
        assert_eq!(writer.get(2).unwrap().unwrap(), &b"c"[..]);
        assert_eq!(batch.length(), 3);
    }

    #[tokio::test]
    async fn test_catch_up_refuses_different_prefix() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a", "b", "c"])).unwrap();

        writer.append_raw(blocks(&["X"])).await.unwrap();

        assert!(!batch.flush(None).await.unwrap());
        assert_eq!(writer.length(), 1);
        assert_eq!(writer.get(0).unwrap().unwrap(), &b"X"[..]);
        assert_eq!(batch.buffered(), 3);
        assert_eq!(batch.get(0).unwrap(), &b"a"[..]);
    }

    #[tokio::test]
    async fn test_rewritten_log_at_same_length_is_detected() {
        let writer = writer();
        writer.append_raw(blocks(&["a", "b"])).await.unwrap();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["c"])).unwrap();

        // Same fork and length, different content.
        writer.truncate(1, Some(0)).await.unwrap();
        writer.append_raw(blocks(&["B"])).await.unwrap();
        assert_eq!(writer.length(), 2);

        assert!(!batch.flush(None).await.unwrap());
        assert_eq!(writer.length(), 2);
        assert_eq!(batch.buffered(), 1);
        assert!(batch.create_tree_batch(None, &[]).is_none());
    }

    #[tokio::test]
    async fn test_flush_overtaken_reports_false() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a"])).unwrap();

        writer.append_raw(blocks(&["x", "y"])).await.unwrap();

        assert!(!batch.flush(None).await.unwrap());
        assert_eq!(writer.length(), 2);
        assert_eq!(batch.buffered(), 1);
    }

    #[tokio::test]
    async fn test_tree_batch_preview_matches_commit() {
        let writer = writer();
        writer.append_raw(blocks(&["a"])).await.unwrap();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["b", "c"])).unwrap();

        let extra = blocks(&["d"]);
        let preview = batch.create_tree_batch(None, &extra).unwrap();
        assert_eq!(preview.length(), 4);

        let partial = batch.create_tree_batch(Some(2), &[]).unwrap();
        assert_eq!(partial.length(), 2);

        assert!(batch.create_tree_batch(Some(0), &[]).is_none());
        assert!(batch.create_tree_batch(Some(9), &extra).is_none());

        batch.append(extra).unwrap();
        batch.flush(None).await.unwrap();
        assert_eq!(writer.info().root_hash, preview.hash());
    }

    #[tokio::test]
    async fn test_truncate_inside_buffer() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a", "bb", "ccc"])).unwrap();
        batch.truncate(1, false).await.unwrap();
        assert_eq!(batch.length(), 1);
        assert_eq!(batch.byte_length(), 1);
        assert_eq!(writer.length(), 0);
    }

    #[tokio::test]
    async fn test_truncate_committed_requires_force() {
        let writer = writer();
        writer.append_raw(blocks(&["a", "b", "c"])).await.unwrap();
        let batch = Batch::new(writer.clone()).unwrap();

        assert!(matches!(
            batch.truncate(1, false).await,
            Err(CoreError::TruncateRequiresForce {
                length: 1,
                committed: 3
            })
        ));
        assert_eq!(writer.length(), 3);

        batch.truncate(1, true).await.unwrap();
        assert_eq!(writer.length(), 1);
        assert_eq!(batch.length(), 1);
        assert_eq!(batch.fork(), 1);

        batch.append(blocks(&["z"])).unwrap();
        assert!(batch.flush(None).await.unwrap());
        assert_eq!(writer.get(1).unwrap().unwrap(), &b"z"[..]);
    }

    #[tokio::test]
    async fn test_fork_change_is_detected() {
        let writer = writer();
        writer.append_raw(blocks(&["a", "b"])).await.unwrap();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["c"])).unwrap();

        writer.truncate(1, None).await.unwrap();
        assert!(matches!(
            batch.flush(None).await,
            Err(CoreError::ForkMismatch {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_auto_close_after_flush() {
        let writer = writer();
        let batch = Batch::with_options(writer, BatchOptions { auto_close: true }).unwrap();
        batch.append(blocks(&["a"])).unwrap();
        assert!(batch.flush(None).await.unwrap());
        assert!(batch.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_on_one_batch() {
        let writer = writer();
        let batch = Arc::new(Batch::new(writer.clone()).unwrap());
        batch.append(blocks(&["a", "b", "c", "d"])).unwrap();

        let b1 = batch.clone();
        let b2 = batch.clone();
        let (r1, r2) = tokio::join!(b1.flush(Some(2)), b2.flush(None));
        assert!(r1.unwrap());
        assert!(r2.unwrap());
        assert_eq!(writer.length(), 4);
        assert_eq!(batch.buffered(), 0);
        let all: Vec<Bytes> = (0..4).map(|i| writer.get(i).unwrap().unwrap()).collect();
        assert_eq!(all, blocks(&["a", "b", "c", "d"]));
    }

    #[tokio::test]
    async fn test_flush_with_external_signature() {
        let kp = KeyPair::generate();
        let storage: Arc<dyn CoreStorage> = Arc::new(MemoryStorage::new());
        let writer = Arc::new(Writer::open(storage, kp.clone()).unwrap());
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a", "b"])).unwrap();

        let preview = batch.create_tree_batch(None, &[]).unwrap();
        let signature = kp.sign(&preview.signable());
        let landed = batch
            .flush_with(FlushOptions {
                length: None,
                signer: HeadSigner::Signature(signature),
            })
            .await
            .unwrap();
        assert!(landed);
        assert_eq!(writer.length(), 2);
        assert_eq!(writer.info().root_hash, preview.hash());
    }

    #[tokio::test]
    async fn test_flush_with_foreign_key_is_refused() {
        let writer = writer();
        let batch = Batch::new(writer.clone()).unwrap();
        batch.append(blocks(&["a"])).unwrap();

        let err = batch
            .flush_with(FlushOptions {
                length: None,
                signer: HeadSigner::KeyPair(KeyPair::generate()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::KeyMismatch));
        assert_eq!(writer.length(), 0);
        assert_eq!(batch.buffered(), 1);
    }
}
