// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quill Core Library
//!
//! A single-writer, append-only log that anyone can verify. The writer signs
//! a Merkle tree over its blocks; a reader holding the public key can check
//! every block it gets, no matter who handed it over.
//!
//! ## Architecture
//!
//! - **crypto**: BLAKE3 tree hashing, Ed25519 signing, discovery keys.
//! - **tree**: flat-tree indexing and the incremental Merkle tree.
//! - **oplog**: dual-header write-ahead log with checksummed records.
//! - **storage**: the read/write batch seam, the overlay, and the memory
//!   and disk backends.
//! - **bitfield**: which blocks are held locally.
//! - **writer**: the one place appends and truncations happen.
//! - **batch**: buffered appends with read-your-writes before flush.
//! - **replication**: request queues and block selection.
//! - **config**: constants and tunables.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_core::{Batch, DiskStorage, KeyPair, Writer};
//!
//! # async fn run() -> quill_core::CoreResult<()> {
//! let storage = Arc::new(DiskStorage::open("./my-log")?);
//! let writer = Arc::new(Writer::open(storage, KeyPair::generate())?);
//!
//! let batch = Batch::new(writer.clone())?;
//! batch.append(vec!["hello".into(), "world".into()])?;
//! batch.flush(None).await?;
//! assert_eq!(writer.length(), 2);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod bitfield;
pub mod config;
pub mod crypto;
pub mod error;
pub mod oplog;
pub mod replication;
pub mod storage;
pub mod tree;
pub mod writer;

pub use batch::{Batch, BatchOptions, FlushOptions};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use storage::{CoreStorage, DiskStorage, MemoryOverlay, MemoryStorage};
pub use writer::{AppendOutcome, CoreEvent, CoreInfo, HeadSigner, Payload, Writer};
