//! Error types for the log core.
//!
//! Writer, Batch and the Merkle tree all fail with a [`CoreError`]. Lower
//! layers keep their own enums ([`StorageError`], [`OplogError`],
//! [`TipListError`], [`KeyError`]) and convert upward through `From`.
//!
//! Every error also has an [`ErrorKind`], so callers can decide what to do
//! without matching on dozens of variants: integrity failures are fatal,
//! misuse is a bug in the caller, I/O may be retried by whoever owns the
//! storage.

use thiserror::Error;

use crate::crypto::KeyError;
use crate::oplog::OplogError;
use crate::storage::tiplist::TipListError;
use crate::storage::StorageError;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Checksum, signature or root-hash mismatch. Never masked.
    Integrity,
    /// The caller did something the API does not allow.
    Misuse,
    /// Underlying storage failed. Not retried here.
    Io,
    /// The requested data does not exist (yet).
    NotFound,
    /// The operation is deliberately not implemented by this backend.
    Unimplemented,
}

/// Errors returned by the log core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored tree head carries a signature that does not verify.
    #[error("invalid signature on tree head (length {length}, fork {fork})")]
    InvalidSignature {
        /// Length of the offending head.
        length: u64,
        /// Fork of the offending head.
        fork: u64,
    },

    /// Roots read back from storage hash to something other than the head.
    #[error("root hash mismatch at length {length}")]
    RootHashMismatch {
        /// Length of the head whose roots did not match.
        length: u64,
    },

    /// A tree node the head depends on is missing from storage.
    #[error("missing tree node {index}")]
    MissingTreeNode {
        /// Flat-tree index of the missing node.
        index: u64,
    },

    /// The stored identity does not match the keypair we were opened with.
    #[error("stored public key does not match the supplied key")]
    KeyMismatch,

    #[error("session is closed")]
    SessionClosed,

    #[error("session is not writable")]
    NotWritable,

    #[error("batch is closed")]
    BatchClosed,

    /// Neither the batch buffer nor the underlying log can serve this index.
    #[error("block {index} is not available")]
    BlockNotAvailable {
        /// Requested block index.
        index: u64,
    },

    #[error("cannot truncate to {length}: log has only {current} blocks")]
    InvalidTruncation {
        /// Requested length.
        length: u64,
        /// Current length.
        current: u64,
    },

    /// Truncating a batch below what has already been committed needs the
    /// caller to say so.
    #[error("truncating to {length} rolls back committed blocks (committed length {committed}); pass force")]
    TruncateRequiresForce {
        /// Requested length.
        length: u64,
        /// Length already committed to the log.
        committed: u64,
    },

    /// A batch was created on one fork and flushed after a truncation moved
    /// the log to another.
    #[error("fork mismatch: batch expects fork {expected}, log is at {actual}")]
    ForkMismatch {
        /// Fork observed when the batch was opened.
        expected: u64,
        /// Fork of the log now.
        actual: u64,
    },

    /// An encodable payload failed to serialize.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<OplogError> for CoreError {
    fn from(e: OplogError) -> Self {
        CoreError::Storage(StorageError::Oplog(e))
    }
}

impl From<TipListError> for CoreError {
    fn from(e: TipListError) -> Self {
        CoreError::Storage(StorageError::TipList(e))
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidSignature { .. }
            | CoreError::RootHashMismatch { .. }
            | CoreError::MissingTreeNode { .. }
            | CoreError::KeyMismatch => ErrorKind::Integrity,

            CoreError::SessionClosed
            | CoreError::NotWritable
            | CoreError::BatchClosed
            | CoreError::InvalidTruncation { .. }
            | CoreError::TruncateRequiresForce { .. }
            | CoreError::ForkMismatch { .. }
            | CoreError::Encode(_) => ErrorKind::Misuse,

            CoreError::BlockNotAvailable { .. } => ErrorKind::NotFound,

            CoreError::Key(KeyError::KeypairMismatch) => ErrorKind::Integrity,
            CoreError::Key(_) => ErrorKind::Misuse,

            CoreError::Storage(e) => e.kind(),
        }
    }

    /// Shorthand for `kind() == ErrorKind::Integrity`.
    pub fn is_integrity(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io(_) | StorageError::Sled(_) => ErrorKind::Io,
            StorageError::Oplog(OplogError::Io(_)) => ErrorKind::Io,
            StorageError::Oplog(OplogError::Corrupt { .. }) => ErrorKind::Integrity,
            StorageError::Oplog(_) => ErrorKind::Misuse,
            StorageError::Serialization(_) => ErrorKind::Integrity,
            StorageError::TipList(_) => ErrorKind::Misuse,
            StorageError::Unimplemented(_) => ErrorKind::Unimplemented,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
