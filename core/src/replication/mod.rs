//! # Replication Scheduling
//!
//! The decisions a replicator makes before anything touches the wire: which
//! incoming request to serve next, and which block to ask a peer for.
//!
//! - **random_iterator**: random order without replacement, restartable.
//! - **receiver_queue**: requests from a peer, cancellable by id.
//! - **hotswap**: blocks already in flight that another peer could race.
//!
//! Transport, timeouts and the wire format itself live outside this crate.

pub mod hotswap;
pub mod random_iterator;
pub mod receiver_queue;

pub use hotswap::{HotswapQueue, InflightRequest, Pick, RequestCandidate};
pub use random_iterator::RandomIterator;
pub use receiver_queue::{ReceiverQueue, RequestBlock, RequestSeek, RequestUpgrade, WireRequest};
