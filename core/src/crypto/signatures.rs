//! # Tree Head Signatures
//!
//! Signing and verification of tree heads.
//!
//! What gets signed is never the raw data. It's the *signable*: a fixed
//! namespace, the root-set hash, and the numbers that pin down which tree
//! that hash describes.
//!
//! ```text
//! signable = namespace(32) ‖ tree_hash(roots) ‖ u64be(length) ‖ u64be(byte_length) ‖ u64be(fork)
//! ```
//!
//! Binding `fork` means a head signed before a truncation can't be replayed
//! against the rewritten history.

use super::hash::Hash;
use super::keys::{KeyPair, PublicKey, Signature};
use crate::config::SIGNABLE_CONTEXT;

/// Length of the signable encoding.
pub const SIGNABLE_LENGTH: usize = 32 + 32 + 8 + 8 + 8;

/// Signs a message. Thin wrapper so every signing call site goes through
/// one function.
pub fn sign(key_pair: &KeyPair, message: &[u8]) -> Signature {
    key_pair.sign(message)
}

/// Verifies a detached signature. Returns `false` on any failure.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    public_key.verify(message, signature)
}

/// The 32-byte prefix every signable starts with.
pub fn signable_namespace() -> [u8; 32] {
    blake3::derive_key(SIGNABLE_CONTEXT, b"")
}

/// Builds the deterministic byte string a tree head signature covers.
pub fn signable(root_hash: &Hash, length: u64, byte_length: u64, fork: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNABLE_LENGTH);
    out.extend_from_slice(&signable_namespace());
    out.extend_from_slice(root_hash);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&byte_length.to_be_bytes());
    out.extend_from_slice(&fork.to_be_bytes());
    out
}
