//! # Cryptographic Primitives
//!
//! Everything a reader needs to check a log without trusting whoever handed
//! it the bytes.
//!
//! - **Ed25519** for tree head signatures.
//! - **BLAKE3** for leaf, parent and root hashes, each behind its own tag
//!   byte so a leaf can never be passed off as a parent.
//! - A keyed BLAKE3 hash for the discovery key.
//!
//! All of it is pure and stateless.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{discovery_key, leaf_hash, parent_hash, tree_hash, Hash};
pub use keys::{key_pair, KeyError, KeyPair, PublicKey, Signature};
pub use signatures::{sign, signable, verify};
