//! # Merkle Hashing
//!
//! Domain-separated BLAKE3 hashes for the log's Merkle tree.
//!
//! Three kinds of node, three tag bytes (see [`crate::config`]):
//!
//! ```text
//! leaf   = H(TAG_LEAF   ‖ u64be(len(data)) ‖ data)
//! parent = H(TAG_PARENT ‖ u64be(sizeA + sizeB) ‖ hashA ‖ hashB)   children by ascending index
//! root   = H(TAG_ROOT   ‖ ⊕ᵢ (hashᵢ ‖ u64be(indexᵢ) ‖ u64be(sizeᵢ)))
//! ```
//!
//! The length and size prefixes make the encoding unambiguous: you can't
//! shift bytes between a leaf and its neighbour and keep the same root.
//! Sizes are byte counts, so every byte of every block reaches the root.

use crate::config::{DISCOVERY_NAMESPACE, HASH_LENGTH, TAG_LEAF, TAG_PARENT, TAG_ROOT};
use crate::crypto::keys::PublicKey;
use crate::tree::TreeNode;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; HASH_LENGTH];

/// Hashes one block of data into its leaf hash.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TAG_LEAF]);
    hasher.update(&(data.len() as u64).to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hashes two sibling subtrees into their parent.
///
/// Argument order doesn't matter: children are sorted by flat-tree index
/// first, so `parent_hash(a, b) == parent_hash(b, a)`.
pub fn parent_hash(a: &TreeNode, b: &TreeNode) -> Hash {
    let (left, right) = if a.index <= b.index { (a, b) } else { (b, a) };

    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TAG_PARENT]);
    hasher.update(&(left.size + right.size).to_be_bytes());
    hasher.update(&left.hash);
    hasher.update(&right.hash);
    *hasher.finalize().as_bytes()
}

/// Hashes an ordered root set into the single tree hash that gets signed.
pub fn tree_hash(roots: &[TreeNode]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TAG_ROOT]);
    for root in roots {
        hasher.update(&root.hash);
        hasher.update(&root.index.to_be_bytes());
        hasher.update(&root.size.to_be_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Derives the discovery key: a keyed hash of a fixed domain string under
/// the public key.
///
/// Knowing the discovery key tells you where to look for a log, not how to
/// verify it, so it's safe to hand to rendezvous servers.
pub fn discovery_key(public_key: &PublicKey) -> Hash {
    *blake3::keyed_hash(public_key.as_bytes(), DISCOVERY_NAMESPACE).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    fn leaf(index: u64, data: &[u8]) -> TreeNode {
        TreeNode {
            index,
            size: data.len() as u64,
            hash: leaf_hash(data),
        }
    }

    #[test]
    fn test_leaf_hash_deterministic() {
        assert_eq!(leaf_hash(b"block"), leaf_hash(b"block"));
        assert_ne!(leaf_hash(b"block"), leaf_hash(b"Block"));
    }

    #[test]
    fn test_leaf_hash_is_not_plain_blake3() {
        assert_ne!(leaf_hash(b"data"), *blake3::hash(b"data").as_bytes());
    }

    #[test]
    fn test_parent_hash_orders_children() {
        let a = leaf(0, b"left");
        let b = leaf(2, b"right");
        assert_eq!(parent_hash(&a, &b), parent_hash(&b, &a));
    }

    #[test]
    fn test_parent_hash_commits_to_sizes() {
        let a = leaf(0, b"left");
        let b = leaf(2, b"right");
        let mut bigger = b;
        bigger.size += 1;
        assert_ne!(parent_hash(&a, &b), parent_hash(&a, &bigger));
    }

    #[test]
    fn test_tree_hash_order_sensitive() {
        let a = leaf(0, b"first");
        let b = leaf(4, b"second");
        assert_ne!(tree_hash(&[a, b]), tree_hash(&[b, a]));
    }

    #[test]
    fn test_tree_hash_empty_is_stable() {
        assert_eq!(tree_hash(&[]), tree_hash(&[]));
    }

    #[test]
    fn test_discovery_key_differs_from_public_key() {
        let kp = KeyPair::from_seed(&[1u8; 32]);
        let dk = discovery_key(&kp.public_key());
        assert_ne!(&dk, kp.public_key().as_bytes());
        assert_eq!(dk, discovery_key(&kp.public_key()));
    }
}
