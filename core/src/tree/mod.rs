//! # Merkle Tree
//!
//! The incremental authentication structure over a log's blocks.
//!
//! The tree is never stored as one object. What matters at any moment is the
//! *root set*: the perfect subtrees covering `[0, length)`, which is a pure
//! function of `length` (see [`flat::full_roots`]). Appending a block pushes
//! a leaf root and folds equal-depth neighbours into parents, so the work per
//! append is `O(log n)` hashes and every internal node is written exactly once.
//!
//! ## Batches
//!
//! Mutations go through a [`TreeBatch`]: a cloned view of the root set that
//! can be appended to, hashed, and signed without touching the committed
//! tree. The writer builds a batch, persists blocks, signs `batch.signable()`,
//! then commits. A batch that is dropped instead leaves no trace.

pub mod flat;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::hash::{leaf_hash, parent_hash, tree_hash, Hash};
use crate::crypto::keys::{KeyPair, PublicKey, Signature};
use crate::crypto::signatures::signable;
use crate::error::CoreError;
use crate::storage::{CoreHead, ReadBatch};

/// One node of the tree: flat index, hash, and the number of data bytes
/// beneath it.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub index: u64,
    pub size: u64,
    pub hash: Hash,
}

impl TreeNode {
    /// Builds the leaf node for block `block_index`.
    pub fn leaf(block_index: u64, data: &[u8]) -> Self {
        Self {
            index: 2 * block_index,
            size: data.len() as u64,
            hash: leaf_hash(data),
        }
    }

    /// Builds the parent of two siblings.
    pub fn parent_of(a: &TreeNode, b: &TreeNode) -> Self {
        Self {
            index: flat::parent(a.index),
            size: a.size + b.size,
            hash: parent_hash(a, b),
        }
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TreeNode(index={}, size={}, hash={})",
            self.index,
            self.size,
            &hex::encode(self.hash)[..16]
        )
    }
}

// ---------------------------------------------------------------------------
// MerkleTree
// ---------------------------------------------------------------------------

/// The committed tree state of a log.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    pub fork: u64,
    pub length: u64,
    pub byte_length: u64,
    pub roots: Vec<TreeNode>,
    pub signature: Option<Signature>,
}

impl MerkleTree {
    /// Loads the committed tree described by the stored head.
    ///
    /// Every root named by `full_roots(2 * length)` must be present and the
    /// recomputed root hash must equal the head's. Anything else means the
    /// storage underneath us no longer matches what was signed.
    pub fn load(read: &dyn ReadBatch) -> Result<Self, CoreError> {
        let Some(head) = read.get_core_head()? else {
            return Ok(Self::default());
        };

        let roots = read_roots(read, head.length)?;
        let tree = Self {
            fork: head.fork,
            length: head.length,
            byte_length: roots.iter().map(|r| r.size).sum(),
            roots,
            signature: head.signature,
        };

        if tree.hash() != head.root_hash {
            return Err(CoreError::RootHashMismatch {
                length: head.length,
            });
        }

        Ok(tree)
    }

    /// Recomputes the tree for the stored head from the stored blocks.
    ///
    /// Tree nodes are written lazily after the head, so a crash can leave a
    /// head whose roots never made it to storage. The blocks did (they are
    /// written first), and hashing them again must land on the signed root.
    /// Returns the tree plus every node, for the caller to persist.
    pub fn rebuild(read: &dyn ReadBatch) -> Result<(Self, Vec<TreeNode>), CoreError> {
        let Some(head) = read.get_core_head()? else {
            return Ok((Self::default(), Vec::new()));
        };

        let mut tree = Self {
            fork: head.fork,
            ..Self::default()
        };
        let mut batch = tree.batch();
        for index in 0..head.length {
            let block = read
                .get_block(index)?
                .ok_or(CoreError::BlockNotAvailable { index })?;
            batch.append(&block);
        }

        if batch.hash() != head.root_hash {
            return Err(CoreError::RootHashMismatch {
                length: head.length,
            });
        }
        if let Some(signature) = head.signature {
            batch.set_signature(signature);
        }

        let nodes = batch.commit(&mut tree);
        Ok((tree, nodes))
    }

    pub fn hash(&self) -> Hash {
        tree_hash(&self.roots)
    }

    pub fn signable(&self) -> Vec<u8> {
        signable(&self.hash(), self.length, self.byte_length, self.fork)
    }

    /// Checks the stored signature against `public_key`. An empty tree needs
    /// no signature.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        match &self.signature {
            Some(signature) => public_key.verify(&self.signable(), signature),
            None => self.length == 0,
        }
    }

    /// Starts an append batch on top of the committed state.
    pub fn batch(&self) -> TreeBatch {
        TreeBatch {
            fork: self.fork,
            length: self.length,
            byte_length: self.byte_length,
            roots: self.roots.clone(),
            nodes: Vec::new(),
            signature: None,
            ancestors: self.length,
            truncated: false,
        }
    }

    /// Starts a truncation batch that shrinks the tree to `length` under a
    /// new `fork`.
    ///
    /// The shorter root set is read back from stored nodes, so every node the
    /// tree has committed must already be flushed.
    pub fn truncate(
        &self,
        length: u64,
        fork: u64,
        read: &dyn ReadBatch,
    ) -> Result<TreeBatch, CoreError> {
        if length > self.length {
            return Err(CoreError::InvalidTruncation {
                length,
                current: self.length,
            });
        }

        let roots = read_roots(read, length)?;
        Ok(TreeBatch {
            fork,
            length,
            byte_length: roots.iter().map(|r| r.size).sum(),
            roots,
            nodes: Vec::new(),
            signature: None,
            ancestors: length,
            truncated: true,
        })
    }

    pub fn head(&self) -> CoreHead {
        CoreHead {
            fork: self.fork,
            length: self.length,
            root_hash: self.hash(),
            signature: self.signature.clone(),
        }
    }
}

fn read_roots(read: &dyn ReadBatch, length: u64) -> Result<Vec<TreeNode>, CoreError> {
    flat::full_roots(2 * length)
        .into_iter()
        .map(|index| {
            read.get_tree_node(index)?
                .ok_or(CoreError::MissingTreeNode { index })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// TreeBatch
// ---------------------------------------------------------------------------

/// A pending change to the tree: some appended leaves, or a truncation.
#[derive(Debug, Clone)]
pub struct TreeBatch {
    fork: u64,
    length: u64,
    byte_length: u64,
    roots: Vec<TreeNode>,
    nodes: Vec<TreeNode>,
    signature: Option<Signature>,
    ancestors: u64,
    truncated: bool,
}

impl TreeBatch {
    /// Appends one block: pushes its leaf, then folds sibling roots upward.
    pub fn append(&mut self, data: &[u8]) {
        let leaf = TreeNode::leaf(self.length, data);
        self.nodes.push(leaf);
        self.roots.push(leaf);

        while self.roots.len() > 1 {
            let n = self.roots.len();
            let (a, b) = (self.roots[n - 2], self.roots[n - 1]);
            if flat::parent(a.index) != flat::parent(b.index) {
                break;
            }
            let parent = TreeNode::parent_of(&a, &b);
            self.nodes.push(parent);
            self.roots.truncate(n - 2);
            self.roots.push(parent);
        }

        self.length += 1;
        self.byte_length += data.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    /// Nodes created by this batch, leaves and parents, in creation order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Length of the tree this batch was branched from.
    pub fn ancestors(&self) -> u64 {
        self.ancestors
    }

    pub fn is_truncation(&self) -> bool {
        self.truncated
    }

    pub fn hash(&self) -> Hash {
        tree_hash(&self.roots)
    }

    pub fn signable(&self) -> Vec<u8> {
        signable(&self.hash(), self.length, self.byte_length, self.fork)
    }

    /// Signs the batch's signable with the log's keypair.
    pub fn sign(&mut self, key_pair: &KeyPair) -> &Signature {
        self.signature.insert(key_pair.sign(&self.signable()))
    }

    /// Attaches an externally produced signature.
    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// The head this batch would commit.
    pub fn head(&self) -> CoreHead {
        CoreHead {
            fork: self.fork,
            length: self.length,
            root_hash: self.hash(),
            signature: self.signature.clone(),
        }
    }

    /// Advances `tree` to this batch's state and hands back the nodes that
    /// still need persisting.
    pub fn commit(self, tree: &mut MerkleTree) -> Vec<TreeNode> {
        tree.fork = self.fork;
        tree.length = self.length;
        tree.byte_length = self.byte_length;
        tree.roots = self.roots;
        tree.signature = self.signature;
        self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CoreStorage, MemoryStorage};

    fn build(blocks: &[&[u8]]) -> (MerkleTree, Vec<TreeNode>) {
        let mut tree = MerkleTree::default();
        let mut batch = tree.batch();
        for block in blocks {
            batch.append(block);
        }
        let nodes = batch.commit(&mut tree);
        (tree, nodes)
    }

    #[test]
    fn test_single_leaf_is_root() {
        let (tree, nodes) = build(&[b"hello"]);
        assert_eq!(tree.length, 1);
        assert_eq!(tree.byte_length, 5);
        assert_eq!(tree.roots, vec![TreeNode::leaf(0, b"hello")]);
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_roots_follow_full_roots() {
        let blocks: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i; 3]).collect();
        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
        let (tree, nodes) = build(&refs);

        let indices: Vec<u64> = tree.roots.iter().map(|r| r.index).collect();
        assert_eq!(indices, flat::full_roots(14));
        // 7 leaves + 4 parents at depth 1..2 (1, 5, 9, 3)
        assert_eq!(nodes.len(), 11);
        assert_eq!(tree.byte_length, 21);
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let (one_shot, _) = build(&[b"a", b"b", b"c", b"d", b"e"]);

        let mut tree = MerkleTree::default();
        for block in [b"a", b"b", b"c", b"d", b"e"] {
            let mut batch = tree.batch();
            batch.append(block);
            batch.commit(&mut tree);
        }
        assert_eq!(tree.hash(), one_shot.hash());
    }

    #[test]
    fn test_any_byte_change_changes_root() {
        let (a, _) = build(&[b"one", b"two", b"three"]);
        let (b, _) = build(&[b"one", b"twp", b"three"]);
        let (c, _) = build(&[b"two", b"one", b"three"]);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_batch_does_not_touch_tree_until_commit() {
        let (tree, _) = build(&[b"x"]);
        let before = tree.hash();
        let mut batch = tree.batch();
        batch.append(b"y");
        assert_eq!(batch.length(), 2);
        assert_eq!(tree.length, 1);
        assert_eq!(tree.hash(), before);
    }

    #[test]
    fn test_signed_batch_verifies_after_commit() {
        let kp = KeyPair::generate();
        let mut tree = MerkleTree::default();
        assert!(tree.verify(&kp.public_key()));

        let mut batch = tree.batch();
        batch.append(b"signed");
        batch.sign(&kp);
        batch.commit(&mut tree);
        assert!(tree.verify(&kp.public_key()));

        let other = KeyPair::generate();
        assert!(!tree.verify(&other.public_key()));
    }

    #[test]
    fn test_load_and_truncate_from_storage() {
        let storage = MemoryStorage::new();
        let (tree, nodes) = build(&[b"a", b"b", b"c", b"d", b"e"]);

        let mut write = storage.write_batch();
        for node in &nodes {
            write.put_tree_node(*node);
        }
        write.set_core_head(tree.head());
        write.flush().unwrap();

        let read = storage.read_batch();
        let loaded = MerkleTree::load(read.as_ref()).unwrap();
        assert_eq!(loaded.hash(), tree.hash());
        assert_eq!(loaded.byte_length, 5);

        let batch = loaded.truncate(3, 1, read.as_ref()).unwrap();
        let (expected, _) = build(&[b"a", b"b", b"c"]);
        assert_eq!(batch.hash(), expected.hash());
        assert_eq!(batch.fork(), 1);
        assert!(batch.is_truncation());

        assert!(matches!(
            loaded.truncate(9, 1, read.as_ref()),
            Err(CoreError::InvalidTruncation { .. })
        ));
    }

    #[test]
    fn test_rebuild_from_blocks() {
        let storage = MemoryStorage::new();
        let data: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
        let (tree, _) = build(&data);

        let mut write = storage.write_batch();
        for (i, block) in data.iter().enumerate() {
            write
                .put_block(i as u64, bytes::Bytes::copy_from_slice(block))
                .unwrap();
        }
        write.set_core_head(tree.head());
        write.flush().unwrap();

        let read = storage.read_batch();
        assert!(matches!(
            MerkleTree::load(read.as_ref()),
            Err(CoreError::MissingTreeNode { .. })
        ));
        let (rebuilt, nodes) = MerkleTree::rebuild(read.as_ref()).unwrap();
        assert_eq!(rebuilt.hash(), tree.hash());
        assert_eq!(rebuilt.byte_length, 6);
        assert_eq!(nodes.len(), 4);
    }

    #[test]
    fn test_load_detects_tampered_node() {
        let storage = MemoryStorage::new();
        let (tree, nodes) = build(&[b"a", b"b"]);

        let mut write = storage.write_batch();
        for node in &nodes {
            let mut node = *node;
            if node.index == 1 {
                node.hash[0] ^= 1;
            }
            write.put_tree_node(node);
        }
        write.set_core_head(tree.head());
        write.flush().unwrap();

        let read = storage.read_batch();
        assert!(matches!(
            MerkleTree::load(read.as_ref()),
            Err(CoreError::RootHashMismatch { length: 2 })
        ));
    }
}
