//! Flat-tree addressing.
//!
//! A binary tree laid out in a single array, in-order:
//!
//! ```text
//!        3
//!    1       5
//!  0   2   4   6
//! ```
//!
//! Leaf `i` lives at index `2i`. A node's depth is the number of trailing one
//! bits in its index; its offset is its position among nodes of that depth.

/// Depth of a node. Leaves are depth 0.
pub fn depth(index: u64) -> u32 {
    (!index).trailing_zeros()
}

/// Position of a node among the nodes at its depth.
pub fn offset(index: u64) -> u64 {
    let d = depth(index);
    if d >= 63 {
        return 0;
    }
    (index + 1) >> (d + 1)
}

/// Flat index of the node at `depth` / `offset`.
pub fn index(depth: u32, offset: u64) -> u64 {
    ((1 + 2 * offset) << depth) - 1
}

pub fn parent(index_: u64) -> u64 {
    let d = depth(index_);
    index(d + 1, offset(index_) >> 1)
}

pub fn sibling(index_: u64) -> u64 {
    let d = depth(index_);
    index(d, offset(index_) ^ 1)
}

/// Left-most leaf index (flat) covered by a node.
pub fn left_span(index_: u64) -> u64 {
    let d = depth(index_);
    if d == 0 {
        return index_;
    }
    offset(index_) << (d + 1)
}

/// Right-most leaf index (flat) covered by a node.
pub fn right_span(index_: u64) -> u64 {
    let d = depth(index_);
    if d == 0 {
        return index_;
    }
    ((offset(index_) + 1) << (d + 1)) - 2
}

/// Number of leaves under a node.
pub fn count_leaves(index_: u64) -> u64 {
    1 << depth(index_)
}

/// The perfect-subtree roots covering flat range `[0, index)`.
///
/// `index` must be even: pass `2 * length` to get the roots of a log with
/// `length` blocks. Roots come back left to right, largest first.
pub fn full_roots(index_: u64) -> Vec<u64> {
    debug_assert!(index_ & 1 == 0, "full_roots takes an even index");

    let mut roots = Vec::new();
    let mut remaining = index_ >> 1;
    let mut start = 0u64;

    while remaining > 0 {
        let mut factor = 1u64;
        while factor * 2 <= remaining {
            factor *= 2;
        }
        roots.push(start + factor - 1);
        start += 2 * factor;
        remaining -= factor;
    }

    roots
}

/// Parents that sit left of flat index `index` but cover it, limited to the
/// ones a tree over `[0, end)` can hold.
///
/// Cutting a tree at leaf `index` leaves these behind with stale hashes; every
/// other node they would share a span with has an index at or past `index`.
pub fn straddling_parents(index_: u64, end: u64) -> Vec<u64> {
    let mut nodes = Vec::new();
    let mut node = index_;
    loop {
        node = parent(node);
        if right_span(node) + 2 > end {
            break;
        }
        if node < index_ {
            nodes.push(node);
        }
    }
    nodes
}
