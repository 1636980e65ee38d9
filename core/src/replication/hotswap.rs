//! # Hotswap Queue
//!
//! Blocks that are already being fetched but could be fetched again from a
//! faster peer.
//!
//! A candidate lives in bucket `n - 1` when it has `n` requests in flight.
//! Only one and two in-flight requests qualify; a block with none is not a
//! hotswap at all, and three is enough redundancy.
//!
//! ## Membership
//!
//! Each bucket is a `Vec`. A side table maps block index to `{bucket, slot}`
//! so removal is a swap with the last element plus one fixup of the moved
//! block's slot.
//!
//! ## Picking
//!
//! `pick(peer)` walks bucket 0 first, then bucket 1. Bucket `b` may yield
//! `HOTSWAP_PICKS * (HOTSWAP_BUCKETS - b)` blocks; candidates skipped because
//! `peer` already has them don't count. Every draw swaps a random
//! not-yet-visited candidate to the front of the unvisited region, so a pass
//! never visits a block twice and repeated passes start in different places.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::config::{HOTSWAP_BUCKETS, HOTSWAP_PICKS, MAX_HOTSWAP_INFLIGHT};

/// A request for a block that is currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightRequest<P> {
    pub id: u64,
    pub peer: P,
}

/// A block and the requests out for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCandidate<P> {
    pub index: u64,
    pub inflight: Vec<InflightRequest<P>>,
}

impl<P: PartialEq> RequestCandidate<P> {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            inflight: Vec::new(),
        }
    }

    /// Whether one of the in-flight requests went to `peer`.
    pub fn requested_from(&self, peer: &P) -> bool {
        self.inflight.iter().any(|r| &r.peer == peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    bucket: usize,
    slot: usize,
}

fn bucket_for(inflight: usize) -> Option<usize> {
    if inflight == 0 || inflight >= MAX_HOTSWAP_INFLIGHT {
        return None;
    }
    Some(inflight - 1)
}

#[derive(Debug)]
pub struct HotswapQueue<P> {
    buckets: [Vec<RequestCandidate<P>>; HOTSWAP_BUCKETS],
    slots: HashMap<u64, Slot>,
    rng: StdRng,
}

impl<P: PartialEq> Default for HotswapQueue<P> {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl<P: PartialEq> HotswapQueue<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
            slots: HashMap::new(),
            rng,
        }
    }

    /// Inserts or re-buckets a candidate after its in-flight list changed.
    ///
    /// Returns `false` (and drops any previous entry) when the candidate no
    /// longer qualifies.
    pub fn add(&mut self, candidate: RequestCandidate<P>) -> bool {
        self.remove(candidate.index);
        let Some(bucket) = bucket_for(candidate.inflight.len()) else {
            return false;
        };
        let slot = self.buckets[bucket].len();
        self.slots.insert(candidate.index, Slot { bucket, slot });
        self.buckets[bucket].push(candidate);
        true
    }

    pub fn remove(&mut self, index: u64) -> Option<RequestCandidate<P>> {
        let Slot { bucket, slot } = self.slots.remove(&index)?;
        let queue = &mut self.buckets[bucket];
        let removed = queue.swap_remove(slot);
        if let Some(moved) = queue.get(slot) {
            self.slots.insert(moved.index, Slot { bucket, slot });
        }
        Some(removed)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn get(&self, index: u64) -> Option<&RequestCandidate<P>> {
        let slot = self.slots.get(&index)?;
        self.buckets[slot.bucket].get(slot.slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lazily yields block indices worth requesting from `peer`.
    ///
    /// Blocks already requested from `peer` are skipped. The iterator
    /// reorders bucket contents as it goes, so it holds the queue mutably.
    pub fn pick<'a>(&'a mut self, peer: &'a P) -> Pick<'a, P> {
        Pick {
            queue: self,
            peer,
            bucket: 0,
            visited: 0,
            budget: HOTSWAP_PICKS * HOTSWAP_BUCKETS,
        }
    }

    fn swap_slots(&mut self, bucket: usize, a: usize, b: usize) {
        if a == b {
            return;
        }
        let queue = &mut self.buckets[bucket];
        queue.swap(a, b);
        let (ia, ib) = (queue[a].index, queue[b].index);
        self.slots.insert(ia, Slot { bucket, slot: a });
        self.slots.insert(ib, Slot { bucket, slot: b });
    }
}

/// Iterator returned by [`HotswapQueue::pick`].
#[derive(Debug)]
pub struct Pick<'a, P> {
    queue: &'a mut HotswapQueue<P>,
    peer: &'a P,
    bucket: usize,
    visited: usize,
    /// Yields left in the current bucket.
    budget: usize,
}

impl<P: PartialEq> Iterator for Pick<'_, P> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.bucket < HOTSWAP_BUCKETS {
            let len = self.queue.buckets[self.bucket].len();
            if self.budget == 0 || self.visited >= len {
                self.bucket += 1;
                self.visited = 0;
                self.budget = HOTSWAP_PICKS * HOTSWAP_BUCKETS.saturating_sub(self.bucket);
                continue;
            }

            let draw = self.queue.rng.gen_range(self.visited..len);
            self.queue.swap_slots(self.bucket, self.visited, draw);
            let candidate = &self.queue.buckets[self.bucket][self.visited];
            self.visited += 1;

            if !candidate.requested_from(self.peer) {
                self.budget -= 1;
                return Some(candidate.index);
            }
        }
        None
    }
}
