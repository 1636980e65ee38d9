//! Restartable random iteration without replacement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Yields the elements of a vector in random order, each at most once per
/// pass.
///
/// The shuffle happens in place and only as far as iteration goes: every
/// `next` swaps a uniformly chosen element from the pending tail into the
/// next slot. [`reset`](Self::reset) starts a new pass over the same
/// elements; [`requeue`](Self::requeue) hands the last yielded element back
/// to the pending pool.
#[derive(Debug, Clone)]
pub struct RandomIterator<T, R = StdRng> {
    values: Vec<T>,
    start: usize,
    rng: R,
}

impl<T> RandomIterator<T, StdRng> {
    pub fn new(values: Vec<T>) -> Self {
        Self::with_rng(values, StdRng::from_entropy())
    }

    /// Deterministic order for a given seed.
    pub fn seeded(values: Vec<T>, seed: u64) -> Self {
        Self::with_rng(values, StdRng::seed_from_u64(seed))
    }
}

impl<T, R: Rng> RandomIterator<T, R> {
    pub fn with_rng(values: Vec<T>, rng: R) -> Self {
        Self {
            values,
            start: 0,
            rng,
        }
    }

    /// Elements not yet yielded in this pass.
    pub fn remaining(&self) -> usize {
        self.values.len() - self.start
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Next element in the shuffled order, by reference.
    pub fn next_ref(&mut self) -> Option<&T> {
        if self.start >= self.values.len() {
            return None;
        }
        let pick = self.rng.gen_range(self.start..self.values.len());
        self.values.swap(self.start, pick);
        self.start += 1;
        self.values.get(self.start - 1)
    }

    /// Rewinds to the beginning of a new pass.
    pub fn reset(&mut self) {
        self.start = 0;
    }

    /// Puts the most recently yielded element back in the pending pool.
    ///
    /// No-op at the start of a pass.
    pub fn requeue(&mut self) {
        self.start = self.start.saturating_sub(1);
    }
}

impl<T: Clone, R: Rng> Iterator for RandomIterator<T, R> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.next_ref().cloned()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}
