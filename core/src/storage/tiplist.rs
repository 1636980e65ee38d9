//! Offset-indexed, append/tail-delete-only sequence.
//!
//! Sequential write batches only ever touch the tip of the log: they append
//! block `n`, `n + 1`, ... or chop everything from some index onward. A
//! `TipList` stores exactly that shape, a dense run `[offset, end)` plus the
//! lowest index a delete has removed, and rejects anything else.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TipListError {
    #[error("invalid put at {index}: tip is at {end}")]
    InvalidPut { index: u64, end: u64 },

    #[error("invalid delete [{start}, {end}): tip is at {tip}")]
    InvalidDelete { start: u64, end: u64, tip: u64 },

    #[error("invalid merge: list ends at {end}, other starts at {offset}")]
    InvalidMerge { end: u64, offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipList<T> {
    offset: u64,
    data: Vec<T>,
    truncated_from: Option<u64>,
}

impl<T> Default for TipList<T> {
    fn default() -> Self {
        Self {
            offset: 0,
            data: Vec::new(),
            truncated_from: None,
        }
    }
}

impl<T> TipList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// One past the last buffered index.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lowest index removed by a `delete`, if any.
    pub fn truncated_from(&self) -> Option<u64> {
        self.truncated_from
    }

    pub fn get(&self, index: u64) -> Option<&T> {
        if index < self.offset {
            return None;
        }
        self.data.get((index - self.offset) as usize)
    }

    /// Whether this list has the final word on `index`: either it holds a
    /// value there, or a delete removed it.
    pub fn covers(&self, index: u64) -> bool {
        (index >= self.offset && index < self.end())
            || self.truncated_from.is_some_and(|t| index >= t)
    }

    /// Appends at the tip. An empty list accepts any index and starts there.
    pub fn put(&mut self, index: u64, value: T) -> Result<(), TipListError> {
        if self.data.is_empty() {
            self.offset = index;
        } else if index != self.end() {
            return Err(TipListError::InvalidPut {
                index,
                end: self.end(),
            });
        }
        self.data.push(value);
        Ok(())
    }

    /// Removes `[start, end)`. Only tail deletes are allowed: `end` must
    /// reach the current tip.
    ///
    /// A range at or before `offset` empties the list and moves `offset` to
    /// `start`. A range that starts at or past the tip removes nothing held
    /// here and only records the deletion.
    pub fn delete(&mut self, start: u64, end: u64) -> Result<(), TipListError> {
        if !self.data.is_empty() && end < self.end() {
            return Err(TipListError::InvalidDelete {
                start,
                end,
                tip: self.end(),
            });
        }

        if self.data.is_empty() || start <= self.offset {
            self.data.clear();
            self.offset = start;
        } else if start < self.end() {
            self.data.truncate((start - self.offset) as usize);
        }

        self.truncated_from = Some(self.truncated_from.map_or(start, |t| t.min(start)));
        Ok(())
    }

    /// Layers `other` on top of this list. Entries at or after the first
    /// index `other` touches are replaced by `other`'s.
    pub fn merge(&mut self, other: TipList<T>) -> Result<(), TipListError> {
        let (cut, kept) = self.merge_plan(&other)?;

        self.data.truncate(kept);
        if self.data.is_empty() {
            self.offset = if other.data.is_empty() {
                cut.unwrap_or(self.offset)
            } else {
                other.offset
            };
        }
        self.data.extend(other.data);

        if let Some(t) = other.truncated_from {
            self.truncated_from = Some(self.truncated_from.map_or(t, |s| s.min(t)));
        }
        Ok(())
    }

    /// Fails exactly when `merge(other)` would, without touching either list.
    pub fn check_merge(&self, other: &TipList<T>) -> Result<(), TipListError> {
        self.merge_plan(other).map(|_| ())
    }

    /// Where `other` cuts into this list, and how many of our entries
    /// survive the cut.
    fn merge_plan(&self, other: &TipList<T>) -> Result<(Option<u64>, usize), TipListError> {
        let cut = match (other.data.is_empty(), other.truncated_from) {
            (false, Some(t)) => Some(other.offset.min(t)),
            (false, None) => Some(other.offset),
            (true, t) => t,
        };

        let kept = match cut {
            Some(cut) if cut <= self.offset => 0,
            Some(cut) => (cut - self.offset).min(self.data.len() as u64) as usize,
            None => self.data.len(),
        };

        if kept > 0 && !other.data.is_empty() {
            let end = self.offset + kept as u64;
            if end != other.offset {
                return Err(TipListError::InvalidMerge {
                    end,
                    offset: other.offset,
                });
            }
        }

        Ok((cut, kept))
    }

    /// Buffered entries with their indices, in order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        let offset = self.offset;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, v)| (offset + i as u64, v))
    }
}
