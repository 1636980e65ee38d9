//! Block presence bitmap.
//!
//! One bit per block, grouped into fixed-size pages addressed by
//! `(index / BITFIELD_PAGE_BITS, index % BITFIELD_PAGE_BITS)`. Pages are the
//! unit of persistence: changing any bit marks its page dirty, and
//! [`take_dirty`](Bitfield::take_dirty) hands back what needs writing.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{BITFIELD_PAGE_BITS, BITFIELD_PAGE_BYTES};
use crate::storage::{ReadBatch, StorageResult};

#[derive(Debug, Clone, Default)]
pub struct Bitfield {
    pages: BTreeMap<u64, Vec<u8>>,
    dirty: BTreeSet<u64>,
}

fn locate(index: u64) -> (u64, usize, u8) {
    let page = index / BITFIELD_PAGE_BITS;
    let bit = (index % BITFIELD_PAGE_BITS) as usize;
    (page, bit / 8, 1u8 << (bit % 8))
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every page that can hold a bit below `length`.
    pub fn load(read: &dyn ReadBatch, length: u64) -> StorageResult<Self> {
        let mut bitfield = Self::new();
        let page_count = length.div_ceil(BITFIELD_PAGE_BITS);
        for page in 0..page_count {
            if let Some(data) = read.get_bitfield_page(page)? {
                let mut buf = vec![0u8; BITFIELD_PAGE_BYTES];
                let n = data.len().min(BITFIELD_PAGE_BYTES);
                buf[..n].copy_from_slice(&data[..n]);
                bitfield.pages.insert(page, buf);
            }
        }
        Ok(bitfield)
    }

    pub fn get(&self, index: u64) -> bool {
        let (page, byte, mask) = locate(index);
        self.pages
            .get(&page)
            .is_some_and(|p| p[byte] & mask != 0)
    }

    pub fn set(&mut self, index: u64, value: bool) {
        let (page, byte, mask) = locate(index);
        if !value && !self.pages.contains_key(&page) {
            return;
        }
        let data = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; BITFIELD_PAGE_BYTES]);
        let before = data[byte];
        if value {
            data[byte] |= mask;
        } else {
            data[byte] &= !mask;
        }
        if data[byte] != before {
            self.dirty.insert(page);
        }
    }

    /// Sets every bit in `[start, end)`.
    pub fn set_range(&mut self, start: u64, end: u64, value: bool) {
        for index in start..end {
            self.set(index, value);
        }
    }

    /// Number of set bits in `[start, end)`.
    pub fn count(&self, start: u64, end: u64) -> u64 {
        (start..end).filter(|&i| self.get(i)).count() as u64
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Re-marks pages as dirty, e.g. after a failed write.
    pub fn mark_dirty(&mut self, pages: impl IntoIterator<Item = u64>) {
        self.dirty.extend(pages);
    }

    /// Drains the dirty set.
    ///
    /// Returns every page from the lowest dirty one up to the last page held,
    /// so the result is a contiguous tail that storage can take as a series
    /// of tip appends.
    pub fn take_dirty(&mut self) -> Vec<(u64, Bytes)> {
        let Some(&first) = self.dirty.iter().next() else {
            return Vec::new();
        };
        self.dirty.clear();

        let last = self.pages.keys().next_back().copied().unwrap_or(first);
        (first..=last)
            .map(|page| {
                let data = self
                    .pages
                    .get(&page)
                    .map(|p| Bytes::copy_from_slice(p))
                    .unwrap_or_else(|| Bytes::from(vec![0u8; BITFIELD_PAGE_BYTES]));
                (page, data)
            })
            .collect()
    }
}
