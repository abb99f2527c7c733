//! Per-address-space interval index of memory ownership and access.
//!
//! Every partition has one `RegionIndex`: a sorted list of disjoint
//! page-aligned ranges, each tagged with a [`Mode`]. The sharing engine uses
//! it to answer "does this partition wholly own these pages, and with which
//! rights?" deterministically, without consulting page tables.

use bitflags::bitflags;
use heapless::Vec;

use crate::platform::{MAX_REGIONS_PER_PARTITION, PAGE_SIZE};

bitflags! {
    /// Access rights and ownership state of a range in one address space.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Mode: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// Mapped here but owned by another partition.
        const UNOWNED = 1 << 3;
        /// Some other partition currently holds a grant on this range.
        const SHARED = 1 << 4;
    }
}

impl Mode {
    pub const RWX: Mode = Mode::R.union(Mode::W).union(Mode::X);

    /// The R/W/X subset.
    pub fn access(self) -> Mode {
        self & Mode::RWX
    }
}

/// Half-open physical address range `[begin, end)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageRange {
    pub begin: u64,
    pub end: u64,
}

impl PageRange {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Range covering `pages` pages from `base`. `None` on overflow.
    pub fn from_pages(base: u64, pages: u64) -> Option<Self> {
        let len = pages.checked_mul(PAGE_SIZE)?;
        let end = base.checked_add(len)?;
        Some(Self { begin: base, end })
    }

    pub fn is_page_aligned(&self) -> bool {
        self.begin % PAGE_SIZE == 0 && self.end % PAGE_SIZE == 0
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn page_count(&self) -> u64 {
        (self.end - self.begin) / PAGE_SIZE
    }

    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    pub fn contains(&self, other: &PageRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    pub range: PageRange,
    pub mode: Mode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexError {
    /// Part of the queried range is not tracked.
    NotCovered,
    /// Inserted range collides with an existing entry.
    Overlap,
    /// No room for the entries the update needs.
    Full,
}

#[derive(Clone, Debug, Default)]
pub struct RegionIndex {
    entries: Vec<Region, MAX_REGIONS_PER_PARTITION>,
}

impl RegionIndex {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any tracked range intersects `range`.
    pub fn overlaps(&self, range: &PageRange) -> bool {
        self.entries.iter().any(|r| r.range.overlaps(range))
    }

    /// Mode of `range` if it is fully covered by entries that all share one
    /// mode.
    pub fn mode_of(&self, range: &PageRange) -> Option<Mode> {
        let mut mode = None;
        self.walk_covering(range, |r| match mode {
            None => {
                mode = Some(r.mode);
                true
            }
            Some(m) => m == r.mode,
        })
        .ok()?;
        mode
    }

    /// Track a new range. It must not overlap anything already tracked.
    pub fn insert(&mut self, range: PageRange, mode: Mode) -> Result<(), IndexError> {
        if self.overlaps(&range) {
            return Err(IndexError::Overlap);
        }
        let pos = self
            .entries
            .iter()
            .position(|r| r.range.begin > range.begin)
            .unwrap_or(self.entries.len());
        self.entries
            .insert(pos, Region { range, mode })
            .map_err(|_| IndexError::Full)?;
        self.coalesce();
        Ok(())
    }

    /// Stop tracking `range`. It must be fully covered.
    pub fn remove(&mut self, range: &PageRange) -> Result<(), IndexError> {
        self.walk_covering(range, |_| true)?;
        self.reserve_splits(range)?;
        self.split_at(range.begin);
        self.split_at(range.end);
        self.entries.retain(|r| !range.contains(&r.range));
        Ok(())
    }

    /// Replace the mode of a fully covered range.
    pub fn set_mode(&mut self, range: &PageRange, mode: Mode) -> Result<(), IndexError> {
        self.walk_covering(range, |_| true)?;
        self.reserve_splits(range)?;
        self.split_at(range.begin);
        self.split_at(range.end);
        for r in self.entries.iter_mut() {
            if range.contains(&r.range) {
                r.mode = mode;
            }
        }
        self.coalesce();
        Ok(())
    }

    /// Visit the entries covering `range` in order. Fails with `NotCovered`
    /// on any gap, or as soon as `visit` returns false.
    fn walk_covering(
        &self,
        range: &PageRange,
        mut visit: impl FnMut(&Region) -> bool,
    ) -> Result<(), IndexError> {
        if range.is_empty() {
            return Err(IndexError::NotCovered);
        }
        let mut cursor = range.begin;
        for r in self.entries.iter() {
            if r.range.end <= cursor {
                continue;
            }
            if r.range.begin > cursor || !visit(r) {
                return Err(IndexError::NotCovered);
            }
            cursor = r.range.end;
            if cursor >= range.end {
                return Ok(());
            }
        }
        Err(IndexError::NotCovered)
    }

    fn reserve_splits(&self, range: &PageRange) -> Result<(), IndexError> {
        let splits = [range.begin, range.end]
            .iter()
            .filter(|&&at| {
                self.entries
                    .iter()
                    .any(|r| r.range.begin < at && at < r.range.end)
            })
            .count();
        if self.entries.len() + splits > self.entries.capacity() {
            return Err(IndexError::Full);
        }
        Ok(())
    }

    fn split_at(&mut self, at: u64) {
        if let Some(i) = self
            .entries
            .iter()
            .position(|r| r.range.begin < at && at < r.range.end)
        {
            let tail = Region {
                range: PageRange::new(at, self.entries[i].range.end),
                mode: self.entries[i].mode,
            };
            self.entries[i].range.end = at;
            // Capacity was checked by `reserve_splits`.
            let _ = self.entries.insert(i + 1, tail);
        }
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.entries.len() {
            let (a, b) = (self.entries[i], self.entries[i + 1]);
            if a.range.end == b.range.begin && a.mode == b.mode {
                self.entries[i].range.end = b.range.end;
                self.entries.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = 0x8000_0000;

    fn pages(first: u64, count: u64) -> PageRange {
        PageRange::from_pages(P + first * PAGE_SIZE, count).unwrap()
    }

    #[test]
    fn set_mode_splits_then_merges_back() {
        let mut idx = RegionIndex::new();
        idx.insert(pages(0, 8), Mode::R | Mode::W).unwrap();
        idx.set_mode(&pages(2, 2), Mode::R | Mode::W | Mode::SHARED)
            .unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.mode_of(&pages(0, 8)), None);
        assert_eq!(
            idx.mode_of(&pages(2, 2)),
            Some(Mode::R | Mode::W | Mode::SHARED)
        );
        idx.set_mode(&pages(2, 2), Mode::R | Mode::W).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.mode_of(&pages(0, 8)), Some(Mode::R | Mode::W));
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut idx = RegionIndex::new();
        idx.insert(pages(0, 4), Mode::R).unwrap();
        assert_eq!(idx.insert(pages(3, 2), Mode::R), Err(IndexError::Overlap));
        idx.insert(pages(4, 2), Mode::R).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn remove_requires_full_coverage() {
        let mut idx = RegionIndex::new();
        idx.insert(pages(0, 2), Mode::R).unwrap();
        idx.insert(pages(3, 2), Mode::R).unwrap();
        assert_eq!(idx.remove(&pages(1, 3)), Err(IndexError::NotCovered));
        idx.remove(&pages(1, 1)).unwrap();
        assert_eq!(idx.mode_of(&pages(0, 1)), Some(Mode::R));
        assert!(!idx.overlaps(&pages(1, 1)));
    }
}
