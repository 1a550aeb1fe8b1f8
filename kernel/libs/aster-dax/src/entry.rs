// SPDX-License-Identifier: MPL-2.0

//! The value stored in a mapping's entry index.
//!
//! A [`DaxEntry`] records which persistent-memory frames back one page (PTE)
//! or one huge page (PMD) of a file, or that the range is a hole served by
//! the shared zero page, or that a fault is still setting the range up
//! (an empty entry). Entries never reference any frame metadata; the only
//! physical information they keep is the base page frame number.

use core::ops::Range;

use bitflags::bitflags;

use crate::config::{PAGE_SHIFT, PMD_ORDER};

/// A page frame number.
pub type Pfn = u64;

/// The granularity of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntrySize {
    /// One base page.
    Pte,
    /// One PMD-sized huge page.
    Pmd,
}

impl EntrySize {
    /// Returns the page order of the granularity.
    pub const fn order(self) -> u32 {
        match self {
            EntrySize::Pte => 0,
            EntrySize::Pmd => PMD_ORDER,
        }
    }

    /// Returns the number of base pages covered.
    pub const fn nr_pages(self) -> u64 {
        1 << self.order()
    }

    /// Returns the number of bytes covered.
    pub const fn bytes(self) -> usize {
        1 << (self.order() + PAGE_SHIFT)
    }
}

bitflags! {
    /// The flags encoded into an entry next to its frame number.
    pub struct EntryFlags: u8 {
        /// The entry covers a PMD.
        const PMD       = 1 << 1;
        /// The entry maps the shared zero page.
        const ZERO_PAGE = 1 << 2;
        /// The entry is a placeholder reserved by an in-progress fault.
        const EMPTY     = 1 << 3;
    }
}

/// An entry of a DAX mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaxEntry {
    /// A placeholder with no frame.
    Empty { size: EntrySize },
    /// A hole mapped to the shared zero page.
    ZeroPage { pfn: Pfn, size: EntrySize },
    /// A real persistent-memory mapping.
    Normal { pfn: Pfn, size: EntrySize },
}

impl DaxEntry {
    /// Builds an entry from a frame number and flags.
    ///
    /// `EMPTY` takes precedence over `ZERO_PAGE`; the frame number of an
    /// empty entry is discarded.
    pub fn encode(pfn: Pfn, flags: EntryFlags) -> Self {
        let size = if flags.contains(EntryFlags::PMD) {
            EntrySize::Pmd
        } else {
            EntrySize::Pte
        };
        if flags.contains(EntryFlags::EMPTY) {
            DaxEntry::Empty { size }
        } else if flags.contains(EntryFlags::ZERO_PAGE) {
            DaxEntry::ZeroPage { pfn, size }
        } else {
            DaxEntry::Normal { pfn, size }
        }
    }

    /// Builds an empty entry of the given granularity.
    pub const fn empty(size: EntrySize) -> Self {
        DaxEntry::Empty { size }
    }

    /// Returns the flags the entry was encoded with.
    pub fn flags(&self) -> EntryFlags {
        let mut flags = match self {
            DaxEntry::Empty { .. } => EntryFlags::EMPTY,
            DaxEntry::ZeroPage { .. } => EntryFlags::ZERO_PAGE,
            DaxEntry::Normal { .. } => EntryFlags::empty(),
        };
        if self.is_pmd() {
            flags |= EntryFlags::PMD;
        }
        flags
    }

    /// Returns the base frame number, 0 for an empty entry.
    pub fn pfn(&self) -> Pfn {
        match *self {
            DaxEntry::Empty { .. } => 0,
            DaxEntry::ZeroPage { pfn, .. } | DaxEntry::Normal { pfn, .. } => pfn,
        }
    }

    /// Returns the granularity.
    pub fn size(&self) -> EntrySize {
        match *self {
            DaxEntry::Empty { size }
            | DaxEntry::ZeroPage { size, .. }
            | DaxEntry::Normal { size, .. } => size,
        }
    }

    /// Returns the page order of the granularity.
    pub fn order(&self) -> u32 {
        self.size().order()
    }

    pub fn is_pmd(&self) -> bool {
        self.size() == EntrySize::Pmd
    }

    pub fn is_pte(&self) -> bool {
        self.size() == EntrySize::Pte
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, DaxEntry::ZeroPage { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DaxEntry::Empty { .. })
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, DaxEntry::Normal { .. })
    }

    /// Returns the number of bytes of device memory the entry owns.
    ///
    /// Empty and zero-page entries own no device memory.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DaxEntry::Normal { size, .. } => size.bytes(),
            _ => 0,
        }
    }

    /// Returns the frame number just past the owned device memory.
    pub fn end_pfn(&self) -> Pfn {
        self.pfn() + (self.size_in_bytes() >> PAGE_SHIFT) as u64
    }

    /// Returns the frames owned by the entry.
    pub fn mapped_pfns(&self) -> Range<Pfn> {
        self.pfn()..self.end_pfn()
    }
}

/// An entry as stored in the index, with the lock bit of the entry protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DaxSlot {
    pub(crate) entry: DaxEntry,
    pub(crate) locked: bool,
}

impl DaxSlot {
    pub(crate) const fn new(entry: DaxEntry, locked: bool) -> Self {
        Self { entry, locked }
    }
}

/// The marks an entry can carry in the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaxMark {
    /// The entry has been written through a mapping since the last writeback.
    Dirty,
    /// The entry is part of the writeback in progress.
    Towrite,
}

impl From<DaxMark> for xarray::XMark {
    fn from(mark: DaxMark) -> Self {
        match mark {
            DaxMark::Dirty => xarray::XMark::Mark0,
            DaxMark::Towrite => xarray::XMark::Mark1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_flags() {
        let entry = DaxEntry::encode(0x1000, EntryFlags::PMD);
        assert_eq!(entry, DaxEntry::Normal { pfn: 0x1000, size: EntrySize::Pmd });
        assert!(entry.is_pmd() && entry.is_normal());
        assert_eq!(entry.flags(), EntryFlags::PMD);

        let zero = DaxEntry::encode(7, EntryFlags::ZERO_PAGE);
        assert!(zero.is_zero() && zero.is_pte());
        assert_eq!(zero.pfn(), 7);

        let empty = DaxEntry::encode(7, EntryFlags::EMPTY | EntryFlags::ZERO_PAGE | EntryFlags::PMD);
        assert_eq!(empty, DaxEntry::empty(EntrySize::Pmd));
        assert_eq!(empty.pfn(), 0);
        assert_eq!(empty.flags(), EntryFlags::EMPTY | EntryFlags::PMD);
    }

    #[test]
    fn owned_frames() {
        let pmd = DaxEntry::encode(512, EntryFlags::PMD);
        assert_eq!(pmd.size_in_bytes(), 2 << 20);
        assert_eq!(pmd.mapped_pfns(), 512..1024);
        assert_eq!(pmd.order(), 9);

        let pte = DaxEntry::encode(3, EntryFlags::empty());
        assert_eq!(pte.mapped_pfns(), 3..4);

        // Zero-page and empty entries own nothing, whatever their granularity.
        assert!(DaxEntry::encode(3, EntryFlags::ZERO_PAGE | EntryFlags::PMD).mapped_pfns().is_empty());
        assert!(DaxEntry::empty(EntrySize::Pmd).mapped_pfns().is_empty());
        assert_eq!(DaxEntry::empty(EntrySize::Pmd).order(), 9);
    }
}
