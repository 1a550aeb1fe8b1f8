// SPDX-License-Identifier: MPL-2.0

//! DAX mappings.
//!
//! A [`DaxMapping`] is the per-file index of [`DaxEntry`]s, one per mapped
//! page or huge page. Every change to an entry, its marks or its lock bit
//! happens under the structural lock of the index. The lock bit lets a fault
//! or a writeback own one entry for a long time without holding the
//! structural lock; other threads that need the entry sleep in the shared
//! [`WaitTable`] until it is released.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex as SpinLock;
use xarray::XArray;

pub use self::{
    locking::{FrameEntryGuard, lock_frame_entry},
    options::{DaxMappingFlags, DaxMappingOptions},
};
pub(crate) use self::locking::{LockedEntry, PagesGuard};
use crate::{
    device::DaxDevice,
    entry::{DaxEntry, DaxMark, DaxSlot, EntrySize},
    prelude::*,
    wait_table::WaitTable,
};

mod lifecycle;
mod locking;
mod options;

/// The identity of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappingId(u64);

impl MappingId {
    pub(crate) fn alloc() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// The address spaces that map a file.
pub trait ReverseMap: Send + Sync {
    /// Returns whether any address space maps the file.
    fn is_mapped(&self) -> bool;

    /// Removes the page-table entries of `nr_pages` pages starting at
    /// `start`; `nr_pages == 0` means up to the end of the file.
    fn unmap_pages(&self, start: u64, nr_pages: u64);

    /// Write-protects and cleans every page-table entry mapping the entry
    /// at `index`, which is backed by `pfn` and covers `size`.
    fn write_protect(&self, index: u64, pfn: Pfn, size: EntrySize);
}

/// Fault counters of a mapping.
#[derive(Debug, Default)]
pub struct FaultStats {
    major: AtomicU64,
    pmd_fallback: AtomicU64,
}

impl FaultStats {
    /// Returns the number of faults that had to allocate blocks.
    pub fn major_faults(&self) -> u64 {
        self.major.load(Ordering::Relaxed)
    }

    /// Returns the number of PMD faults that fell back to PTE faults.
    pub fn pmd_fallbacks(&self) -> u64 {
        self.pmd_fallback.load(Ordering::Relaxed)
    }

    pub(crate) fn count_major(&self) {
        self.major.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_pmd_fallback(&self) {
        self.pmd_fallback.fetch_add(1, Ordering::Relaxed);
    }
}

/// The DAX page cache of one file.
pub struct DaxMapping {
    id: MappingId,
    this: Weak<DaxMapping>,
    pages: XArray<DaxSlot, DaxMark>,
    /// The number of entries in `pages`.
    nr_exceptional: AtomicUsize,
    size: AtomicU64,
    flags: DaxMappingFlags,
    device: Arc<DaxDevice>,
    rmap: Arc<dyn ReverseMap>,
    wait_table: Arc<WaitTable>,
    /// The first writeback error not yet reported.
    wb_error: SpinLock<Option<Error>>,
    inode_dirty: AtomicBool,
    stats: FaultStats,
}

impl DaxMapping {
    fn new(
        this: Weak<DaxMapping>,
        device: Arc<DaxDevice>,
        rmap: Arc<dyn ReverseMap>,
        size: u64,
        flags: DaxMappingFlags,
        wait_table: Arc<WaitTable>,
        index_capacity: Option<usize>,
    ) -> Self {
        let pages = match index_capacity {
            Some(capacity) => XArray::with_capacity_limit(capacity),
            None => XArray::new(),
        };
        Self {
            id: MappingId::alloc(),
            this,
            pages,
            nr_exceptional: AtomicUsize::new(0),
            size: AtomicU64::new(size),
            flags,
            device,
            rmap,
            wait_table,
            wb_error: SpinLock::new(None),
            inode_dirty: AtomicBool::new(false),
            stats: FaultStats::default(),
        }
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Sets the file size in bytes.
    ///
    /// Removing the entries beyond a shrunk size is up to the caller.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn flags(&self) -> DaxMappingFlags {
        self.flags
    }

    pub fn device(&self) -> &Arc<DaxDevice> {
        &self.device
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Returns the number of entries.
    pub fn nr_entries(&self) -> usize {
        self.nr_exceptional.load(Ordering::Acquire)
    }

    /// Returns the entry covering `index`.
    pub fn load_entry(&self, index: u64) -> Option<DaxEntry> {
        let pages = self.pages.read();
        lookup_slot(|i| pages.load(i).copied(), index).map(|(_, slot)| slot.entry)
    }

    /// Returns whether the entry covering `index` is locked.
    pub fn is_entry_locked(&self, index: u64) -> bool {
        let pages = self.pages.read();
        lookup_slot(|i| pages.load(i).copied(), index).is_some_and(|(_, slot)| slot.locked)
    }

    /// Returns whether the entry covering `index` carries `mark`.
    pub fn is_entry_marked(&self, index: u64, mark: DaxMark) -> bool {
        let pages = self.pages.read();
        lookup_slot(|i| pages.load(i).copied(), index)
            .is_some_and(|(slot_index, _)| pages.is_marked(slot_index, mark))
    }

    /// Records a writeback error; the first one sticks until taken.
    pub fn set_error(&self, error: Error) {
        let mut wb_error = self.wb_error.lock();
        if wb_error.is_none() {
            *wb_error = Some(error);
        }
    }

    /// Takes the recorded writeback error.
    pub fn take_error(&self) -> Option<Error> {
        self.wb_error.lock().take()
    }

    /// Returns whether a fault dirtied the inode.
    pub fn is_inode_dirty(&self) -> bool {
        self.inode_dirty.load(Ordering::Acquire)
    }

    pub fn clear_inode_dirty(&self) {
        self.inode_dirty.store(false, Ordering::Release);
    }

    pub(crate) fn mark_inode_dirty(&self) {
        self.inode_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn entries(&self) -> &XArray<DaxSlot, DaxMark> {
        &self.pages
    }

    pub(crate) fn lock_pages(&self) -> PagesGuard<'_> {
        PagesGuard::new(self)
    }

    pub(crate) fn rmap(&self) -> &dyn ReverseMap {
        self.rmap.as_ref()
    }

    pub(crate) fn wake(&self, index: u64, entry: &DaxEntry, wake_all: bool) -> usize {
        self.wait_table.wake(self.id, index, entry, wake_all)
    }
}

impl Debug for DaxMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaxMapping")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("nr_entries", &self.nr_entries())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Finds the slot covering `index`: the slot at `index` itself or a PMD slot
/// at the PMD boundary below it.
pub(crate) fn lookup_slot(load: impl Fn(u64) -> Option<DaxSlot>, index: u64) -> Option<(u64, DaxSlot)> {
    if let Some(slot) = load(index) {
        return Some((index, slot));
    }
    let head = align_down(index, PG_PMD_NR);
    if head == index {
        return None;
    }
    load(head)
        .filter(|slot| slot.entry.is_pmd())
        .map(|slot| (head, slot))
}
