// SPDX-License-Identifier: MPL-2.0

//! Writeback of dirty entries and detection of externally pinned frames.

use crate::{
    config::{PAGEVEC_SIZE, WRITEBACK_TAG_BATCH},
    entry::{DaxEntry, DaxMark, DaxSlot, EntrySize},
    mapping::{DaxMapping, DaxMappingFlags},
    prelude::*,
};

/// How thoroughly a writeback must be carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Best-effort background writeback, which DAX has nothing to do for.
    None,
    /// Data-integrity writeback.
    All,
}

/// The byte range and the mode of a writeback.
#[derive(Clone, Copy, Debug)]
pub struct WritebackControl {
    pub range_start: u64,
    /// The last byte of the range, inclusive.
    pub range_end: u64,
    pub sync_mode: SyncMode,
}

impl WritebackControl {
    /// Describes a data-integrity writeback of the whole file.
    pub fn sync_all() -> Self {
        Self {
            range_start: 0,
            range_end: u64::MAX,
            sync_mode: SyncMode::All,
        }
    }
}

impl DaxMapping {
    /// Flushes the CPU caches of every entry dirtied in the range.
    ///
    /// A failure on one entry is recorded with [`DaxMapping::set_error`] and
    /// does not stop the sweep; the first failure is returned at the end.
    pub fn writeback_range(&self, wbc: &WritebackControl) -> Result<()> {
        if self.nr_entries() == 0 || wbc.sync_mode != SyncMode::All {
            return Ok(());
        }

        let start_index = wbc.range_start >> PAGE_SHIFT;
        let end_index = wbc.range_end >> PAGE_SHIFT;
        debug!(
            "dax: writeback of mapping {:?}, pages {:#x}..={:#x}",
            self.id(),
            start_index,
            end_index
        );

        self.tag_for_writeback(start_index, end_index);

        let mut first_error = None;
        let mut next_index = align_down(start_index, PG_PMD_NR);
        while next_index <= end_index {
            let batch: Vec<(u64, DaxEntry)> = {
                let pages = self.entries().read();
                pages
                    .marked(next_index..end_index.saturating_add(1), DaxMark::Towrite)
                    .filter(|&(index, slot)| overlaps_from(index, slot, start_index))
                    .take(PAGEVEC_SIZE)
                    .map(|(index, slot)| (index, slot.entry))
                    .collect()
            };
            let Some(&(last_index, _)) = batch.last() else {
                break;
            };

            for (index, entry) in batch {
                if let Err(err) = self.writeback_one(index, entry) {
                    warn!("dax: writeback of entry {:#x} failed: {}", index, err);
                    self.set_error(err);
                    first_error.get_or_insert(err);
                }
            }
            next_index = last_index.saturating_add(1);
            if last_index == u64::MAX {
                break;
            }
        }

        debug!("dax: writeback of mapping {:?} done", self.id());
        first_error.map_or(Ok(()), Err)
    }

    /// Marks every dirty entry of the range for writeback.
    fn tag_for_writeback(&self, start_index: u64, end_index: u64) {
        let range_end = end_index.saturating_add(1);
        let mut next_index = align_down(start_index, PG_PMD_NR);
        loop {
            let mut pages = self.entries().lock();
            let dirty: Vec<u64> = pages
                .marked(next_index..range_end, DaxMark::Dirty)
                .filter(|&(index, slot)| overlaps_from(index, slot, start_index))
                .take(WRITEBACK_TAG_BATCH)
                .map(|(index, _)| index)
                .collect();
            for &index in &dirty {
                let marked = pages.set_mark(index, DaxMark::Towrite);
                debug_assert!(marked.is_ok());
            }
            drop(pages);

            match dirty.last() {
                Some(&last) if dirty.len() == WRITEBACK_TAG_BATCH && last < end_index => {
                    next_index = last + 1;
                }
                _ => return,
            }
        }
    }

    /// Writes back the entry at `index`, which was found with `entry` while
    /// tagged for writeback.
    fn writeback_one(&self, index: u64, entry: DaxEntry) -> Result<()> {
        let mut pages = self.lock_pages();
        let Some(found) = pages.get_unlocked(index) else {
            return Ok(());
        };

        // The entry may have been replaced while we slept.
        if found.entry().pfn() != entry.pfn() {
            found.put();
            return Ok(());
        }
        if entry.is_empty() || entry.is_zero() {
            found.put();
            return_errno_with_msg!(IoFailed, "an entry without data is tagged for writeback");
        }

        // Someone else wrote the entry back already.
        let slot_index = found.slot_index();
        if !pages.pages().is_marked(slot_index, DaxMark::Towrite) {
            found.put();
            return Ok(());
        }

        // Take the entry so that a racing fault cannot dirty it again until
        // its page-table entries are write-protected.
        let locked = found.lock(&mut pages);
        let unmarked = pages.pages().unset_mark(slot_index, DaxMark::Towrite);
        debug_assert!(unmarked.is_ok());
        pages.unlock();

        let pfn = locked.entry().pfn();
        let size = entry.size();
        self.rmap().write_protect(slot_index, pfn, size);
        self.device().read_lock().flush_frames(pfn, size.bytes());

        // A fault that dirties the entry again needs the lock, so clearing
        // the dirty mark here cannot lose it.
        let unmarked = pages.pages().unset_mark(slot_index, DaxMark::Dirty);
        debug_assert!(unmarked.is_ok());
        drop(pages);
        drop(locked);

        trace!("dax: wrote back entry {:#x}, pfn {:#x}", slot_index, pfn);
        Ok(())
    }

    /// Returns a frame of the mapping that something outside the page cache
    /// still holds, after unmapping the whole file.
    pub fn layout_busy_frame(&self) -> Option<Pfn> {
        if self.flags().contains(DaxMappingFlags::LIMITED) || !self.rmap().is_mapped() {
            return None;
        }

        // New references can only come from page faults or direct I/O on
        // a mapped range, so unmap everything first.
        self.rmap().unmap_pages(0, 0);

        let mut next_index = 0;
        loop {
            let batch: Vec<u64> = {
                let pages = self.entries().read();
                pages
                    .range(next_index..u64::MAX)
                    .take(PAGEVEC_SIZE)
                    .map(|(index, _)| index)
                    .collect()
            };
            if batch.is_empty() {
                return None;
            }

            for index in batch {
                if index < next_index {
                    continue;
                }
                let mut pages = self.lock_pages();
                let Some(found) = pages.get_unlocked(index) else {
                    next_index = index + 1;
                    continue;
                };
                let entry = found.entry();
                found.put();
                drop(pages);

                if let Some(pfn) = self.busy_frame(&entry) {
                    debug!("dax: frame {:#x} of entry {:#x} is busy", pfn, index);
                    return Some(pfn);
                }
                next_index = align_down(index, entry.size().nr_pages()) + entry.size().nr_pages();
            }
        }
    }

    fn busy_frame(&self, entry: &DaxEntry) -> Option<Pfn> {
        let pagemap = self.device().pagemap();
        entry
            .mapped_pfns()
            .find(|&pfn| pagemap.frame(pfn).is_some_and(|frame| frame.is_busy()))
    }
}

/// Whether the entry stored at `index` covers any page at or after `start`.
///
/// A huge entry sits at its aligned head index, before pages it covers.
fn overlaps_from(index: u64, slot: &DaxSlot, start: u64) -> bool {
    index >= start || (slot.entry.size() == EntrySize::Pmd && index + PG_PMD_NR > start)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entry::EntryFlags,
        fault::{FaultFlags, VmFault, VmFlags},
        test_util::{TestEnv, TestEnvOptions},
    };

    fn dirty_pages(env: &TestEnv, indices: &[u64]) {
        let vma = env.vma(VmFlags::SHARED);
        for &index in indices {
            let mut vmf = VmFault::new(&vma, vma.addr_of(index), FaultFlags::WRITE);
            env.mapping.fault(&mut vmf, EntrySize::Pte, &*env.fs);
        }
    }

    #[test]
    fn writeback_flushes_dirty_entries_once() {
        let env = TestEnv::new();
        dirty_pages(&env, &[5, 6]);
        let base = env.base_pfn();

        env.mapping.writeback_range(&WritebackControl::sync_all()).unwrap();
        assert_eq!(
            env.pmem.flushes(),
            [(5 * PAGE_SIZE, PAGE_SIZE), (6 * PAGE_SIZE, PAGE_SIZE)]
        );
        assert_eq!(
            env.rmap.write_protected(),
            [(5, base + 5, EntrySize::Pte), (6, base + 6, EntrySize::Pte)]
        );
        for index in [5, 6] {
            assert!(!env.mapping.is_entry_marked(index, DaxMark::Dirty));
            assert!(!env.mapping.is_entry_marked(index, DaxMark::Towrite));
            assert!(!env.mapping.is_entry_locked(index));
        }

        env.pmem.clear_flushes();
        env.mapping.writeback_range(&WritebackControl::sync_all()).unwrap();
        assert!(env.pmem.flushes().is_empty());
    }

    #[test]
    fn writeback_of_huge_entry() {
        let env = TestEnv::new();
        let vma = env.vma(VmFlags::SHARED);
        let mut vmf = VmFault::new(&vma, vma.addr_of(0), FaultFlags::WRITE);
        env.mapping.fault(&mut vmf, EntrySize::Pmd, &*env.fs);

        env.mapping.writeback_range(&WritebackControl::sync_all()).unwrap();
        assert_eq!(env.pmem.flushes(), [(0, PMD_SIZE)]);
        assert!(!env.mapping.is_entry_marked(0, DaxMark::Dirty));
    }

    #[test]
    fn writeback_from_inside_huge_entry() {
        let env = TestEnv::new();
        let vma = env.vma(VmFlags::SHARED);
        let mut vmf = VmFault::new(&vma, vma.addr_of(0), FaultFlags::WRITE);
        env.mapping.fault(&mut vmf, EntrySize::Pmd, &*env.fs);

        let wbc = WritebackControl {
            range_start: 5 * PAGE_SIZE as u64,
            range_end: 10 * PAGE_SIZE as u64 - 1,
            sync_mode: SyncMode::All,
        };
        env.mapping.writeback_range(&wbc).unwrap();
        assert_eq!(env.pmem.flushes(), [(0, PMD_SIZE)]);
        assert!(!env.mapping.is_entry_marked(0, DaxMark::Dirty));
        assert!(!env.mapping.is_entry_marked(0, DaxMark::Towrite));
    }

    #[test]
    fn writeback_skips_small_entries_before_range() {
        let env = TestEnv::new();
        dirty_pages(&env, &[1, 5]);

        let wbc = WritebackControl {
            range_start: 4 * PAGE_SIZE as u64,
            range_end: 6 * PAGE_SIZE as u64 - 1,
            sync_mode: SyncMode::All,
        };
        env.mapping.writeback_range(&wbc).unwrap();
        assert_eq!(env.pmem.flushes(), [(5 * PAGE_SIZE, PAGE_SIZE)]);
        assert!(env.mapping.is_entry_marked(1, DaxMark::Dirty));
        assert!(!env.mapping.is_entry_marked(1, DaxMark::Towrite));
    }

    #[test]
    fn writeback_stays_in_range() {
        let env = TestEnv::new();
        dirty_pages(&env, &[1, 2, 3]);

        let wbc = WritebackControl {
            range_start: 2 * PAGE_SIZE as u64,
            range_end: 3 * PAGE_SIZE as u64 - 1,
            sync_mode: SyncMode::All,
        };
        env.mapping.writeback_range(&wbc).unwrap();
        assert_eq!(env.pmem.flushes(), [(2 * PAGE_SIZE, PAGE_SIZE)]);
        assert!(env.mapping.is_entry_marked(1, DaxMark::Dirty));
        assert!(!env.mapping.is_entry_marked(2, DaxMark::Dirty));
        assert!(env.mapping.is_entry_marked(3, DaxMark::Dirty));
    }

    #[test]
    fn background_writeback_does_nothing() {
        let env = TestEnv::new();
        dirty_pages(&env, &[0]);

        let wbc = WritebackControl {
            sync_mode: SyncMode::None,
            ..WritebackControl::sync_all()
        };
        env.mapping.writeback_range(&wbc).unwrap();
        assert!(env.pmem.flushes().is_empty());
        assert!(env.mapping.is_entry_marked(0, DaxMark::Dirty));
    }

    #[test]
    fn writeback_error_is_sticky_and_does_not_stop() {
        let env = TestEnv::new();
        dirty_pages(&env, &[9]);

        // A dirty entry with no data behind it cannot be written back.
        let mut locked = env.mapping.grab_entry(4, EntrySize::Pte).unwrap();
        env.mapping
            .insert_mapping(&mut locked, 0x1, EntryFlags::ZERO_PAGE, true);
        drop(locked);

        let err = env
            .mapping
            .writeback_range(&WritebackControl::sync_all())
            .unwrap_err();
        assert_eq!(err.errno(), IoFailed);
        assert_eq!(env.pmem.flushes(), [(9 * PAGE_SIZE, PAGE_SIZE)]);
        assert!(!env.mapping.is_entry_locked(4));

        assert_eq!(env.mapping.take_error().map(|err| err.errno()), Some(IoFailed));
        assert!(env.mapping.take_error().is_none());
    }

    #[test]
    fn busy_frame_is_reported() {
        let env = TestEnv::new();
        dirty_pages(&env, &[3]);
        let pfn = env.base_pfn() + 3;
        let pagemap = env.device.pagemap();

        assert_eq!(env.mapping.layout_busy_frame(), None);
        assert_eq!(env.rmap.unmapped().last(), Some(&(0, 0)));

        let pinned = pagemap.pin(pfn).unwrap();
        assert_eq!(env.mapping.layout_busy_frame(), Some(pfn));
        drop(pinned);
        assert_eq!(env.mapping.layout_busy_frame(), None);
    }

    #[test]
    fn busy_frame_skipped_when_unmapped_or_limited() {
        let env = TestEnv::new();
        dirty_pages(&env, &[3]);
        let _pinned = env.device.pagemap().pin(env.base_pfn() + 3).unwrap();

        env.rmap.set_mapped(false);
        assert_eq!(env.mapping.layout_busy_frame(), None);
        assert!(env.rmap.unmapped().is_empty());

        let env = TestEnv::with_options(TestEnvOptions {
            flags: DaxMappingFlags::LIMITED,
            ..Default::default()
        });
        assert_eq!(env.mapping.layout_busy_frame(), None);
    }
}
