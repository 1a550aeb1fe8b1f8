// SPDX-License-Identifier: MPL-2.0

//! Creation, association and removal of entries.

use std::sync::atomic::Ordering;

use super::{DaxMapping, DaxMappingFlags, LockedEntry};
use crate::{
    entry::{DaxEntry, DaxMark, DaxSlot, EntryFlags, EntrySize},
    frame::FrameOwner,
    prelude::*,
};

impl DaxMapping {
    /// Finds the entry covering `index` or creates an empty one of `size`,
    /// and returns it locked.
    ///
    /// A PTE request that finds a zero-page or empty PMD entry replaces it
    /// with a PTE entry, unmapping the whole PMD range first if it was a zero
    /// page. A PTE request that finds a real PMD mapping gets the PMD entry.
    ///
    /// # Errors
    ///
    /// - `Conflict` if a PMD is requested where PTE entries exist.
    /// - `OutOfMemory` if the index has no room for a new entry.
    pub(crate) fn grab_entry(&self, index: u64, size: EntrySize) -> Result<LockedEntry<'_>> {
        loop {
            let mut pages = self.lock_pages();
            let pinned = match pages.get_unlocked(index) {
                Some(found) if size == EntrySize::Pmd && found.entry().is_pte() => {
                    found.put();
                    return_errno_with_msg!(Conflict, "PTE entries exist in the PMD range");
                }
                Some(found)
                    if size == EntrySize::Pte
                        && found.entry().is_pmd()
                        && (found.entry().is_zero() || found.entry().is_empty()) =>
                {
                    Some(found.lock(&mut pages))
                }
                Some(found) => return Ok(found.lock(&mut pages)),
                None => None,
            };
            pages.unlock();

            // The PMD entry stays locked while it is being replaced, so any
            // fault on its range keeps waiting until the PTE entry is in.
            if let Some(old) = &pinned {
                let old_entry = old.entry();
                debug_assert!(!old_entry.is_normal(), "downgrading a mapped PMD");
                if old_entry.is_zero() {
                    self.rmap()
                        .unmap_pages(align_down(index, PG_PMD_NR), PG_PMD_NR);
                }
            }

            let preload = match self.pages.preload() {
                Ok(preload) => preload,
                Err(err) => {
                    drop(pinned);
                    return Err(err.into());
                }
            };

            // Someone may have inserted an entry while the lock was not held.
            if pinned.is_none() && pages.lookup(index).is_some() {
                continue;
            }

            let slot_index = align_down(index, size.nr_pages());
            if size == EntrySize::Pmd
                && pages
                    .pages()
                    .is_occupied(slot_index..slot_index + PG_PMD_NR)
            {
                return_errno_with_msg!(Conflict, "PTE entries exist in the PMD range");
            }

            if let Some(old) = pinned {
                let old_entry = old.entry();
                self.disassociate_entry(&old_entry, false);
                pages.pages().remove(old.slot_index());
                self.nr_exceptional.fetch_sub(1, Ordering::AcqRel);
                // The granularity changes, so every waiter has to look again.
                self.wake(index, &old_entry, true);
                old.forget_removed();
            }

            let entry = DaxEntry::empty(size);
            pages
                .pages()
                .store_preloaded(slot_index, DaxSlot::new(entry, true), preload);
            self.nr_exceptional.fetch_add(1, Ordering::AcqRel);
            trace!(
                "dax: new {:?} entry at {:#x} of mapping {:?}",
                size, slot_index, self.id
            );
            return Ok(LockedEntry::new(self, index, slot_index, entry));
        }
    }

    /// Points the frames of `entry` back at this mapping.
    pub(crate) fn associate_entry(&self, entry: &DaxEntry, index: u64) {
        if self.flags.contains(DaxMappingFlags::LIMITED) {
            return;
        }

        let base = align_down(index, entry.size().nr_pages());
        let pagemap = self.device.pagemap();
        for (offset, pfn) in entry.mapped_pfns().enumerate() {
            let Some(frame) = pagemap.frame(pfn) else {
                warn!("dax: frame {:#x} is outside the device", pfn);
                continue;
            };
            let previous = frame.set_owner(FrameOwner {
                mapping: self.this.clone(),
                id: self.id,
                index: base + offset as u64,
            });
            debug_assert!(
                previous.is_none_or(|owner| owner.id == self.id),
                "frame {:#x} belongs to another mapping",
                pfn
            );
        }
    }

    /// Clears the back-references of the frames of `entry`.
    pub(crate) fn disassociate_entry(&self, entry: &DaxEntry, truncate: bool) {
        if self.flags.contains(DaxMappingFlags::LIMITED) {
            return;
        }

        let pagemap = self.device.pagemap();
        for pfn in entry.mapped_pfns() {
            let Some(frame) = pagemap.frame(pfn) else {
                continue;
            };
            if truncate && frame.is_busy() {
                warn!("dax: truncating frame {:#x} that is still pinned", pfn);
            }
            let previous = frame.clear_owner();
            debug_assert!(
                previous.is_none_or(|owner| owner.id == self.id),
                "frame {:#x} belongs to another mapping",
                pfn
            );
        }
    }

    fn invalidate_entry(&self, index: u64, truncate: bool) -> bool {
        let mut pages = self.lock_pages();
        let Some(found) = pages.get_unlocked(index) else {
            return false;
        };

        let slot_index = found.slot_index();
        if !truncate {
            let locked = pages.pages();
            if locked.is_marked(slot_index, DaxMark::Dirty)
                || locked.is_marked(slot_index, DaxMark::Towrite)
            {
                found.put();
                return false;
            }
        }

        self.disassociate_entry(&found.entry(), truncate);
        pages.pages().remove(slot_index);
        self.nr_exceptional.fetch_sub(1, Ordering::AcqRel);
        found.put();
        true
    }

    /// Deletes the entry covering `index` for truncation or hole punching,
    /// waiting for its current holder first.
    ///
    /// The caller must know that an entry exists.
    pub fn delete_entry(&self, index: u64) -> bool {
        let removed = self.invalidate_entry(index, true);
        if !removed {
            warn!("dax: no entry to delete at {:#x}", index);
        }
        removed
    }

    /// Removes the entry covering `index` unless it has data waiting for
    /// writeback.
    pub fn invalidate_entry_if_clean(&self, index: u64) -> bool {
        self.invalidate_entry(index, false)
    }

    /// Makes the locked entry map `pfn`, and returns the resulting entry.
    ///
    /// Only empty and zero-page entries are replaced. Any other entry is
    /// kept as it is.
    pub(crate) fn insert_mapping(
        &self,
        locked: &mut LockedEntry<'_>,
        pfn: Pfn,
        flags: EntryFlags,
        mark_dirty: bool,
    ) -> DaxEntry {
        let index = locked.index();
        let old = locked.entry();
        let new = DaxEntry::encode(pfn, flags);

        if mark_dirty {
            self.mark_inode_dirty();
        }

        if old.is_zero() && !new.is_zero() {
            if old.is_pmd() {
                self.rmap()
                    .unmap_pages(align_down(index, PG_PMD_NR), PG_PMD_NR);
            } else {
                self.rmap().unmap_pages(index, 1);
            }
        }

        let mut pages = self.lock_pages();
        let slot_index = locked.slot_index();
        let result = if old.is_zero() || old.is_empty() {
            if old.size_in_bytes() != new.size_in_bytes() {
                self.disassociate_entry(&old, false);
                self.associate_entry(&new, index);
            }
            let replaced = pages.pages().store(slot_index, DaxSlot::new(new, true));
            debug_assert_eq!(replaced, Some(DaxSlot::new(old, true)));
            locked.set_entry(new);
            new
        } else {
            old
        };

        if mark_dirty {
            let marked = pages.pages().set_mark(slot_index, DaxMark::Dirty);
            debug_assert!(marked.is_ok());
        }
        result
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::test_util::{TestEnv, TestEnvOptions};

    #[test]
    fn grab_creates_locked_empty_entry() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        let locked = mapping.grab_entry(3, EntrySize::Pte).unwrap();
        assert_eq!(locked.entry(), DaxEntry::empty(EntrySize::Pte));
        assert!(mapping.is_entry_locked(3));
        assert_eq!(mapping.nr_entries(), 1);

        drop(locked);
        assert!(!mapping.is_entry_locked(3));
        assert_eq!(mapping.load_entry(3), Some(DaxEntry::empty(EntrySize::Pte)));
    }

    #[test]
    fn pmd_grab_aligns_and_covers_range() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        drop(mapping.grab_entry(1024, EntrySize::Pmd).unwrap());
        assert_eq!(mapping.load_entry(1024 + 77), Some(DaxEntry::empty(EntrySize::Pmd)));
        assert_eq!(mapping.load_entry(1023), None);
        assert_eq!(mapping.load_entry(1536), None);
    }

    #[test]
    fn pmd_over_pte_conflicts() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        drop(mapping.grab_entry(0, EntrySize::Pte).unwrap());
        let err = mapping.grab_entry(0, EntrySize::Pmd).unwrap_err();
        assert_eq!(err.errno(), Conflict);

        drop(mapping.grab_entry(512 + 9, EntrySize::Pte).unwrap());
        let err = mapping.grab_entry(512, EntrySize::Pmd).unwrap_err();
        assert_eq!(err.errno(), Conflict);
        assert_eq!(mapping.nr_entries(), 2);
    }

    #[test]
    fn pte_grab_downgrades_zero_pmd() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        let mut locked = mapping.grab_entry(0, EntrySize::Pmd).unwrap();
        mapping.insert_mapping(&mut locked, 0x77, EntryFlags::PMD | EntryFlags::ZERO_PAGE, false);
        drop(locked);
        env.rmap.clear_log();

        let locked = mapping.grab_entry(1, EntrySize::Pte).unwrap();
        assert_eq!(locked.entry(), DaxEntry::empty(EntrySize::Pte));
        assert_eq!(locked.slot_index(), 1);
        drop(locked);

        assert_eq!(env.rmap.unmapped(), [(0, PG_PMD_NR)]);
        assert_eq!(mapping.load_entry(0), None);
        assert_eq!(mapping.load_entry(1), Some(DaxEntry::empty(EntrySize::Pte)));
        assert_eq!(mapping.nr_entries(), 1);
    }

    #[test]
    fn pte_grab_keeps_mapped_pmd() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        let mut locked = mapping.grab_entry(0, EntrySize::Pmd).unwrap();
        let pfn = env.base_pfn();
        mapping.insert_mapping(&mut locked, pfn, EntryFlags::PMD, false);
        drop(locked);

        let locked = mapping.grab_entry(5, EntrySize::Pte).unwrap();
        assert_eq!(locked.entry(), DaxEntry::Normal { pfn, size: EntrySize::Pmd });
        assert_eq!(locked.slot_index(), 0);
    }

    #[test]
    fn grab_fails_without_room() {
        let env = TestEnv::with_options(TestEnvOptions {
            index_capacity: Some(1),
            ..Default::default()
        });
        let mapping = &env.mapping;

        drop(mapping.grab_entry(0, EntrySize::Pte).unwrap());
        let err = mapping.grab_entry(1, EntrySize::Pte).unwrap_err();
        assert_eq!(err.errno(), OutOfMemory);
        // Existing entries are still reachable.
        drop(mapping.grab_entry(0, EntrySize::Pte).unwrap());
    }

    #[test]
    fn failed_downgrade_keeps_the_pmd() {
        let env = TestEnv::with_options(TestEnvOptions {
            index_capacity: Some(1),
            ..Default::default()
        });
        let mapping = &env.mapping;

        drop(mapping.grab_entry(0, EntrySize::Pmd).unwrap());
        let err = mapping.grab_entry(8, EntrySize::Pte).unwrap_err();
        assert_eq!(err.errno(), OutOfMemory);
        assert_eq!(mapping.load_entry(8), Some(DaxEntry::empty(EntrySize::Pmd)));
        assert!(!mapping.is_entry_locked(0));
    }

    #[test]
    fn insert_associates_frames() {
        let env = TestEnv::new();
        let mapping = &env.mapping;
        let pfn = env.base_pfn() + 512;

        let mut locked = mapping.grab_entry(512, EntrySize::Pmd).unwrap();
        let entry = mapping.insert_mapping(&mut locked, pfn, EntryFlags::PMD, true);
        drop(locked);

        assert_eq!(entry, DaxEntry::Normal { pfn, size: EntrySize::Pmd });
        assert!(mapping.is_entry_marked(600, DaxMark::Dirty));
        assert!(mapping.is_inode_dirty());

        let pagemap = env.device.pagemap();
        assert_eq!(pagemap.frame(pfn).unwrap().owner_info(), Some((mapping.id(), 512)));
        assert_eq!(pagemap.frame(pfn + 511).unwrap().owner_info(), Some((mapping.id(), 1023)));

        assert!(mapping.delete_entry(700));
        assert_eq!(pagemap.frame(pfn + 3).unwrap().owner_info(), None);
    }

    #[test]
    fn insert_leaves_real_mappings_alone() {
        let env = TestEnv::new();
        let mapping = &env.mapping;
        let pfn = env.base_pfn();

        let mut locked = mapping.grab_entry(0, EntrySize::Pmd).unwrap();
        mapping.insert_mapping(&mut locked, pfn, EntryFlags::PMD, false);
        drop(locked);

        let mut locked = mapping.grab_entry(3, EntrySize::Pte).unwrap();
        let entry = mapping.insert_mapping(&mut locked, pfn + 3, EntryFlags::empty(), true);
        drop(locked);

        assert_eq!(entry, DaxEntry::Normal { pfn, size: EntrySize::Pmd });
        assert!(mapping.is_entry_marked(0, DaxMark::Dirty));
        assert_eq!(
            env.device.pagemap().frame(pfn + 3).unwrap().owner_info(),
            Some((mapping.id(), 3))
        );
    }

    #[test]
    fn zero_page_replaced_by_data_is_unmapped() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        let mut locked = mapping.grab_entry(9, EntrySize::Pte).unwrap();
        mapping.insert_mapping(&mut locked, 0x1, EntryFlags::ZERO_PAGE, false);
        assert!(env.rmap.unmapped().is_empty());
        mapping.insert_mapping(&mut locked, env.base_pfn() + 9, EntryFlags::empty(), false);
        drop(locked);

        assert_eq!(env.rmap.unmapped(), [(9, 1)]);
        assert!(mapping.load_entry(9).unwrap().is_normal());
    }

    #[test]
    fn invalidate_is_idempotent() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        drop(mapping.grab_entry(4, EntrySize::Pte).unwrap());
        assert!(mapping.invalidate_entry_if_clean(4));
        assert!(!mapping.invalidate_entry_if_clean(4));
        assert!(!mapping.invalidate_entry_if_clean(4));
        assert_eq!(mapping.nr_entries(), 0);
    }

    #[test]
    fn clean_invalidation_spares_dirty_entries() {
        let env = TestEnv::new();
        let mapping = &env.mapping;

        let mut locked = mapping.grab_entry(4, EntrySize::Pte).unwrap();
        mapping.insert_mapping(&mut locked, env.base_pfn() + 4, EntryFlags::empty(), true);
        drop(locked);

        assert!(!mapping.invalidate_entry_if_clean(4));
        assert!(mapping.load_entry(4).is_some());
        assert!(mapping.delete_entry(4));
        assert!(mapping.load_entry(4).is_none());
    }

    #[test]
    fn invalidate_waits_for_the_holder() {
        let env = TestEnv::new();
        let mapping = env.mapping.clone();

        let locked = mapping.grab_entry(6, EntrySize::Pte).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let mapping = mapping.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                mapping.delete_entry(6)
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert!(mapping.load_entry(6).is_some());
        drop(locked);

        assert!(handle.join().unwrap());
        assert!(mapping.load_entry(6).is_none());
    }

    #[test]
    fn racing_grabs_serialize() {
        let env = TestEnv::new();
        let mapping = env.mapping.clone();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mapping = mapping.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let locked = mapping.grab_entry(42, EntrySize::Pte).unwrap();
                        assert!(mapping.is_entry_locked(42));
                        drop(locked);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mapping.nr_entries(), 1);
        assert!(!mapping.is_entry_locked(42));
    }
}
