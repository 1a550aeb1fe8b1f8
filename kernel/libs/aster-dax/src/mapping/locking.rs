// SPDX-License-Identifier: MPL-2.0

//! The entry lock protocol.
//!
//! The lock bit of an entry is only read and written under the structural
//! lock. A thread that finds the bit set registers itself in the wait table
//! while still holding the structural lock, then releases it and sleeps, so
//! an unlock can never slip in between the check and the sleep.

use core::mem::ManuallyDrop;

use xarray::LockedXArray;

use super::{DaxMapping, lookup_slot};
use crate::{
    entry::{DaxEntry, DaxMark, DaxSlot},
    frame::DevPagemap,
    prelude::*,
};

/// The structural lock of a mapping.
///
/// The lock can be given up while waiting for an entry and is retaken on
/// the next access.
pub(crate) struct PagesGuard<'a> {
    mapping: &'a DaxMapping,
    locked: Option<LockedXArray<'a, DaxSlot, DaxMark>>,
}

impl<'a> PagesGuard<'a> {
    pub(super) fn new(mapping: &'a DaxMapping) -> Self {
        Self {
            mapping,
            locked: Some(mapping.pages.lock()),
        }
    }

    /// Returns the locked index, retaking the lock if it was given up.
    pub(crate) fn pages(&mut self) -> &mut LockedXArray<'a, DaxSlot, DaxMark> {
        let mapping = self.mapping;
        self.locked.get_or_insert_with(|| mapping.pages.lock())
    }

    /// Gives up the structural lock.
    pub(crate) fn unlock(&mut self) {
        self.locked = None;
    }

    /// Returns the index and the content of the slot covering `index`.
    pub(crate) fn lookup(&mut self, index: u64) -> Option<(u64, DaxSlot)> {
        let pages = self.pages();
        lookup_slot(|i| pages.load(i).copied(), index)
    }

    /// Returns the entry covering `index` once it is not locked by anyone.
    ///
    /// The structural lock may be given up and retaken while waiting, so
    /// everything learned before the call must be revalidated.
    pub(crate) fn get_unlocked(&mut self, index: u64) -> Option<UnlockedEntry<'a>> {
        loop {
            let (slot_index, slot) = self.lookup(index)?;
            if !slot.locked {
                return Some(UnlockedEntry {
                    mapping: self.mapping,
                    index,
                    slot_index,
                    entry: slot.entry,
                });
            }

            let mapping = self.mapping;
            let waiter = mapping
                .wait_table
                .prepare_wait(mapping.id, index, &slot.entry, true);
            self.unlock();
            waiter.wait();
        }
    }

    /// Waits for the locked entry covering `index` to be unlocked, without
    /// retaking the structural lock or the entry afterwards.
    ///
    /// The wait is non-exclusive: the waker does not hand the entry over, so
    /// nothing has to be passed on to other waiters.
    pub(crate) fn wait_unlocked_and_forget(mut self, index: u64, entry: &DaxEntry) {
        let mapping = self.mapping;
        let waiter = mapping
            .wait_table
            .prepare_wait(mapping.id, index, entry, false);
        self.unlock();
        waiter.wait();
    }

    fn set_locked(&mut self, slot_index: u64, locked: bool) -> bool {
        match self.pages().load_mut(slot_index) {
            Some(slot) if slot.locked != locked => {
                slot.locked = locked;
                true
            }
            _ => false,
        }
    }
}

/// An entry observed unlocked under the structural lock.
///
/// The entry must be either locked with [`UnlockedEntry::lock`] or put back;
/// putting it back wakes the next waiter, in case this thread consumed the
/// wake-up meant to hand the entry over.
#[must_use]
pub(crate) struct UnlockedEntry<'a> {
    mapping: &'a DaxMapping,
    index: u64,
    slot_index: u64,
    entry: DaxEntry,
}

impl<'a> UnlockedEntry<'a> {
    pub(crate) fn entry(&self) -> DaxEntry {
        self.entry
    }

    pub(crate) fn slot_index(&self) -> u64 {
        self.slot_index
    }

    /// Locks the entry. `pages` must be the guard the entry was found with.
    pub(crate) fn lock(self, pages: &mut PagesGuard<'a>) -> LockedEntry<'a> {
        let this = ManuallyDrop::new(self);
        let newly_locked = pages.set_locked(this.slot_index, true);
        debug_assert!(newly_locked);
        LockedEntry {
            mapping: this.mapping,
            index: this.index,
            slot_index: this.slot_index,
            entry: this.entry,
        }
    }

    /// Puts the entry back without locking it.
    pub(crate) fn put(self) {
        drop(self);
    }
}

impl Drop for UnlockedEntry<'_> {
    fn drop(&mut self) {
        self.mapping.wake(self.index, &self.entry, false);
    }
}

/// An entry locked by the current thread.
///
/// Dropping it clears the lock bit and wakes one waiter. It takes the
/// structural lock to do so, so it must not be dropped while this thread
/// holds a [`PagesGuard`] of the same mapping.
#[must_use]
#[derive(Debug)]
pub(crate) struct LockedEntry<'a> {
    mapping: &'a DaxMapping,
    index: u64,
    slot_index: u64,
    entry: DaxEntry,
}

impl<'a> LockedEntry<'a> {
    pub(super) fn new(mapping: &'a DaxMapping, index: u64, slot_index: u64, entry: DaxEntry) -> Self {
        Self {
            mapping,
            index,
            slot_index,
            entry,
        }
    }

    pub(crate) fn entry(&self) -> DaxEntry {
        self.entry
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn slot_index(&self) -> u64 {
        self.slot_index
    }

    pub(super) fn set_entry(&mut self, entry: DaxEntry) {
        self.entry = entry;
    }

    /// Gives up the handle of an entry that was removed from the index.
    pub(super) fn forget_removed(self) {
        core::mem::forget(self);
    }
}

impl Drop for LockedEntry<'_> {
    fn drop(&mut self) {
        self.mapping.unlock_entry(self.index, &self.entry);
    }
}

impl DaxMapping {
    fn unlock_entry(&self, index: u64, entry: &DaxEntry) {
        let mut pages = self.lock_pages();
        let unlocked = match pages.lookup(index) {
            Some((slot_index, _)) => pages.set_locked(slot_index, false),
            None => false,
        };
        drop(pages);

        if !unlocked {
            warn!("dax: unlocking entry {:#x} that is not locked", index);
            return;
        }
        self.wake(index, entry, false);
    }
}

/// The lock of an entry taken through one of its frames.
#[must_use]
pub struct FrameEntryGuard {
    mapping: Arc<DaxMapping>,
    index: u64,
    entry: DaxEntry,
}

impl FrameEntryGuard {
    pub fn mapping(&self) -> &Arc<DaxMapping> {
        &self.mapping
    }

    /// Returns the file page index the frame backs.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn entry(&self) -> DaxEntry {
        self.entry
    }
}

impl Drop for FrameEntryGuard {
    fn drop(&mut self) {
        self.mapping.unlock_entry(self.index, &self.entry);
    }
}

/// Locks the entry that the frame `pfn` backs.
///
/// Returns `None` if the frame is not associated with any entry.
pub fn lock_frame_entry(pagemap: &DevPagemap, pfn: Pfn) -> Option<FrameEntryGuard> {
    let frame = pagemap.frame(pfn)?;
    loop {
        let owner = frame.owner()?;
        let mapping = owner.mapping.upgrade()?;
        // Most frames looked up this way have no entry any more, which
        // needs no exclusive access to find out.
        mapping.load_entry(owner.index)?;

        let locked = {
            let mut pages = mapping.lock_pages();
            match frame.owner() {
                Some(current) if current.id == owner.id && current.index == owner.index => {}
                // The frame changed hands while the structural lock was not held.
                _ => continue,
            }
            let (slot_index, slot) = pages.lookup(owner.index)?;
            if slot.locked {
                pages.wait_unlocked_and_forget(owner.index, &slot.entry);
                continue;
            }
            pages.set_locked(slot_index, true);
            slot.entry
        };

        return Some(FrameEntryGuard {
            mapping,
            index: owner.index,
            entry: locked,
        });
    }
}
