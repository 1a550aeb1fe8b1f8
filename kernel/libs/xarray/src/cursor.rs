// SPDX-License-Identifier: MPL-2.0

use alloc::collections::BTreeMap;
use core::marker::PhantomData;

use crate::{
    entry::XSlot,
    mark::{NoneMark, XMark},
};

/// A `Cursor` can traverse in the [`XArray`] by setting or increasing the
/// target index and can perform read-only operations to the target item.
///
/// A `Cursor` borrows a read view of the `XArray` ([`ReadXArray`]) or a locked
/// one ([`LockedXArray`]), so it always observes a consistent snapshot.
///
/// [`XArray`]: super::XArray
/// [`ReadXArray`]: super::ReadXArray
/// [`LockedXArray`]: super::LockedXArray
pub struct Cursor<'a, I, M = NoneMark> {
    /// The slots of the `XArray` where the cursor locates.
    slots: &'a BTreeMap<u64, XSlot<I>>,
    /// The target index of the cursor.
    index: u64,
    _marker: PhantomData<M>,
}

impl<'a, I, M> Cursor<'a, I, M> {
    pub(super) fn new(slots: &'a BTreeMap<u64, XSlot<I>>, index: u64) -> Self {
        Self {
            slots,
            index,
            _marker: PhantomData,
        }
    }

    /// Loads the item at the target index.
    pub fn load(&self) -> Option<&'a I> {
        self.slots.get(&self.index).map(|slot| &slot.item)
    }

    /// Returns the target index of the cursor.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Increases the target index of the cursor by one.
    pub fn next(&mut self) {
        self.index = self.index.saturating_add(1);
    }
}

impl<I, M: Into<XMark>> Cursor<'_, I, M> {
    /// Checks whether the target item is marked with the input `mark`.
    ///
    /// If the target item does not exist, this method will also return false.
    pub fn is_marked(&self, mark: M) -> bool {
        let offset = mark.into().index();
        self.slots
            .get(&self.index)
            .is_some_and(|slot| slot.marks.is_marked(offset))
    }
}

/// A `CursorMut` can traverse in the [`XArray`] by setting or increasing the
/// target index and can perform read-write operations to the target item.
///
/// An `XArray` can only have one `CursorMut` at a time, since it can only be
/// created from the [`LockedXArray`].
///
/// The typical way to obtain a `CursorMut` instance is to call [`LockedXArray::cursor_mut`].
///
/// [`XArray`]: super::XArray
/// [`LockedXArray`]: super::LockedXArray
/// [`LockedXArray::cursor_mut`]: super::LockedXArray::cursor_mut
pub struct CursorMut<'a, I, M = NoneMark> {
    slots: &'a mut BTreeMap<u64, XSlot<I>>,
    index: u64,
    _marker: PhantomData<M>,
}

impl<'a, I, M> CursorMut<'a, I, M> {
    pub(super) fn new(slots: &'a mut BTreeMap<u64, XSlot<I>>, index: u64) -> Self {
        Self {
            slots,
            index,
            _marker: PhantomData,
        }
    }

    /// Loads the item at the target index.
    pub fn load(&self) -> Option<&I> {
        self.slots.get(&self.index).map(|slot| &slot.item)
    }

    /// Returns the target index of the cursor.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Increases the target index of the cursor by one.
    pub fn next(&mut self) {
        self.index = self.index.saturating_add(1);
    }

    /// Stores a new `item` at the target index.
    ///
    /// The marks of a replaced item are inherited by the new one. Returns the
    /// replaced item if it previously exists.
    pub fn store(&mut self, item: I) -> Option<I> {
        match self.slots.get_mut(&self.index) {
            Some(slot) => Some(core::mem::replace(&mut slot.item, item)),
            None => {
                self.slots.insert(self.index, XSlot::new(item));
                None
            }
        }
    }

    /// Removes the item at the target index.
    ///
    /// Returns the removed item if it previously exists.
    pub fn remove(&mut self) -> Option<I> {
        self.slots.remove(&self.index).map(|slot| slot.item)
    }
}

/// An error indicating that the mark cannot be set because the item does not exist.
#[derive(Debug)]
pub struct SetMarkError;

impl<I, M: Into<XMark>> CursorMut<'_, I, M> {
    /// Sets the input `mark` for the item at the target index.
    ///
    /// # Errors
    ///
    /// This method will fail with an error if the target item does not exist.
    pub fn set_mark(&mut self, mark: M) -> Result<(), SetMarkError> {
        let offset = mark.into().index();
        let slot = self.slots.get_mut(&self.index).ok_or(SetMarkError)?;
        slot.marks.update(offset, true);
        Ok(())
    }

    /// Unsets the input `mark` for the item at the target index.
    ///
    /// # Errors
    ///
    /// This method will fail with an error if the target item does not exist.
    pub fn unset_mark(&mut self, mark: M) -> Result<(), SetMarkError> {
        let offset = mark.into().index();
        let slot = self.slots.get_mut(&self.index).ok_or(SetMarkError)?;
        slot.marks.update(offset, false);
        Ok(())
    }

    /// Checks whether the target item is marked with the input `mark`.
    ///
    /// If the target item does not exist, this method will also return false.
    pub fn is_marked(&self, mark: M) -> bool {
        let offset = mark.into().index();
        self.slots
            .get(&self.index)
            .is_some_and(|slot| slot.marks.is_marked(offset))
    }

    /// Checks whether the target item carries no mark at all.
    pub fn is_unmarked(&self) -> bool {
        self.slots
            .get(&self.index)
            .is_none_or(|slot| slot.marks.is_clear())
    }
}
