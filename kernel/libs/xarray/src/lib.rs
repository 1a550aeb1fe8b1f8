// SPDX-License-Identifier: MPL-2.0

//! This crate introduces an ordered index, the `XArray`, that maps `u64`
//! indices to items.
//!
//! An `XArray` is protected by a reader-writer lock. Readers obtain a
//! [`ReadXArray`] through [`XArray::read`] and may run concurrently; writers
//! obtain a [`LockedXArray`] through [`XArray::lock`], which is the only way to
//! modify the stored items or their marks.
//!
//! Each item can carry up to three marks (see [`XMark`]). Marks survive
//! in-place replacement of the item and are dropped together with it.
//!
//! An `XArray` can optionally be created with a capacity limit. Inserting new
//! items under a limit is expected to be preceded by [`XArray::preload`],
//! which reserves room for one item and fails when the limit is reached.
//!
//! # Example
//!
//! ```
//! use xarray::{XArray, XMark};
//!
//! #[derive(Clone, Copy)]
//! enum Tag {
//!     Dirty,
//! }
//!
//! impl From<Tag> for XMark {
//!     fn from(_tag: Tag) -> Self {
//!         XMark::Mark0
//!     }
//! }
//!
//! let xarray: XArray<u32, Tag> = XArray::new();
//!
//! let mut locked = xarray.lock();
//! locked.store(10, 1);
//! locked.set_mark(10, Tag::Dirty).unwrap();
//! drop(locked);
//!
//! let read = xarray.read();
//! assert_eq!(read.load(10), Some(&1));
//! assert!(read.is_marked(10, Tag::Dirty));
//! ```

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::collections::BTreeMap;
use core::{
    marker::PhantomData,
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use cursor::{Cursor, CursorMut, SetMarkError};
use entry::XSlot;
pub use mark::{NoneMark, XMark};
pub use range::{MarkedRange, Range};

mod cursor;
mod entry;
mod mark;
mod range;

/// An ordered index from `u64` to items of type `I`, with marks of type `M`.
pub struct XArray<I, M = NoneMark> {
    slots: RwLock<BTreeMap<u64, XSlot<I>>>,
    capacity: Option<usize>,
    reserved: AtomicUsize,
    _marker: PhantomData<M>,
}

impl<I, M> Default for XArray<I, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, M> XArray<I, M> {
    /// Makes a new, empty `XArray` without a capacity limit.
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            capacity: None,
            reserved: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Makes a new, empty `XArray` that holds at most `limit` items that were
    /// inserted through [`XArray::preload`].
    pub const fn with_capacity_limit(limit: usize) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            capacity: Some(limit),
            reserved: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Acquires the lock of the `XArray` for reading.
    pub fn read(&self) -> ReadXArray<'_, I, M> {
        ReadXArray {
            guard: self.slots.read(),
            _marker: PhantomData,
        }
    }

    /// Acquires the lock of the `XArray` for writing.
    pub fn lock(&self) -> LockedXArray<'_, I, M> {
        LockedXArray {
            guard: self.slots.write(),
            _marker: PhantomData,
        }
    }

    /// Reserves room for inserting one new item.
    ///
    /// The reservation is given back when the returned [`XPreload`] is dropped
    /// or consumed by [`LockedXArray::store_preloaded`].
    ///
    /// This method must not be called while the caller holds the lock of the
    /// same `XArray`.
    ///
    /// # Errors
    ///
    /// Fails with [`PreloadError`] if the capacity limit would be exceeded.
    pub fn preload(&self) -> Result<XPreload<'_, I, M>, PreloadError> {
        let Some(capacity) = self.capacity else {
            return Ok(XPreload { xarray: self });
        };

        let len = self.slots.read().len();
        let reserved = self.reserved.fetch_add(1, Ordering::AcqRel);
        if len + reserved >= capacity {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return Err(PreloadError);
        }
        Ok(XPreload { xarray: self })
    }
}

/// A reservation of room for one item in an [`XArray`].
#[must_use]
pub struct XPreload<'a, I, M> {
    xarray: &'a XArray<I, M>,
}

impl<I, M> Drop for XPreload<'_, I, M> {
    fn drop(&mut self) {
        if self.xarray.capacity.is_some() {
            self.xarray.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// An error indicating that the capacity limit of an [`XArray`] is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadError;

/// A read view of an [`XArray`].
///
/// Any number of `ReadXArray`s may exist at the same time, but none of them
/// coexists with a [`LockedXArray`].
pub struct ReadXArray<'a, I, M = NoneMark> {
    guard: RwLockReadGuard<'a, BTreeMap<u64, XSlot<I>>>,
    _marker: PhantomData<M>,
}

impl<I, M> ReadXArray<'_, I, M> {
    /// Loads the item at `index`.
    pub fn load(&self, index: u64) -> Option<&I> {
        self.guard.get(&index).map(|slot| &slot.item)
    }

    /// Creates a [`Cursor`] positioned at `index`.
    pub fn cursor(&self, index: u64) -> Cursor<'_, I, M> {
        Cursor::new(&self.guard, index)
    }

    /// Returns an iterator over the items in `range`.
    pub fn range(&self, range: core::ops::Range<u64>) -> Range<'_, I> {
        Range::new(self.guard.range(range))
    }

    /// Returns the number of stored items.
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    /// Returns whether no item is stored.
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

impl<I, M: Into<XMark>> ReadXArray<'_, I, M> {
    /// Checks whether the item at `index` is marked with `mark`.
    pub fn is_marked(&self, index: u64, mark: M) -> bool {
        self.cursor(index).is_marked(mark)
    }

    /// Returns an iterator over the items in `range` that are marked with `mark`.
    pub fn marked(&self, range: core::ops::Range<u64>, mark: M) -> MarkedRange<'_, I> {
        MarkedRange::new(self.guard.range(range), mark.into())
    }
}

/// A locked [`XArray`], through which the items and their marks are modified.
pub struct LockedXArray<'a, I, M = NoneMark> {
    guard: RwLockWriteGuard<'a, BTreeMap<u64, XSlot<I>>>,
    _marker: PhantomData<M>,
}

impl<I, M> LockedXArray<'_, I, M> {
    /// Loads the item at `index`.
    pub fn load(&self, index: u64) -> Option<&I> {
        self.guard.get(&index).map(|slot| &slot.item)
    }

    /// Loads the item at `index` for in-place modification.
    ///
    /// The marks of the item are left unchanged.
    pub fn load_mut(&mut self, index: u64) -> Option<&mut I> {
        self.guard.get_mut(&index).map(|slot| &mut slot.item)
    }

    /// Stores `item` at `index`, returning the replaced item if any.
    pub fn store(&mut self, index: u64, item: I) -> Option<I> {
        self.cursor_mut(index).store(item)
    }

    /// Stores `item` at `index` using a reservation made by [`XArray::preload`].
    pub fn store_preloaded(&mut self, index: u64, item: I, preload: XPreload<'_, I, M>) -> Option<I> {
        let old = self.store(index, item);
        drop(preload);
        old
    }

    /// Removes the item at `index`.
    pub fn remove(&mut self, index: u64) -> Option<I> {
        self.cursor_mut(index).remove()
    }

    /// Creates a [`Cursor`] positioned at `index`.
    pub fn cursor(&self, index: u64) -> Cursor<'_, I, M> {
        Cursor::new(&self.guard, index)
    }

    /// Creates a [`CursorMut`] positioned at `index`.
    pub fn cursor_mut(&mut self, index: u64) -> CursorMut<'_, I, M> {
        CursorMut::new(&mut self.guard, index)
    }

    /// Returns an iterator over the items in `range`.
    pub fn range(&self, range: core::ops::Range<u64>) -> Range<'_, I> {
        Range::new(self.guard.range(range))
    }

    /// Returns whether any item is stored in `range`.
    pub fn is_occupied(&self, range: core::ops::Range<u64>) -> bool {
        self.guard
            .range((Bound::Included(range.start), Bound::Excluded(range.end)))
            .next()
            .is_some()
    }

    /// Returns the number of stored items.
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    /// Returns whether no item is stored.
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

impl<I, M: Into<XMark>> LockedXArray<'_, I, M> {
    /// Sets `mark` on the item at `index`.
    pub fn set_mark(&mut self, index: u64, mark: M) -> Result<(), SetMarkError> {
        self.cursor_mut(index).set_mark(mark)
    }

    /// Unsets `mark` on the item at `index`.
    pub fn unset_mark(&mut self, index: u64, mark: M) -> Result<(), SetMarkError> {
        self.cursor_mut(index).unset_mark(mark)
    }

    /// Checks whether the item at `index` is marked with `mark`.
    pub fn is_marked(&self, index: u64, mark: M) -> bool {
        self.cursor(index).is_marked(mark)
    }

    /// Returns an iterator over the items in `range` that are marked with `mark`.
    pub fn marked(&self, range: core::ops::Range<u64>, mark: M) -> MarkedRange<'_, I> {
        MarkedRange::new(self.guard.range(range), mark.into())
    }
}
