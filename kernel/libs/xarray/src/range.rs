// SPDX-License-Identifier: MPL-2.0

use alloc::collections::btree_map;

use crate::{entry::XSlot, mark::XMark};

/// An iterator over a range of entries in an [`XArray`].
///
/// The typical way to obtain a `Range` instance is to call [`LockedXArray::range`]
/// or [`ReadXArray::range`].
///
/// [`XArray`]: super::XArray
/// [`LockedXArray::range`]: super::LockedXArray::range
/// [`ReadXArray::range`]: super::ReadXArray::range
pub struct Range<'a, I> {
    inner: btree_map::Range<'a, u64, XSlot<I>>,
}

impl<'a, I> Range<'a, I> {
    pub(super) fn new(inner: btree_map::Range<'a, u64, XSlot<I>>) -> Self {
        Range { inner }
    }
}

impl<'a, I> core::iter::Iterator for Range<'a, I> {
    type Item = (u64, &'a I);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(index, slot)| (*index, &slot.item))
    }
}

/// An iterator over the entries in a range of an [`XArray`] that carry one mark.
///
/// [`XArray`]: super::XArray
pub struct MarkedRange<'a, I> {
    inner: btree_map::Range<'a, u64, XSlot<I>>,
    mark: usize,
}

impl<'a, I> MarkedRange<'a, I> {
    pub(super) fn new(inner: btree_map::Range<'a, u64, XSlot<I>>, mark: XMark) -> Self {
        MarkedRange {
            inner,
            mark: mark.index(),
        }
    }
}

impl<'a, I> core::iter::Iterator for MarkedRange<'a, I> {
    type Item = (u64, &'a I);

    fn next(&mut self) -> Option<Self::Item> {
        let mark = self.mark;
        self.inner
            .find(|(_, slot)| slot.marks.is_marked(mark))
            .map(|(index, slot)| (*index, &slot.item))
    }
}
