// SPDX-License-Identifier: MPL-2.0

/// The marks carried by one slot of an [`XArray`].
///
/// It internally stores a `u8` functioning as a bitmap, where each set bit
/// means that the mark of the corresponding [`XMark::index`] is present.
///
/// [`XArray`]: crate::XArray
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct Mark {
    inner: u8,
}

impl Mark {
    pub(super) const fn new_empty() -> Self {
        Self { inner: 0 }
    }

    /// Sets or clears the mark at `offset`, returning whether anything changed.
    pub(super) fn update(&mut self, offset: usize, set: bool) -> bool {
        let old_val = self.inner;
        if set {
            self.inner |= 1 << offset;
        } else {
            self.inner &= !(1 << offset);
        }
        old_val != self.inner
    }

    pub(super) fn is_marked(&self, offset: usize) -> bool {
        self.inner & (1 << offset) != 0
    }

    pub(super) fn is_clear(&self) -> bool {
        self.inner == 0
    }
}

/// The mark type used in the [`XArray`].
///
/// An item in the `XArray` can have up to three different marks.
///
/// Users can use a self-defined type to distinguish which kind of mark they want to set. Such a
/// type must implement the `Into<XMark>` trait.
///
/// [`XArray`]: crate::XArray
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XMark {
    /// The mark kind 0.
    Mark0,
    /// The mark kind 1.
    Mark1,
    /// The mark kind 2.
    Mark2,
}

impl XMark {
    /// Maps the `XMark` to an index in the range 0 to 2.
    pub(super) fn index(&self) -> usize {
        match self {
            XMark::Mark0 => 0,
            XMark::Mark1 => 1,
            XMark::Mark2 => 2,
        }
    }
}

/// A mark type that disables the mark functionality in the [`XArray`].
///
/// This indicates that the mark functionality is not needed and is the default generic parameter
/// for an `XArray`.
///
/// [`XArray`]: crate::XArray
#[derive(Clone, Copy)]
pub enum NoneMark {}
