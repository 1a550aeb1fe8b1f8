// SPDX-License-Identifier: MPL-2.0

use crate::mark::Mark;

/// A slot of the [`XArray`]: the stored item together with its marks.
///
/// [`XArray`]: crate::XArray
#[derive(Debug)]
pub(super) struct XSlot<I> {
    pub(super) item: I,
    pub(super) marks: Mark,
}

impl<I> XSlot<I> {
    pub(super) const fn new(item: I) -> Self {
        Self {
            item,
            marks: Mark::new_empty(),
        }
    }
}
