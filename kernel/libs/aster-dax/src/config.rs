// SPDX-License-Identifier: MPL-2.0

//! Geometry and tuning constants.

/// The shift of a base page.
pub const PAGE_SHIFT: u32 = 12;
/// The size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The shift of a PMD-sized huge page.
pub const PMD_SHIFT: u32 = 21;
/// The size of a PMD-sized huge page in bytes.
pub const PMD_SIZE: usize = 1 << PMD_SHIFT;
/// The page order of a PMD-sized huge page.
pub const PMD_ORDER: u32 = PMD_SHIFT - PAGE_SHIFT;

/// The number of base pages in a PMD.
pub const PG_PMD_NR: u64 = 1 << PMD_ORDER;
/// The mask of a page index within its PMD.
pub const PG_PMD_COLOUR: u64 = PG_PMD_NR - 1;

/// The number of hash bits of the default wait table (4096 buckets).
pub const DEFAULT_WAIT_TABLE_BITS: u32 = 12;

/// The number of entries handled per batch by range sweeps.
pub const PAGEVEC_SIZE: usize = 15;

/// The number of entries re-tagged per structural-lock hold when a writeback
/// range is prepared.
pub(crate) const WRITEBACK_TAG_BATCH: usize = 4096;
