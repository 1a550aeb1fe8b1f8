// SPDX-License-Identifier: MPL-2.0

//! The page cache of files on byte-addressable persistent memory (DAX).
//!
//! A file on a DAX device has no page cache of its own: its pages are mapped
//! straight from the device. What a [`DaxMapping`] keeps per file is one
//! entry per mapped page (PTE entries) or per 2 MiB huge page (PMD entries),
//! which records the device frame backing that range, whether it is a hole
//! served by the zero page, and whether it was dirtied through a writable
//! mapping and so needs its CPU caches flushed on writeback.
//!
//! Entries are locked one at a time, with the waiters of each entry sleeping
//! in a hashed [`WaitTable`]. Page faults, writeback, truncation and the
//! lookups driven from device frames ([`lock_frame_entry`]) all go through
//! this lock.
//!
//! The filesystem plugs in through [`IomapOps`], the device driver through
//! [`DaxOperations`], and the virtual memory system through [`VmArea`] and
//! [`ReverseMap`].

#![deny(unsafe_code)]

pub mod config;
mod device;
mod entry;
mod error;
mod fault;
mod frame;
mod iomap;
mod mapping;
mod prelude;
mod rw;
#[cfg(test)]
mod test_util;
mod util;
mod wait;
mod wait_table;
mod writeback;

pub use self::{
    device::{DaxDevice, DaxOperations, DaxReadGuard, DirectAccess, dax_pgoff},
    entry::{DaxEntry, DaxMark, EntryFlags, EntrySize, Pfn},
    error::{Errno, Error},
    fault::{FaultDisposition, FaultFlags, PmdState, VmArea, VmFault, VmFlags, linear_page_index},
    frame::{DevPagemap, FrameMeta, PinnedFrame},
    iomap::{Iomap, IomapExtentFlags, IomapFlags, IomapOps, IomapType},
    mapping::{
        DaxMapping, DaxMappingFlags, DaxMappingOptions, FaultStats, FrameEntryGuard, MappingId,
        ReverseMap, lock_frame_entry,
    },
    rw::zero_page_range,
    wait_table::WaitTable,
    writeback::{SyncMode, WritebackControl},
};

/// The result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
