// SPDX-License-Identifier: MPL-2.0

//! Options for creating DAX mappings.

use bitflags::bitflags;

use super::{DaxMapping, ReverseMap};
use crate::{device::DaxDevice, prelude::*, wait_table::WaitTable};

bitflags! {
    /// DAX mapping flags.
    pub struct DaxMappingFlags: u32 {
        /// Serve PMD-sized faults with huge mappings.
        const HUGE_FAULTS = 1 << 0;
        /// Frames are not associated with their entries, which disables
        /// locking by frame and busy-frame scans.
        const LIMITED     = 1 << 1;
    }
}

/// Options for creating a [`DaxMapping`].
///
/// # Examples
///
/// ```ignore
/// let mapping = DaxMappingOptions::new(device, rmap)
///     .size(16 * PAGE_SIZE as u64)
///     .flags(DaxMappingFlags::HUGE_FAULTS)
///     .build();
/// ```
pub struct DaxMappingOptions {
    device: Arc<DaxDevice>,
    rmap: Arc<dyn ReverseMap>,
    size: u64,
    flags: DaxMappingFlags,
    wait_table: Option<Arc<WaitTable>>,
    index_capacity: Option<usize>,
}

impl DaxMappingOptions {
    /// Creates a default set of options for a mapping of `device` whose
    /// page-table users are reached through `rmap`.
    pub fn new(device: Arc<DaxDevice>, rmap: Arc<dyn ReverseMap>) -> Self {
        Self {
            device,
            rmap,
            size: 0,
            flags: DaxMappingFlags::empty(),
            wait_table: None,
            index_capacity: None,
        }
    }

    /// Sets the file size in bytes.
    ///
    /// The default value is 0.
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the mapping flags.
    ///
    /// The default value is `DaxMappingFlags::empty()`.
    pub fn flags(mut self, flags: DaxMappingFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the wait table.
    ///
    /// The default is [`WaitTable::global`].
    pub fn wait_table(mut self, wait_table: Arc<WaitTable>) -> Self {
        self.wait_table = Some(wait_table);
        self
    }

    /// Limits the number of entries the mapping can hold.
    pub fn index_capacity(mut self, capacity: usize) -> Self {
        self.index_capacity = Some(capacity);
        self
    }
}

impl DaxMappingOptions {
    /// Creates the mapping according to the specified options.
    pub fn build(self) -> Arc<DaxMapping> {
        let DaxMappingOptions {
            device,
            rmap,
            size,
            flags,
            wait_table,
            index_capacity,
        } = self;
        let wait_table = wait_table.unwrap_or_else(WaitTable::global);
        Arc::new_cyclic(|this| {
            DaxMapping::new(
                this.clone(),
                device,
                rmap,
                size,
                flags,
                wait_table,
                index_capacity,
            )
        })
    }
}
