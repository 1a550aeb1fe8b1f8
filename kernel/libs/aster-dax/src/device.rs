// SPDX-License-Identifier: MPL-2.0

//! The persistent-memory device beneath DAX mappings.

use spin::{RwLock, RwLockReadGuard};

use crate::{frame::DevPagemap, prelude::*};

/// The result of translating a device page offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectAccess {
    /// The linear device address of the first byte.
    pub kaddr: usize,
    /// The frame number of the first page.
    pub pfn: Pfn,
    /// The number of contiguous pages available from `pfn` on.
    pub nr_pages: u64,
    /// Whether the frames have device page metadata and can be mapped huge.
    pub devmap: bool,
}

/// The driver of a persistent-memory device.
pub trait DaxOperations: Send + Sync {
    /// Translates `nr_pages` pages starting at page offset `pgoff`.
    fn direct_access(&self, pgoff: u64, nr_pages: u64) -> Result<DirectAccess>;

    /// Copies `buf` to the device at `kaddr`, returning the bytes copied.
    fn copy_from_buf(&self, kaddr: usize, buf: &[u8]) -> usize;

    /// Copies device memory at `kaddr` into `buf`, returning the bytes copied.
    fn copy_to_buf(&self, kaddr: usize, buf: &mut [u8]) -> usize;

    /// Makes the CPU cache lines covering the range durable.
    fn flush(&self, kaddr: usize, len: usize);
}

/// A persistent-memory device.
///
/// Users of the device hold a [`DaxReadGuard`] while they access it;
/// [`DaxDevice::kill`] waits for all of them to finish and makes later
/// translations fail.
pub struct DaxDevice {
    ops: Box<dyn DaxOperations>,
    pagemap: DevPagemap,
    alive: RwLock<bool>,
}

impl DaxDevice {
    pub fn new(ops: Box<dyn DaxOperations>, pagemap: DevPagemap) -> Arc<Self> {
        Arc::new(Self {
            ops,
            pagemap,
            alive: RwLock::new(true),
        })
    }

    pub fn pagemap(&self) -> &DevPagemap {
        &self.pagemap
    }

    /// Enters a read-side critical section of the device.
    pub fn read_lock(&self) -> DaxReadGuard<'_> {
        DaxReadGuard {
            device: self,
            alive: self.alive.read(),
        }
    }

    /// Shuts the device down.
    pub fn kill(&self) {
        *self.alive.write() = false;
        debug!("dax: device killed");
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.read()
    }

    fn pfn_to_kaddr(&self, pfn: Pfn) -> usize {
        ((pfn - self.pagemap.base_pfn()) as usize) << PAGE_SHIFT
    }
}

impl Debug for DaxDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaxDevice")
            .field("pagemap", &self.pagemap)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A read-side critical section of a [`DaxDevice`].
pub struct DaxReadGuard<'a> {
    device: &'a DaxDevice,
    alive: RwLockReadGuard<'a, bool>,
}

impl DaxReadGuard<'_> {
    /// Translates `nr_pages` pages starting at page offset `pgoff`.
    pub fn direct_access(&self, pgoff: u64, nr_pages: u64) -> Result<DirectAccess> {
        if !*self.alive {
            return_errno_with_msg!(NoDevice, "the dax device is dead");
        }
        self.device.ops.direct_access(pgoff, nr_pages)
    }

    pub fn copy_from_buf(&self, kaddr: usize, buf: &[u8]) -> usize {
        self.device.ops.copy_from_buf(kaddr, buf)
    }

    pub fn copy_to_buf(&self, kaddr: usize, buf: &mut [u8]) -> usize {
        self.device.ops.copy_to_buf(kaddr, buf)
    }

    /// Flushes `len` bytes starting at the frame `pfn`.
    pub fn flush_frames(&self, pfn: Pfn, len: usize) {
        self.device.ops.flush(self.device.pfn_to_kaddr(pfn), len);
    }

    pub fn flush(&self, kaddr: usize, len: usize) {
        self.device.ops.flush(kaddr, len);
    }
}

/// Converts a byte address on the device into a page offset.
pub fn dax_pgoff(addr: u64) -> Result<u64> {
    if addr % PAGE_SIZE as u64 != 0 {
        return_errno_with_msg!(InvalidArgs, "device address is not page aligned");
    }
    Ok(addr >> PAGE_SHIFT)
}
