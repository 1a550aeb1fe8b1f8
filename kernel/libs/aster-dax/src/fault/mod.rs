// SPDX-License-Identifier: MPL-2.0

//! Page-fault handling for DAX mappings.
//!
//! A fault locks the entry of the faulting range, asks the filesystem which
//! device blocks back it, records the answer in the entry and installs the
//! page-table entry through the [`VmArea`]. PTE faults are handled in
//! [`pte`]; PMD faults, which may fall back to PTE faults, in [`pmd`].

use core::ops::Range;

use bitflags::bitflags;

use crate::{
    device::dax_pgoff,
    entry::{DaxMark, EntrySize},
    iomap::{Iomap, IomapExtentFlags, IomapFlags, IomapOps},
    mapping::{DaxMapping, DaxMappingFlags},
    prelude::*,
};

mod pmd;
mod pte;

bitflags! {
    /// The flags of a page fault.
    pub struct FaultFlags: u32 {
        /// The faulting access is a write.
        const WRITE = 1 << 0;
    }
}

bitflags! {
    /// The flags of a virtual memory area.
    pub struct VmFlags: u32 {
        /// Writes are shared with the file.
        const SHARED = 1 << 0;
        /// Metadata must be durable before a writable mapping is installed.
        const SYNC   = 1 << 1;
    }
}

/// The state of the PMD covering an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmdState {
    None,
    /// The PMD points to a page table of PTEs.
    Table,
    /// The PMD maps a huge page.
    Huge,
}

/// A virtual memory area that maps a DAX file, with its page-table
/// primitives.
pub trait VmArea: Send + Sync {
    /// Returns the virtual address range.
    fn range(&self) -> Range<usize>;

    /// Returns the file page index mapped at the start of the area.
    fn pgoff(&self) -> u64;

    fn flags(&self) -> VmFlags;

    fn pmd_state(&self, address: usize) -> PmdState;

    /// Maps the page at `address` to `pfn`.
    fn insert_pte(&self, address: usize, pfn: Pfn, write: bool) -> Result<()>;

    /// Maps the huge page at `address` to `pfn`.
    fn insert_pmd(&self, address: usize, pfn: Pfn, write: bool) -> Result<()>;

    /// Maps the huge zero page at `address` unless the PMD is populated.
    ///
    /// Returns whether the mapping was installed.
    fn insert_huge_zero_pmd(&self, address: usize, pfn: Pfn) -> bool;

    /// Splits the huge mapping covering `address`, if any.
    fn split_huge_pmd(&self, address: usize);

    /// Returns the zero page for `address`.
    fn zero_pfn(&self, address: usize) -> Pfn;

    /// Returns the huge zero page, if one can be had.
    fn huge_zero_pfn(&self) -> Option<Pfn>;

    /// Maps the private copy `page` at `address`.
    fn finish_cow_fault(&self, address: usize, page: &[u8]) -> Result<()>;
}

/// Returns the file page index mapped at `address`.
pub fn linear_page_index(vma: &dyn VmArea, address: usize) -> u64 {
    ((address - vma.range().start) >> PAGE_SHIFT) as u64 + vma.pgoff()
}

/// A page fault on a DAX mapping.
pub struct VmFault<'a> {
    vma: &'a dyn VmArea,
    address: usize,
    pgoff: u64,
    flags: FaultFlags,
    cow_page: Option<&'a mut [u8]>,
}

impl<'a> VmFault<'a> {
    pub fn new(vma: &'a dyn VmArea, address: usize, flags: FaultFlags) -> Self {
        Self {
            vma,
            address,
            pgoff: linear_page_index(vma, address),
            flags,
            cow_page: None,
        }
    }

    /// Asks for a private copy of the page in `page` instead of a mapping
    /// of the file.
    pub fn with_cow_page(mut self, page: &'a mut [u8]) -> Self {
        self.cow_page = Some(page);
        self
    }

    pub fn vma(&self) -> &'a dyn VmArea {
        self.vma
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(FaultFlags::WRITE)
    }
}

/// The outcome of a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The page-table entry is in place.
    NoPage { major: bool },
    Oom,
    Sigbus,
    /// Retry the fault at PTE granularity.
    Fallback,
    /// Make the file metadata durable, then call
    /// [`DaxMapping::finish_sync_fault`] with `pfn`.
    NeedDsync { pfn: Pfn, major: bool },
    /// The private copy has been mapped.
    DoneCow,
    /// Nothing was done; retry the access.
    Retry,
}

impl FaultDisposition {
    pub const NOPAGE: Self = FaultDisposition::NoPage { major: false };

    pub(crate) fn from_error(error: &Error) -> Self {
        match error.errno() {
            OutOfMemory => FaultDisposition::Oom,
            Interrupted => FaultDisposition::Retry,
            _ => FaultDisposition::Sigbus,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FaultDisposition::Oom | FaultDisposition::Sigbus)
    }
}

fn is_synchronous(flags: IomapFlags, vma: &dyn VmArea, iomap: &Iomap) -> bool {
    flags.contains(IomapFlags::WRITE)
        && vma.flags().contains(VmFlags::SYNC)
        && iomap.flags.contains(IomapExtentFlags::DIRTY)
}

impl DaxMapping {
    /// Handles a fault of `size` granularity.
    pub fn fault(&self, vmf: &mut VmFault<'_>, size: EntrySize, ops: &dyn IomapOps) -> FaultDisposition {
        match size {
            EntrySize::Pte => self.pte_fault(vmf, ops),
            EntrySize::Pmd if self.flags().contains(DaxMappingFlags::HUGE_FAULTS) => {
                self.pmd_fault(vmf, ops)
            }
            EntrySize::Pmd => FaultDisposition::Fallback,
        }
    }

    /// Finishes a fault that returned [`FaultDisposition::NeedDsync`] once
    /// the metadata is durable, by installing a writable mapping of `pfn`.
    ///
    /// Returns [`FaultDisposition::NOPAGE`] without mapping anything if the
    /// entry went away or changed granularity meanwhile; the access will
    /// fault again.
    pub fn finish_sync_fault(&self, vmf: &VmFault<'_>, size: EntrySize, pfn: Pfn) -> FaultDisposition {
        if size == EntrySize::Pmd && !self.flags().contains(DaxMappingFlags::HUGE_FAULTS) {
            return FaultDisposition::Fallback;
        }

        let index = vmf.pgoff;
        let mut pages = self.lock_pages();
        let Some(found) = pages.get_unlocked(index) else {
            trace!("dax: entry {:#x} vanished before the sync fault finished", index);
            return FaultDisposition::NOPAGE;
        };
        if found.entry().size() != size {
            found.put();
            trace!("dax: entry {:#x} changed size before the sync fault finished", index);
            return FaultDisposition::NOPAGE;
        }
        let marked = pages.pages().set_mark(found.slot_index(), DaxMark::Dirty);
        debug_assert!(marked.is_ok());
        let locked = found.lock(&mut pages);
        drop(pages);

        let result = match size {
            EntrySize::Pte => vmf.vma.insert_pte(vmf.address, pfn, true),
            EntrySize::Pmd => vmf
                .vma
                .insert_pmd(vmf.address & !(PMD_SIZE - 1), pfn, true),
        };
        drop(locked);

        match result {
            Ok(()) => FaultDisposition::NOPAGE,
            Err(err) => FaultDisposition::from_error(&err),
        }
    }

    /// Returns the frame backing `size` bytes of `iomap` from `pos` on.
    fn iomap_pfn(&self, iomap: &Iomap, pos: u64, size: usize) -> Result<Pfn> {
        let pgoff = dax_pgoff(iomap.device_addr(pos))?;
        let nr_pages = (size >> PAGE_SHIFT) as u64;

        let guard = self.device().read_lock();
        let access = guard.direct_access(pgoff, nr_pages)?;
        if access.nr_pages < nr_pages {
            return_errno_with_msg!(InvalidArgs, "the device range is too short");
        }
        if access.pfn & (nr_pages - 1) != 0 {
            return_errno_with_msg!(InvalidArgs, "the device range is misaligned");
        }
        if nr_pages > 1 && !access.devmap {
            return_errno_with_msg!(InvalidArgs, "the device range has no page metadata");
        }
        Ok(access.pfn)
    }

    /// Copies the page of `iomap` at `pos` into `page`.
    fn copy_user_dax(&self, iomap: &Iomap, pos: u64, page: &mut [u8]) -> Result<()> {
        let pgoff = dax_pgoff(iomap.device_addr(pos))?;
        let guard = self.device().read_lock();
        let access = guard.direct_access(pgoff, 1)?;
        let len = page.len().min(PAGE_SIZE);
        if guard.copy_to_buf(access.kaddr, &mut page[..len]) != len {
            return_errno_with_msg!(IoFailed, "short copy from the device");
        }
        Ok(())
    }
}
