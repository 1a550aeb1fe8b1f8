// SPDX-License-Identifier: MPL-2.0

use super::{FaultDisposition, PmdState, VmFault, VmFlags, is_synchronous, linear_page_index};
use crate::{
    entry::{EntryFlags, EntrySize},
    iomap::{Iomap, IomapFlags, IomapGuard, IomapOps, IomapType},
    mapping::{DaxMapping, LockedEntry},
    prelude::*,
};

impl DaxMapping {
    pub(super) fn pmd_fault(&self, vmf: &mut VmFault<'_>, ops: &dyn IomapOps) -> FaultDisposition {
        trace!("dax: pmd fault at {:#x}, pgoff {:#x}", vmf.address, vmf.pgoff);

        let disposition = self.try_pmd_fault(vmf, ops);
        if disposition == FaultDisposition::Fallback {
            vmf.vma.split_huge_pmd(vmf.address);
            self.stats().count_pmd_fallback();
            debug!("dax: pmd fault at {:#x} falls back", vmf.address);
        }
        disposition
    }

    fn try_pmd_fault(&self, vmf: &VmFault<'_>, ops: &dyn IomapOps) -> FaultDisposition {
        let vma = vmf.vma;
        let pmd_addr = vmf.address & !(PMD_SIZE - 1);
        let write = vmf.is_write();
        let mut flags = IomapFlags::FAULT;
        if write {
            flags |= IomapFlags::WRITE;
        }

        // The file offset and the virtual address must sit at the same
        // place within a PMD.
        if (vmf.pgoff & PG_PMD_COLOUR) != ((vmf.address >> PAGE_SHIFT) as u64 & PG_PMD_COLOUR) {
            return FaultDisposition::Fallback;
        }

        // Private writes need a copy, which is only done page by page.
        if write && !vma.flags().contains(VmFlags::SHARED) {
            return FaultDisposition::Fallback;
        }

        let range = vma.range();
        if pmd_addr < range.start || pmd_addr + PMD_SIZE > range.end {
            return FaultDisposition::Fallback;
        }

        let pgoff = linear_page_index(vma, pmd_addr);
        let max_pgoff = align_up(self.size(), PAGE_SIZE as u64) >> PAGE_SHIFT;
        if pgoff >= max_pgoff {
            return FaultDisposition::Sigbus;
        }
        if (pgoff | PG_PMD_COLOUR) >= max_pgoff {
            return FaultDisposition::Fallback;
        }

        let Ok(mut entry) = self.grab_entry(pgoff, EntrySize::Pmd) else {
            return FaultDisposition::Fallback;
        };

        // A racing PTE fault has built a page table here. Retrying lets the
        // access be served from it.
        if vma.pmd_state(vmf.address) == PmdState::Table {
            return FaultDisposition::Retry;
        }

        let pos = pgoff << PAGE_SHIFT;
        let Ok(mut iomap) = IomapGuard::begin(ops, pos, PMD_SIZE as u64, flags) else {
            return FaultDisposition::Fallback;
        };
        let extent = *iomap.iomap();

        let disposition = self.pmd_fault_extent(vmf, &mut entry, &extent, flags, pos);
        if disposition != FaultDisposition::Fallback {
            iomap.set_written(PMD_SIZE as u64);
        }

        drop(iomap);
        drop(entry);
        disposition
    }

    fn pmd_fault_extent(
        &self,
        vmf: &VmFault<'_>,
        entry: &mut LockedEntry<'_>,
        extent: &Iomap,
        flags: IomapFlags,
        pos: u64,
    ) -> FaultDisposition {
        let vma = vmf.vma;
        let pmd_addr = vmf.address & !(PMD_SIZE - 1);
        let write = vmf.is_write();

        if extent.end() < pos + PMD_SIZE as u64 {
            return FaultDisposition::Fallback;
        }

        let sync = is_synchronous(flags, vma, extent);

        match extent.kind {
            IomapType::Mapped => {
                let pfn = match self.iomap_pfn(extent, pos, PMD_SIZE) {
                    Ok(pfn) => pfn,
                    Err(err) => {
                        debug!("dax: no huge mapping at {:#x}: {}", pos, err);
                        return FaultDisposition::Fallback;
                    }
                };
                self.insert_mapping(entry, pfn, EntryFlags::PMD, write && !sync);

                if sync {
                    return FaultDisposition::NeedDsync { pfn, major: false };
                }

                trace!("dax: insert pmd {:#x} -> pfn {:#x}", pmd_addr, pfn);
                match vma.insert_pmd(pmd_addr, pfn, write) {
                    Ok(()) => FaultDisposition::NOPAGE,
                    Err(err) => FaultDisposition::from_error(&err),
                }
            }
            IomapType::Hole | IomapType::Unwritten if !write => self.load_pmd_hole(vmf, entry),
            kind => {
                warn!(
                    "dax: unexpected {:?} extent for a {} pmd fault",
                    kind,
                    if write { "write" } else { "read" }
                );
                FaultDisposition::Fallback
            }
        }
    }

    /// Maps the huge zero page read-only to serve a read of a hole.
    fn load_pmd_hole(&self, vmf: &VmFault<'_>, entry: &mut LockedEntry<'_>) -> FaultDisposition {
        let vma = vmf.vma;
        let pmd_addr = vmf.address & !(PMD_SIZE - 1);

        let Some(zero_pfn) = vma.huge_zero_pfn() else {
            return FaultDisposition::Fallback;
        };
        self.insert_mapping(entry, zero_pfn, EntryFlags::PMD | EntryFlags::ZERO_PAGE, false);

        if !vma.insert_huge_zero_pmd(pmd_addr, zero_pfn) {
            return FaultDisposition::Fallback;
        }
        trace!("dax: load pmd hole at {:#x}", pmd_addr);
        FaultDisposition::NOPAGE
    }
}
