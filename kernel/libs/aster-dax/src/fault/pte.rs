// SPDX-License-Identifier: MPL-2.0

use super::{FaultDisposition, PmdState, VmFault, is_synchronous};
use crate::{
    entry::{EntryFlags, EntrySize},
    iomap::{Iomap, IomapExtentFlags, IomapFlags, IomapGuard, IomapOps, IomapType},
    mapping::{DaxMapping, LockedEntry},
    prelude::*,
};

impl DaxMapping {
    pub(super) fn pte_fault(&self, vmf: &mut VmFault<'_>, ops: &dyn IomapOps) -> FaultDisposition {
        let pos = vmf.pgoff << PAGE_SHIFT;
        trace!("dax: pte fault at {:#x}, pgoff {:#x}", vmf.address, vmf.pgoff);

        if pos >= self.size() {
            return FaultDisposition::Sigbus;
        }

        let write = vmf.is_write();
        let mut flags = IomapFlags::FAULT;
        if write && vmf.cow_page.is_none() {
            flags |= IomapFlags::WRITE;
        }

        let mut entry = match self.grab_entry(vmf.pgoff, EntrySize::Pte) {
            Ok(entry) => entry,
            Err(err) => return FaultDisposition::from_error(&err),
        };

        // A racing PMD fault has mapped the whole range.
        if vmf.vma.pmd_state(vmf.address) == PmdState::Huge {
            return FaultDisposition::NOPAGE;
        }

        let mut iomap = match IomapGuard::begin(ops, pos, PAGE_SIZE as u64, flags) {
            Ok(iomap) => iomap,
            Err(err) => return FaultDisposition::from_error(&err),
        };
        let extent = *iomap.iomap();

        let disposition = match self.pte_fault_extent(vmf, &mut entry, &extent, flags, pos) {
            Ok(disposition) => disposition,
            Err(err) => FaultDisposition::from_error(&err),
        };
        if !disposition.is_error() {
            iomap.set_written(PAGE_SIZE as u64);
        }

        drop(iomap);
        drop(entry);
        trace!("dax: pte fault at {:#x} done: {:?}", vmf.address, disposition);
        disposition
    }

    fn pte_fault_extent(
        &self,
        vmf: &mut VmFault<'_>,
        entry: &mut LockedEntry<'_>,
        extent: &Iomap,
        flags: IomapFlags,
        pos: u64,
    ) -> Result<FaultDisposition> {
        let vma = vmf.vma;
        let address = vmf.address;
        let write = vmf.is_write();

        if extent.end() < pos + PAGE_SIZE as u64 {
            return_errno_with_msg!(IoFailed, "the extent does not cover the faulting page");
        }

        if let Some(page) = vmf.cow_page.as_deref_mut() {
            match extent.kind {
                IomapType::Hole | IomapType::Unwritten => page.fill(0),
                IomapType::Mapped => self.copy_user_dax(extent, pos, page)?,
                kind => {
                    warn!("dax: unexpected {:?} extent for a cow fault", kind);
                    return_errno!(IoFailed);
                }
            }
            vma.finish_cow_fault(address, page)?;
            return Ok(FaultDisposition::DoneCow);
        }

        let sync = is_synchronous(flags, vma, extent);

        match extent.kind {
            IomapType::Mapped => {
                let major = extent.flags.contains(IomapExtentFlags::NEW);
                if major {
                    self.stats().count_major();
                }
                let pfn = self.iomap_pfn(extent, pos, PAGE_SIZE)?;
                self.insert_mapping(entry, pfn, EntryFlags::empty(), write && !sync);

                // The filesystem has to make the block allocation durable
                // before the page becomes writable through the mapping.
                if sync {
                    return Ok(FaultDisposition::NeedDsync { pfn, major });
                }

                trace!("dax: insert pte {:#x} -> pfn {:#x}", address, pfn);
                vma.insert_pte(address, pfn, write)?;
                Ok(FaultDisposition::NoPage { major })
            }
            IomapType::Hole | IomapType::Unwritten if !write => self.load_hole(vmf, entry),
            kind => {
                warn!(
                    "dax: unexpected {:?} extent for a {} fault",
                    kind,
                    if write { "write" } else { "read" }
                );
                return_errno!(IoFailed);
            }
        }
    }

    /// Maps the zero page read-only to serve a read of a hole.
    fn load_hole(&self, vmf: &VmFault<'_>, entry: &mut LockedEntry<'_>) -> Result<FaultDisposition> {
        let pfn = vmf.vma.zero_pfn(vmf.address);
        self.insert_mapping(entry, pfn, EntryFlags::ZERO_PAGE, false);
        vmf.vma.insert_pte(vmf.address, pfn, false)?;
        trace!("dax: load hole at {:#x}", vmf.address);
        Ok(FaultDisposition::NOPAGE)
    }
}
