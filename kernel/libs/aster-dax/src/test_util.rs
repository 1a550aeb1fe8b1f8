// SPDX-License-Identifier: MPL-2.0

//! Fakes of the collaborators of a DAX mapping, for unit tests.

use core::ops::Range;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Barrier,
        atomic::{AtomicBool, Ordering},
    },
};

use spin::Mutex as SpinLock;

use crate::{
    device::{DaxDevice, DaxOperations, DirectAccess},
    entry::EntrySize,
    error::Errno,
    fault::{PmdState, VmArea, VmFlags},
    frame::DevPagemap,
    iomap::{Iomap, IomapExtentFlags, IomapFlags, IomapOps, IomapType},
    mapping::{DaxMapping, DaxMappingFlags, DaxMappingOptions, ReverseMap},
    prelude::*,
};

pub(crate) const TEST_BASE_PFN: Pfn = 0x10000;
pub(crate) const TEST_NR_FRAMES: usize = 2048;
pub(crate) const ZERO_PFN: Pfn = 0x1;
pub(crate) const HUGE_ZERO_PFN: Pfn = 0x200;
pub(crate) const VMA_START: usize = 0x4000_0000;

/// The contents and flush log of a RAM-backed fake device.
pub(crate) struct PmemState {
    data: SpinLock<Vec<u8>>,
    flushes: SpinLock<Vec<(usize, usize)>>,
}

impl PmemState {
    pub(crate) fn flushes(&self) -> Vec<(usize, usize)> {
        self.flushes.lock().clone()
    }

    pub(crate) fn clear_flushes(&self) {
        self.flushes.lock().clear();
    }

    pub(crate) fn read(&self, kaddr: usize, len: usize) -> Vec<u8> {
        self.data.lock()[kaddr..kaddr + len].to_vec()
    }

    pub(crate) fn write(&self, kaddr: usize, buf: &[u8]) {
        self.data.lock()[kaddr..kaddr + buf.len()].copy_from_slice(buf);
    }
}

pub(crate) struct MockPmem {
    state: Arc<PmemState>,
    base_pfn: Pfn,
    nr_frames: u64,
    devmap: bool,
}

impl MockPmem {
    pub(crate) fn new_device(base_pfn: Pfn, nr_frames: usize) -> Arc<DaxDevice> {
        Self::new_device_with_state(base_pfn, nr_frames, true).0
    }

    pub(crate) fn new_device_with_state(
        base_pfn: Pfn,
        nr_frames: usize,
        devmap: bool,
    ) -> (Arc<DaxDevice>, Arc<PmemState>) {
        let state = Arc::new(PmemState {
            data: SpinLock::new(vec![0; nr_frames * PAGE_SIZE]),
            flushes: SpinLock::new(Vec::new()),
        });
        let pmem = MockPmem {
            state: state.clone(),
            base_pfn,
            nr_frames: nr_frames as u64,
            devmap,
        };
        let device = DaxDevice::new(Box::new(pmem), DevPagemap::new(base_pfn, nr_frames));
        (device, state)
    }
}

impl DaxOperations for MockPmem {
    fn direct_access(&self, pgoff: u64, _nr_pages: u64) -> Result<DirectAccess> {
        if pgoff >= self.nr_frames {
            return_errno_with_msg!(InvalidArgs, "beyond the device");
        }
        Ok(DirectAccess {
            kaddr: (pgoff as usize) << PAGE_SHIFT,
            pfn: self.base_pfn + pgoff,
            nr_pages: self.nr_frames - pgoff,
            devmap: self.devmap,
        })
    }

    fn copy_from_buf(&self, kaddr: usize, buf: &[u8]) -> usize {
        self.state.write(kaddr, buf);
        buf.len()
    }

    fn copy_to_buf(&self, kaddr: usize, buf: &mut [u8]) -> usize {
        buf.copy_from_slice(&self.state.data.lock()[kaddr..kaddr + buf.len()]);
        buf.len()
    }

    fn flush(&self, kaddr: usize, len: usize) {
        self.state.flushes.lock().push((kaddr, len));
    }
}

/// A reverse map that records what it is asked to do.
pub(crate) struct MockRmap {
    mapped: AtomicBool,
    unmapped: SpinLock<Vec<(u64, u64)>>,
    protected: SpinLock<Vec<(u64, Pfn, EntrySize)>>,
    unmap_gate: SpinLock<Option<Arc<Barrier>>>,
}

impl MockRmap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            mapped: AtomicBool::new(true),
            unmapped: SpinLock::new(Vec::new()),
            protected: SpinLock::new(Vec::new()),
            unmap_gate: SpinLock::new(None),
        })
    }

    /// Makes the next `unmap_pages` wait on `gate` twice: once to announce
    /// that it has been entered, once to be let go.
    pub(crate) fn pause_next_unmap(&self, gate: Arc<Barrier>) {
        *self.unmap_gate.lock() = Some(gate);
    }

    pub(crate) fn set_mapped(&self, mapped: bool) {
        self.mapped.store(mapped, Ordering::Relaxed);
    }

    pub(crate) fn unmapped(&self) -> Vec<(u64, u64)> {
        self.unmapped.lock().clone()
    }

    pub(crate) fn write_protected(&self) -> Vec<(u64, Pfn, EntrySize)> {
        self.protected.lock().clone()
    }

    pub(crate) fn clear_log(&self) {
        self.unmapped.lock().clear();
        self.protected.lock().clear();
    }
}

impl ReverseMap for MockRmap {
    fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Relaxed)
    }

    fn unmap_pages(&self, start: u64, nr_pages: u64) {
        self.unmapped.lock().push((start, nr_pages));
        let gate = self.unmap_gate.lock().take();
        if let Some(gate) = gate {
            gate.wait();
            gate.wait();
        }
    }

    fn write_protect(&self, index: u64, pfn: Pfn, size: EntrySize) {
        self.protected.lock().push((index, pfn, size));
    }
}

/// A filesystem that maps file offset `x` to device address `addr_base + x`
/// and allocates blocks on write.
pub(crate) struct MockFs {
    allocated: SpinLock<BTreeSet<u64>>,
    addr_base: u64,
    unallocated_kind: IomapType,
    report_dirty: AtomicBool,
    fail_with: SpinLock<Option<Errno>>,
    ends: SpinLock<Vec<(u64, u64, u64)>>,
}

impl MockFs {
    pub(crate) fn with_unallocated_kind(addr_base: u64, unallocated_kind: IomapType) -> Arc<Self> {
        Arc::new(Self {
            allocated: SpinLock::new(BTreeSet::new()),
            addr_base,
            unallocated_kind,
            report_dirty: AtomicBool::new(false),
            fail_with: SpinLock::new(None),
            ends: SpinLock::new(Vec::new()),
        })
    }

    /// Makes writes report metadata that is not yet durable.
    pub(crate) fn set_report_dirty(&self, dirty: bool) {
        self.report_dirty.store(dirty, Ordering::Relaxed);
    }

    pub(crate) fn fail_with(&self, errno: Option<Errno>) {
        *self.fail_with.lock() = errno;
    }

    pub(crate) fn allocate(&self, pages: Range<u64>) {
        self.allocated.lock().extend(pages);
    }

    pub(crate) fn ends(&self) -> Vec<(u64, u64, u64)> {
        self.ends.lock().clone()
    }
}

impl IomapOps for MockFs {
    fn iomap_begin(&self, pos: u64, length: u64, flags: IomapFlags) -> Result<Iomap> {
        if let Some(errno) = *self.fail_with.lock() {
            return_errno!(errno);
        }

        let first = pos >> PAGE_SHIFT;
        let last = (pos + length.max(1) - 1) >> PAGE_SHIFT;
        let offset = first << PAGE_SHIFT;
        let mut allocated = self.allocated.lock();

        if flags.contains(IomapFlags::WRITE) && !flags.contains(IomapFlags::ZERO) {
            let mut extent_flags = IomapExtentFlags::empty();
            for page in first..=last {
                if allocated.insert(page) {
                    extent_flags |= IomapExtentFlags::NEW;
                }
            }
            if self.report_dirty.load(Ordering::Relaxed) {
                extent_flags |= IomapExtentFlags::DIRTY;
            }
            let length = (last - first + 1) << PAGE_SHIFT;
            return Ok(Iomap::new(IomapType::Mapped, offset, length, self.addr_base + offset)
                .with_flags(extent_flags));
        }

        // The longest run of pages that share the allocation state of the first.
        let is_allocated = allocated.contains(&first);
        let mut end = first + 1;
        while end <= last && allocated.contains(&end) == is_allocated {
            end += 1;
        }
        let length = (end - first) << PAGE_SHIFT;
        let kind = if is_allocated {
            IomapType::Mapped
        } else {
            self.unallocated_kind
        };
        Ok(Iomap::new(kind, offset, length, self.addr_base + offset))
    }

    fn iomap_end(&self, pos: u64, length: u64, written: u64, _flags: IomapFlags, _iomap: &Iomap) -> Result<()> {
        self.ends.lock().push((pos, length, written));
        Ok(())
    }
}

/// A VMA that records the page-table entries installed through it.
pub(crate) struct MockVma {
    range: Range<usize>,
    pgoff: u64,
    flags: VmFlags,
    ptes: SpinLock<BTreeMap<usize, (Pfn, bool)>>,
    pmds: SpinLock<BTreeMap<usize, (Pfn, bool)>>,
    splits: SpinLock<Vec<usize>>,
    cow_pages: SpinLock<Vec<(usize, Vec<u8>)>>,
    no_huge_zero_page: AtomicBool,
}

impl MockVma {
    pub(crate) fn new(range: Range<usize>, pgoff: u64, flags: VmFlags) -> Self {
        Self {
            range,
            pgoff,
            flags,
            ptes: SpinLock::new(BTreeMap::new()),
            pmds: SpinLock::new(BTreeMap::new()),
            splits: SpinLock::new(Vec::new()),
            cow_pages: SpinLock::new(Vec::new()),
            no_huge_zero_page: AtomicBool::new(false),
        }
    }

    /// Returns the address of the file page `index`.
    pub(crate) fn addr_of(&self, index: u64) -> usize {
        self.range.start + ((index - self.pgoff) as usize) * PAGE_SIZE
    }

    pub(crate) fn pte(&self, address: usize) -> Option<(Pfn, bool)> {
        self.ptes.lock().get(&(address & !(PAGE_SIZE - 1))).copied()
    }

    pub(crate) fn pmd(&self, address: usize) -> Option<(Pfn, bool)> {
        self.pmds.lock().get(&(address & !(PMD_SIZE - 1))).copied()
    }

    pub(crate) fn splits(&self) -> Vec<usize> {
        self.splits.lock().clone()
    }

    pub(crate) fn cow_pages(&self) -> Vec<(usize, Vec<u8>)> {
        self.cow_pages.lock().clone()
    }

    pub(crate) fn disable_huge_zero_page(&self) {
        self.no_huge_zero_page.store(true, Ordering::Relaxed);
    }
}

impl VmArea for MockVma {
    fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    fn pgoff(&self) -> u64 {
        self.pgoff
    }

    fn flags(&self) -> VmFlags {
        self.flags
    }

    fn pmd_state(&self, address: usize) -> PmdState {
        let pmd_addr = address & !(PMD_SIZE - 1);
        if self.pmds.lock().contains_key(&pmd_addr) {
            return PmdState::Huge;
        }
        if self.ptes.lock().range(pmd_addr..pmd_addr + PMD_SIZE).next().is_some() {
            return PmdState::Table;
        }
        PmdState::None
    }

    fn insert_pte(&self, address: usize, pfn: Pfn, write: bool) -> Result<()> {
        self.ptes
            .lock()
            .insert(address & !(PAGE_SIZE - 1), (pfn, write));
        Ok(())
    }

    fn insert_pmd(&self, address: usize, pfn: Pfn, write: bool) -> Result<()> {
        self.pmds.lock().insert(address, (pfn, write));
        Ok(())
    }

    fn insert_huge_zero_pmd(&self, address: usize, pfn: Pfn) -> bool {
        if self.pmd_state(address) != PmdState::None {
            return false;
        }
        self.pmds.lock().insert(address, (pfn, false));
        true
    }

    fn split_huge_pmd(&self, address: usize) {
        self.splits.lock().push(address);
        self.pmds.lock().remove(&(address & !(PMD_SIZE - 1)));
    }

    fn zero_pfn(&self, _address: usize) -> Pfn {
        ZERO_PFN
    }

    fn huge_zero_pfn(&self) -> Option<Pfn> {
        if self.no_huge_zero_page.load(Ordering::Relaxed) {
            return None;
        }
        Some(HUGE_ZERO_PFN)
    }

    fn finish_cow_fault(&self, address: usize, page: &[u8]) -> Result<()> {
        self.cow_pages.lock().push((address, page.to_vec()));
        Ok(())
    }
}

pub(crate) struct TestEnvOptions {
    pub(crate) flags: DaxMappingFlags,
    pub(crate) size: u64,
    pub(crate) index_capacity: Option<usize>,
    pub(crate) devmap: bool,
    pub(crate) addr_base: u64,
    pub(crate) unallocated_kind: IomapType,
}

impl Default for TestEnvOptions {
    fn default() -> Self {
        Self {
            flags: DaxMappingFlags::HUGE_FAULTS,
            size: (TEST_NR_FRAMES * PAGE_SIZE) as u64,
            index_capacity: None,
            devmap: true,
            addr_base: 0,
            unallocated_kind: IomapType::Hole,
        }
    }
}

/// A mapping wired to fresh fakes.
pub(crate) struct TestEnv {
    pub(crate) mapping: Arc<DaxMapping>,
    pub(crate) device: Arc<DaxDevice>,
    pub(crate) pmem: Arc<PmemState>,
    pub(crate) rmap: Arc<MockRmap>,
    pub(crate) fs: Arc<MockFs>,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_options(TestEnvOptions::default())
    }

    pub(crate) fn with_options(options: TestEnvOptions) -> Self {
        let (device, pmem) = MockPmem::new_device_with_state(TEST_BASE_PFN, TEST_NR_FRAMES, options.devmap);
        let rmap = MockRmap::new();
        let mut mapping_options = DaxMappingOptions::new(device.clone(), rmap.clone())
            .size(options.size)
            .flags(options.flags);
        if let Some(capacity) = options.index_capacity {
            mapping_options = mapping_options.index_capacity(capacity);
        }
        let fs = MockFs::with_unallocated_kind(options.addr_base, options.unallocated_kind);
        Self {
            mapping: mapping_options.build(),
            device,
            pmem,
            rmap,
            fs,
        }
    }

    pub(crate) fn base_pfn(&self) -> Pfn {
        TEST_BASE_PFN
    }

    /// Returns a VMA mapping the whole file from page 0.
    pub(crate) fn vma(&self, flags: VmFlags) -> MockVma {
        let len = align_up(self.mapping.size(), PMD_SIZE as u64) as usize;
        MockVma::new(VMA_START..VMA_START + len, 0, flags)
    }
}
