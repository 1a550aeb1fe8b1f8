// SPDX-License-Identifier: MPL-2.0

//! Direct reads and writes of DAX files, and zeroing of file ranges.

use crate::{
    device::{DaxDevice, dax_pgoff},
    entry::EntrySize,
    iomap::{Iomap, IomapExtentFlags, IomapFlags, IomapGuard, IomapOps, IomapType},
    mapping::DaxMapping,
    prelude::*,
};

/// The user buffer of a direct I/O.
enum IoBuf<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl IoBuf<'_> {
    fn len(&self) -> usize {
        match self {
            IoBuf::Read(buf) => buf.len(),
            IoBuf::Write(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, IoBuf::Write(_))
    }
}

impl DaxMapping {
    /// Reads the file from `pos` into `buf`, returning the bytes read.
    ///
    /// Reads stop at the end of the file. Holes and unwritten extents read
    /// as zeros.
    pub fn read(&self, pos: u64, buf: &mut [u8], ops: &dyn IomapOps) -> Result<usize> {
        self.iomap_rw(pos, IoBuf::Read(buf), ops)
    }

    /// Writes `buf` to the file at `pos`, returning the bytes written.
    ///
    /// The filesystem is expected to allocate blocks in `iomap_begin` and to
    /// extend the file size itself.
    pub fn write(&self, pos: u64, buf: &[u8], ops: &dyn IomapOps) -> Result<usize> {
        self.iomap_rw(pos, IoBuf::Write(buf), ops)
    }

    fn iomap_rw(&self, pos: u64, mut buf: IoBuf<'_>, ops: &dyn IomapOps) -> Result<usize> {
        let flags = if buf.is_write() {
            IomapFlags::WRITE
        } else {
            IomapFlags::empty()
        };
        let len = buf.len() as u64;

        let mut done = 0u64;
        while done < len {
            let result = self.iomap_apply(ops, pos + done, len - done, flags, |pos, length, extent| {
                self.copy_extent(pos, length, extent, &mut buf, done as usize)
            });
            match result {
                Ok(0) => break,
                Ok(copied) => done += copied,
                Err(err) if done == 0 => return Err(err),
                Err(err) => {
                    debug!("dax: short {:?} at {:#x}: {}", flags, pos + done, err);
                    break;
                }
            }
        }
        Ok(done as usize)
    }

    /// Resolves the extent at `pos` and runs `actor` on the part of
    /// `pos..pos + length` that it covers.
    fn iomap_apply<F>(&self, ops: &dyn IomapOps, pos: u64, length: u64, flags: IomapFlags, actor: F) -> Result<u64>
    where
        F: FnOnce(u64, u64, &Iomap) -> Result<u64>,
    {
        let mut iomap = IomapGuard::begin(ops, pos, length, flags)?;
        let extent = *iomap.iomap();
        if extent.offset > pos || extent.end() <= pos {
            warn!("dax: extent {:?} does not contain {:#x}", extent, pos);
            return_errno_with_msg!(IoFailed, "the extent does not contain the position");
        }

        let length = length.min(extent.end() - pos);
        let result = actor(pos, length, &extent);
        iomap.set_written(*result.as_ref().unwrap_or(&0));
        let end_result = iomap.finish();

        match result {
            Ok(0) => end_result.map(|_| 0),
            other => other,
        }
    }

    fn copy_extent(&self, pos: u64, length: u64, extent: &Iomap, buf: &mut IoBuf<'_>, buf_offset: usize) -> Result<u64> {
        let mut length = length;

        if let IoBuf::Read(read_buf) = buf {
            let end = (pos + length).min(self.size());
            if pos >= end {
                return Ok(0);
            }
            length = end - pos;

            if matches!(extent.kind, IomapType::Hole | IomapType::Unwritten) {
                read_buf[buf_offset..buf_offset + length as usize].fill(0);
                return Ok(length);
            }
        }

        if extent.kind != IomapType::Mapped {
            warn!("dax: unexpected {:?} extent for direct i/o", extent.kind);
            return_errno!(IoFailed);
        }

        // Cached entries of freshly allocated blocks are stale.
        if extent.flags.contains(IomapExtentFlags::NEW) {
            self.invalidate_pages(pos >> PAGE_SHIFT, (pos + length - 1) >> PAGE_SHIFT);
        }

        let guard = self.device().read_lock();
        let mut done = 0u64;
        let mut error = None;
        while done < length {
            let offset = pos + done;
            let page_offset = (offset % PAGE_SIZE as u64) as usize;
            let remaining = length - done;
            let nr_pages = align_up(page_offset as u64 + remaining, PAGE_SIZE as u64) >> PAGE_SHIFT;

            let access = match dax_pgoff(extent.device_addr(offset))
                .and_then(|pgoff| guard.direct_access(pgoff, nr_pages))
            {
                Ok(access) => access,
                Err(err) => {
                    error = Some(err);
                    break;
                }
            };

            let map_len = ((access.nr_pages << PAGE_SHIFT) - page_offset as u64).min(remaining) as usize;
            let kaddr = access.kaddr + page_offset;
            let start = buf_offset + done as usize;
            let copied = match buf {
                IoBuf::Write(write_buf) => guard.copy_from_buf(kaddr, &write_buf[start..start + map_len]),
                IoBuf::Read(read_buf) => guard.copy_to_buf(kaddr, &mut read_buf[start..start + map_len]),
            };
            done += copied as u64;
            if copied != map_len {
                error = Some(Error::with_msg(BadAddress, "short copy"));
                break;
            }
        }

        match error {
            Some(err) if done == 0 => Err(err),
            _ => Ok(done),
        }
    }

    /// Unmaps the pages `start..=end` and drops their clean entries.
    fn invalidate_pages(&self, start: u64, end: u64) {
        self.rmap().unmap_pages(start, end - start + 1);

        let indices: Vec<u64> = {
            let pages = self.entries().read();
            pages
                .range(align_down(start, PG_PMD_NR)..end + 1)
                .filter(|(index, slot)| {
                    *index >= start
                        || (slot.entry.size() == EntrySize::Pmd && index + PG_PMD_NR > start)
                })
                .map(|(index, _)| index)
                .collect()
        };
        for index in indices {
            if !self.invalidate_entry_if_clean(index) {
                debug!("dax: entry {:#x} is kept over a new extent", index);
            }
        }
    }

    /// Zeroes `len` bytes of the file at `pos`.
    ///
    /// Holes and unwritten extents already read as zeros and are skipped.
    pub fn zero_range(&self, pos: u64, len: u64, ops: &dyn IomapOps) -> Result<()> {
        let mut done = 0;
        while done < len {
            let zeroed = self.iomap_apply(
                ops,
                pos + done,
                len - done,
                IomapFlags::WRITE | IomapFlags::ZERO,
                |pos, length, extent| self.zero_extent(pos, length, extent),
            )?;
            if zeroed == 0 {
                break;
            }
            done += zeroed;
        }
        Ok(())
    }

    fn zero_extent(&self, pos: u64, length: u64, extent: &Iomap) -> Result<u64> {
        match extent.kind {
            IomapType::Hole | IomapType::Unwritten => return Ok(length),
            IomapType::Mapped => {}
            kind => {
                warn!("dax: cannot zero a {:?} extent", kind);
                return_errno!(IoFailed);
            }
        }

        let mut done = 0;
        while done < length {
            let offset = pos + done;
            let page_offset = (offset % PAGE_SIZE as u64) as usize;
            let bytes = (PAGE_SIZE - page_offset).min((length - done) as usize);
            zero_page_range(self.device(), extent.device_addr(offset), page_offset, bytes)?;
            done += bytes as u64;
        }
        Ok(length)
    }
}

/// Zeroes `len` bytes at `offset` within the device page at byte address
/// `addr`, and makes them durable.
pub fn zero_page_range(device: &DaxDevice, addr: u64, offset: usize, len: usize) -> Result<()> {
    if offset + len > PAGE_SIZE {
        return_errno_with_msg!(InvalidArgs, "the range crosses a page boundary");
    }

    let pgoff = dax_pgoff(addr)?;
    let guard = device.read_lock();
    let access = guard.direct_access(pgoff, 1)?;
    let zeros = [0u8; PAGE_SIZE];
    guard.copy_from_buf(access.kaddr + offset, &zeros[..len]);
    guard.flush(access.kaddr + offset, len);
    Ok(())
}
