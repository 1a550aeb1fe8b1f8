// SPDX-License-Identifier: MPL-2.0

//! The interface to the filesystem's block-mapping resolver.

use bitflags::bitflags;

use crate::prelude::*;

/// The type of a file extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IomapType {
    /// No blocks are allocated.
    Hole,
    /// Blocks are reserved but not yet allocated.
    Delalloc,
    /// Blocks are allocated and hold data.
    Mapped,
    /// Blocks are allocated but read as zeros.
    Unwritten,
    /// Data lives inline in the metadata.
    Inline,
}

bitflags! {
    /// The flags of an extent lookup.
    pub struct IomapFlags: u32 {
        /// The caller is going to write the range.
        const WRITE  = 1 << 0;
        /// The caller is zeroing the range.
        const ZERO   = 1 << 1;
        /// The lookup serves a page fault.
        const FAULT  = 1 << 3;
    }
}

bitflags! {
    /// The flags the resolver attaches to an extent.
    pub struct IomapExtentFlags: u16 {
        /// The blocks have just been allocated.
        const NEW   = 1 << 0;
        /// The extent has metadata changes not yet durable.
        const DIRTY = 1 << 1;
    }
}

/// A file extent returned by [`IomapOps::iomap_begin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Iomap {
    /// The device byte address of `offset`.
    pub addr: u64,
    /// The file byte offset where the extent starts.
    pub offset: u64,
    /// The length of the extent in bytes.
    pub length: u64,
    pub kind: IomapType,
    pub flags: IomapExtentFlags,
}

impl Iomap {
    pub fn new(kind: IomapType, offset: u64, length: u64, addr: u64) -> Self {
        Self {
            addr,
            offset,
            length,
            kind,
            flags: IomapExtentFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: IomapExtentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns the file byte offset just past the extent.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Returns the device byte address of the page containing `pos`.
    pub(crate) fn device_addr(&self, pos: u64) -> u64 {
        self.addr + align_down(pos, PAGE_SIZE as u64) - self.offset
    }
}

/// The block-mapping resolver of a filesystem.
pub trait IomapOps: Send + Sync {
    /// Resolves the extent containing `pos`, allocating blocks if `flags`
    /// contains [`IomapFlags::WRITE`].
    fn iomap_begin(&self, pos: u64, length: u64, flags: IomapFlags) -> Result<Iomap>;

    /// Finishes an extent returned by `iomap_begin`; `written` is 0 when the
    /// caller failed.
    fn iomap_end(
        &self,
        _pos: u64,
        _length: u64,
        _written: u64,
        _flags: IomapFlags,
        _iomap: &Iomap,
    ) -> Result<()> {
        Ok(())
    }
}

/// A resolved extent whose `iomap_end` runs when the guard goes away.
pub(crate) struct IomapGuard<'a> {
    ops: &'a dyn IomapOps,
    pos: u64,
    length: u64,
    flags: IomapFlags,
    iomap: Iomap,
    written: u64,
    ended: bool,
}

impl<'a> IomapGuard<'a> {
    pub(crate) fn begin(ops: &'a dyn IomapOps, pos: u64, length: u64, flags: IomapFlags) -> Result<Self> {
        let iomap = ops.iomap_begin(pos, length, flags)?;
        Ok(Self {
            ops,
            pos,
            length,
            flags,
            iomap,
            written: 0,
            ended: false,
        })
    }

    pub(crate) fn iomap(&self) -> &Iomap {
        &self.iomap
    }

    pub(crate) fn set_written(&mut self, written: u64) {
        self.written = written;
    }

    /// Ends the extent and reports the resolver's verdict.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.ended = true;
        self.ops
            .iomap_end(self.pos, self.length, self.written, self.flags, &self.iomap)
    }
}

impl Drop for IomapGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(err) = self
            .ops
            .iomap_end(self.pos, self.length, self.written, self.flags, &self.iomap)
        {
            warn!("dax: iomap_end failed at {:#x}: {}", self.pos, err);
        }
    }
}
