// SPDX-License-Identifier: MPL-2.0

//! Per-frame metadata of a persistent-memory device.

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex as SpinLock;

use crate::{
    mapping::{DaxMapping, MappingId},
    prelude::*,
};

/// The metadata of one device frame.
///
/// The reference count of an idle frame is 1. Anything above that means the
/// frame is pinned by an external user such as direct I/O.
pub struct FrameMeta {
    owner: SpinLock<Option<FrameOwner>>,
    ref_count: AtomicUsize,
}

/// The back-reference from a frame to the mapping entry using it.
#[derive(Clone)]
pub(crate) struct FrameOwner {
    pub(crate) mapping: Weak<DaxMapping>,
    pub(crate) id: MappingId,
    pub(crate) index: u64,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            owner: SpinLock::new(None),
            ref_count: AtomicUsize::new(1),
        }
    }

    /// Returns the reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Returns whether an external user holds the frame.
    pub fn is_busy(&self) -> bool {
        self.ref_count() > 1
    }

    /// Returns the owning mapping and the file page index, if associated.
    pub fn owner_info(&self) -> Option<(MappingId, u64)> {
        self.owner.lock().as_ref().map(|owner| (owner.id, owner.index))
    }

    pub(crate) fn owner(&self) -> Option<FrameOwner> {
        self.owner.lock().clone()
    }

    /// Sets the back-reference, returning the previous one.
    pub(crate) fn set_owner(&self, owner: FrameOwner) -> Option<FrameOwner> {
        self.owner.lock().replace(owner)
    }

    pub(crate) fn clear_owner(&self) -> Option<FrameOwner> {
        self.owner.lock().take()
    }
}

/// The frame metadata of a whole device, indexed by frame number.
pub struct DevPagemap {
    base_pfn: Pfn,
    frames: Box<[FrameMeta]>,
}

impl DevPagemap {
    /// Creates the metadata of `nr_frames` frames starting at `base_pfn`.
    pub fn new(base_pfn: Pfn, nr_frames: usize) -> Self {
        let frames = (0..nr_frames).map(|_| FrameMeta::new()).collect();
        Self { base_pfn, frames }
    }

    pub fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    pub fn nr_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base_pfn && pfn - self.base_pfn < self.frames.len() as u64
    }

    /// Returns the metadata of the frame `pfn`.
    pub fn frame(&self, pfn: Pfn) -> Option<&FrameMeta> {
        if !self.contains(pfn) {
            return None;
        }
        self.frames.get((pfn - self.base_pfn) as usize)
    }

    /// Takes an extra reference on the frame `pfn` for as long as the
    /// returned guard lives.
    pub fn pin(&self, pfn: Pfn) -> Option<PinnedFrame<'_>> {
        let frame = self.frame(pfn)?;
        frame.ref_count.fetch_add(1, Ordering::AcqRel);
        Some(PinnedFrame { frame, pfn })
    }
}

impl Debug for DevPagemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevPagemap")
            .field("base_pfn", &self.base_pfn)
            .field("nr_frames", &self.frames.len())
            .finish()
    }
}

/// An external reference on a device frame.
#[must_use]
pub struct PinnedFrame<'a> {
    frame: &'a FrameMeta,
    pfn: Pfn,
}

impl PinnedFrame<'_> {
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.frame.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}
