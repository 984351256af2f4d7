// SPDX-License-Identifier: MPL-2.0

//! The memory manager: the top-level facade a trap handler calls into to
//! resolve a page fault, plus the handful of physical-frame and scratch-
//! mapping primitives every [`Vmo`](super::vmo::Vmo) flavor is built on.
//!
//! Everything here is a thin, deliberately boring wrapper: the actual
//! fault-handling logic lives in [`Region::handle_fault`]; this module's
//! only job is getting a raw faulting address to the right `Region` and
//! exposing the frame allocator under names that read naturally from a
//! VMO's point of view ("allocate a user physical page") rather than the
//! allocator's own ("allocate a frame").

use alloc::sync::Arc;

use crate::vm::{
    frame_allocator, page_directory::PageDirectory, region::PageFault, FrameKind, PageFaultResponse,
    PhysicalFrame, Region,
};

/// Resolves a page fault raised while `pd` was the active address space.
///
/// Looks up the [`Region`] owning `fault.vaddr` and dispatches to it;
/// an address with no owning region is always a crash, never a retry.
pub fn handle_page_fault(pd: &Arc<PageDirectory>, fault: PageFault) -> PageFaultResponse {
    match pd.find_region(fault.vaddr) {
        Some(region) => region.handle_fault(fault),
        None => PageFaultResponse::ShouldCrash,
    }
}

/// Allocates a single physical frame for user-controlled memory, charged
/// directly against the free pool.
pub fn allocate_user_physical_page(zero_fill: bool) -> Option<PhysicalFrame> {
    frame_allocator::allocate_user_frame(zero_fill)
}

/// Allocates a single physical frame against an already-held commit
/// reservation (see [`commit_user_physical_pages`]). Infallible.
pub fn allocate_committed_user_physical_page(zero_fill: bool) -> PhysicalFrame {
    frame_allocator::allocate_committed_frame(zero_fill)
}

/// Reserves `n` pages from the global commit pool without allocating them
/// yet.
pub fn commit_user_physical_pages(n: usize) -> crate::Result<()> {
    frame_allocator::commit(n)
}

/// Releases `n` previously committed but never materialized pages.
pub fn uncommit_user_physical_pages(n: usize) {
    frame_allocator::uncommit(n)
}

pub fn shared_zero_page() -> PhysicalFrame {
    frame_allocator::shared_zero_frame()
}

pub fn lazy_committed_page() -> PhysicalFrame {
    frame_allocator::lazy_committed_frame()
}

/// A short-lived mapping of a physical frame into a scratch window, used to
/// read or write a frame's contents from kernel code that doesn't already
/// hold a typed reference to it (CoW duplication, inode page-in).
///
/// This crate keeps every usable physical frame permanently reachable
/// through [`super::paddr_to_vaddr`]'s linear offset mapping, so the
/// "window" here is just that same direct mapping viewed through a
/// frame-scoped guard — there is no separate scratch PTE slot to contend
/// over. The guard still enforces the acquire/use/release shape (never
/// hold two at once over the same frame) so call sites read the same way
/// they would on an architecture that actually needs a dedicated window.
pub struct QuickMap<'a> {
    frame: &'a PhysicalFrame,
}

impl<'a> QuickMap<'a> {
    pub fn as_ptr(&self) -> *const u8 {
        self.frame.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.frame.as_mut_ptr()
    }
}

/// Acquires a scratch mapping of `frame`. Dropping the guard releases it.
pub fn quick_map(frame: &PhysicalFrame) -> QuickMap<'_> {
    QuickMap { frame }
}

/// Whether `frame` is one of the two process-wide sentinels rather than a
/// materialized page.
pub fn is_sentinel(frame: &PhysicalFrame) -> bool {
    frame.kind() != FrameKind::Normal
}

#[cfg(test)]
mod test {
    use super::*;

    #[ktest::ktest]
    fn sentinel_classification() {
        assert!(is_sentinel(&shared_zero_page()));
        assert!(is_sentinel(&lazy_committed_page()));
    }
}
