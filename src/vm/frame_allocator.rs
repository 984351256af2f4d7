// SPDX-License-Identifier: MPL-2.0

//! The physical frame allocator.
//!
//! Hands out and reclaims page-sized physical frames, and tracks the
//! global commit reserve that backs lazily-committed anonymous memory.
//! Besides ordinary frames, it hands out two process-wide sentinels: the
//! shared-zero frame and the lazy-committed placeholder. Neither sentinel
//! is ever returned to the underlying allocator.

use alloc::vec::Vec;
use buddy_system_allocator::FrameAllocator;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::info;
use spin::Once;

use crate::boot::memory_region::{MemoryRegion, MemoryRegionType};
use crate::util::align::AlignExt;
use crate::{config::PAGE_SIZE, sync::SpinLock, Error, prelude::Result};

use super::frame::{FrameKind, VmFrameFlags};
use super::{PhysicalFrame, VmFrameVec, VmSegment};

pub(super) static FRAME_ALLOCATOR: Once<SpinLock<FrameAllocator>> = Once::new();

/// Total number of usable page frames discovered at boot.
static TOTAL_FRAMES: AtomicUsize = AtomicUsize::new(0);
/// Number of page frames currently handed out as `Normal` frames (directly
/// allocated, not counting outstanding commit reservations).
static ALLOCATED_FRAMES: AtomicUsize = AtomicUsize::new(0);

/// Number of pages reserved out of the global pool but not yet materialized
/// into ordinary frames (outstanding `commit()` calls not yet matched by an
/// `allocate_committed_frame` or `uncommit`).
static COMMITTED_PAGES: SpinLock<usize> = SpinLock::new(0);

static SHARED_ZERO_FRAME: Once<PhysicalFrame> = Once::new();
static LAZY_COMMITTED_FRAME: Once<PhysicalFrame> = Once::new();

/// Allocates a single `Normal` frame, optionally zeroing it, charged
/// directly against the free pool (not the commit reserve).
///
/// Returns `None` if the underlying allocator is exhausted.
pub fn allocate_user_frame(zero_fill: bool) -> Option<PhysicalFrame> {
    let frame = alloc_single(VmFrameFlags::empty())?;
    if zero_fill {
        frame.zero();
    }
    Some(frame)
}

/// Allocates a single `Normal` frame against an already-held commit
/// reservation. Infallible: the caller must have previously called
/// [`commit`] for at least one page still outstanding.
pub fn allocate_committed_frame(zero_fill: bool) -> PhysicalFrame {
    let frame = alloc_single(VmFrameFlags::empty())
        .expect("allocate_committed_frame called without a valid commit reservation");
    if zero_fill {
        frame.zero();
    }
    let mut committed = COMMITTED_PAGES.lock();
    *committed = committed
        .checked_sub(1)
        .expect("allocate_committed_frame: commit reserve underflow");
    frame
}

/// Reserves `n` pages from the global commit pool.
///
/// Fails without reserving anything if the free pool cannot cover it.
pub fn commit(n: usize) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let mut committed = COMMITTED_PAGES.lock();
    let total = TOTAL_FRAMES.load(Ordering::Relaxed);
    let allocated = ALLOCATED_FRAMES.load(Ordering::Relaxed);
    let free = total.saturating_sub(allocated).saturating_sub(*committed);
    if free < n {
        return Err(Error::NoMemory);
    }
    *committed += n;
    Ok(())
}

/// Releases `n` previously committed (but never materialized) pages back
/// to the global pool.
pub fn uncommit(n: usize) {
    if n == 0 {
        return;
    }
    let mut committed = COMMITTED_PAGES.lock();
    *committed = committed
        .checked_sub(n)
        .expect("uncommit: releasing more pages than are committed");
}

/// Returns the single, process-wide, all-zero frame.
pub fn shared_zero_frame() -> PhysicalFrame {
    SHARED_ZERO_FRAME
        .get()
        .expect("shared zero frame not initialized")
        .clone()
}

/// Returns the single, process-wide lazy-committed placeholder.
pub fn lazy_committed_frame() -> PhysicalFrame {
    LAZY_COMMITTED_FRAME
        .get()
        .expect("lazy committed frame not initialized")
        .clone()
}

pub(crate) fn alloc(nframes: usize, flags: VmFrameFlags) -> Option<VmFrameVec> {
    let start = FRAME_ALLOCATOR.get().unwrap().lock().alloc(nframes)?;
    ALLOCATED_FRAMES.fetch_add(nframes, Ordering::Relaxed);
    let mut vector = Vec::new();
    // Safety: The frame index is valid and exclusively owned by the
    // allocator's return value.
    unsafe {
        for i in 0..nframes {
            let frame = PhysicalFrame::new_normal((start + i) * PAGE_SIZE);
            vector.push(frame);
        }
    }
    let _ = flags;
    Some(VmFrameVec(vector))
}

pub(crate) fn alloc_single(flags: VmFrameFlags) -> Option<PhysicalFrame> {
    let _ = flags;
    let idx = FRAME_ALLOCATOR.get().unwrap().lock().alloc(1)?;
    ALLOCATED_FRAMES.fetch_add(1, Ordering::Relaxed);
    // Safety: The frame index is valid and exclusively owned by the
    // allocator's return value.
    Some(unsafe { PhysicalFrame::new_normal(idx * PAGE_SIZE) })
}

pub(crate) fn alloc_contiguous(nframes: usize, flags: VmFrameFlags) -> Option<VmSegment> {
    let start = FRAME_ALLOCATOR.get().unwrap().lock().alloc(nframes)?;
    ALLOCATED_FRAMES.fetch_add(nframes, Ordering::Relaxed);
    // Safety: The range of page frames is contiguous and valid.
    Some(unsafe {
        VmSegment::new(
            start * PAGE_SIZE,
            nframes,
            flags.union(VmFrameFlags::NEED_DEALLOC),
        )
    })
}

/// Deallocate a frame.
///
/// # Safety
///
/// User should ensure the index is valid
///
pub(crate) unsafe fn dealloc_single(index: usize) {
    FRAME_ALLOCATOR.get().unwrap().lock().dealloc(index, 1);
    ALLOCATED_FRAMES.fetch_sub(1, Ordering::Relaxed);
}

/// Deallocate a contiguous range of page frames.
///
/// # Safety
///
/// User should ensure the range of page frames is valid.
///
pub(crate) unsafe fn dealloc_contiguous(start_index: usize, nframes: usize) {
    FRAME_ALLOCATOR
        .get()
        .unwrap()
        .lock()
        .dealloc(start_index, nframes);
    ALLOCATED_FRAMES.fetch_sub(nframes, Ordering::Relaxed);
}

pub(crate) fn init(regions: &[MemoryRegion]) {
    let mut allocator = FrameAllocator::<32>::new();
    let mut total_frames = 0usize;
    for region in regions.iter() {
        if region.typ() == MemoryRegionType::Usable {
            // Make the memory region page-aligned, and skip if it is too small.
            let start = region.base().align_up(PAGE_SIZE) / PAGE_SIZE;
            let end = (region.base() + region.len()).align_down(PAGE_SIZE) / PAGE_SIZE;
            if end <= start {
                continue;
            }
            allocator.add_frame(start, end);
            total_frames += end - start;
            info!(
                "Found usable region, start:{:x}, end:{:x}",
                region.base(),
                region.base() + region.len()
            );
        }
    }
    TOTAL_FRAMES.store(total_frames, Ordering::Relaxed);
    FRAME_ALLOCATOR.call_once(|| SpinLock::new(allocator));

    let zero_index = FRAME_ALLOCATOR
        .get()
        .unwrap()
        .lock()
        .alloc(1)
        .expect("failed to reserve the shared zero frame");
    ALLOCATED_FRAMES.fetch_add(1, Ordering::Relaxed);
    let zero_paddr = zero_index * PAGE_SIZE;
    // Safety: `zero_paddr` was just exclusively allocated above and is kept
    // zeroed for the lifetime of the kernel (the sentinel is read-only).
    let zero_frame = unsafe { PhysicalFrame::new_sentinel(zero_paddr, FrameKind::SharedZero) };
    zero_frame.zero();
    SHARED_ZERO_FRAME.call_once(|| zero_frame);

    // The lazy-committed sentinel has no physical backing; its address is
    // never dereferenced.
    // Safety: `FrameKind::LazyCommitted` frames are never read through
    // their address.
    LAZY_COMMITTED_FRAME
        .call_once(|| unsafe { PhysicalFrame::new_sentinel(0, FrameKind::LazyCommitted) });
}

#[cfg(test)]
mod test {
    use super::*;

    #[ktest::ktest]
    fn commit_uncommit_round_trip() {
        let before = *COMMITTED_PAGES.lock();
        commit(3).unwrap();
        assert_eq!(*COMMITTED_PAGES.lock(), before + 3);
        uncommit(3);
        assert_eq!(*COMMITTED_PAGES.lock(), before);
    }

    #[ktest::ktest]
    fn commit_zero_is_a_no_op() {
        let before = *COMMITTED_PAGES.lock();
        commit(0).unwrap();
        assert_eq!(*COMMITTED_PAGES.lock(), before);
        uncommit(0);
        assert_eq!(*COMMITTED_PAGES.lock(), before);
    }

    #[ktest::ktest]
    fn allocate_committed_frame_debits_the_reservation() {
        commit(1).unwrap();
        let before = *COMMITTED_PAGES.lock();
        let frame = allocate_committed_frame(true);
        assert_eq!(*COMMITTED_PAGES.lock(), before - 1);
        assert_eq!(frame.kind(), FrameKind::Normal);
    }

    #[ktest::ktest]
    fn sentinels_are_never_reclaimed() {
        let zero = shared_zero_frame();
        let lazy = lazy_committed_frame();
        assert_eq!(zero.kind(), FrameKind::SharedZero);
        assert_eq!(lazy.kind(), FrameKind::LazyCommitted);
        // Sentinels compare equal to themselves by identity and survive
        // being dropped many times over without affecting allocation state.
        let allocated_before = ALLOCATED_FRAMES.load(Ordering::Relaxed);
        drop(zero.clone());
        drop(lazy.clone());
        assert_eq!(ALLOCATED_FRAMES.load(Ordering::Relaxed), allocated_before);
    }

    #[ktest::ktest]
    fn normal_frame_returns_to_the_allocator_on_last_drop() {
        let allocated_before = ALLOCATED_FRAMES.load(Ordering::Relaxed);
        let frame = allocate_user_frame(false).expect("frame allocation failed");
        assert_eq!(ALLOCATED_FRAMES.load(Ordering::Relaxed), allocated_before + 1);
        drop(frame);
        assert_eq!(ALLOCATED_FRAMES.load(Ordering::Relaxed), allocated_before);
    }
}
