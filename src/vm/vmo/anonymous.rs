// SPDX-License-Identifier: MPL-2.0

//! Anonymous memory: process-private pages with no backing file, covering
//! plain `mmap(MAP_ANONYMOUS)` allocations, program stacks, and purgeable
//! (volatile) caches.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    config::PAGE_SIZE,
    prelude::*,
    sync::SpinLock,
    vm::{
        frame_allocator,
        region::{PageFaultResponse, Region},
        vmo::core::{CommittedCowPages, VmoCore},
        FrameKind, PhysicalFrame, Vaddr,
    },
    Error,
};

/// How eagerly an [`AnonymousVmo`] materializes its backing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStrategy {
    /// All slots start as [`FrameKind::LazyCommitted`] placeholders; the
    /// global commit reserve is charged up front but no frame is actually
    /// allocated until the first write fault.
    Reserve,
    /// Every slot is materialized with a real, zeroed frame immediately.
    AllocateNow,
    /// Slots start empty (no commit charge at all). Used for regions that
    /// will be populated out-of-band, e.g. a kernel region over frames
    /// already owned elsewhere.
    None,
}

/// A `[start_page, end_page)` span a user has declared purgeable: while
/// `volatile`, its pages may be silently reclaimed by
/// [`AnonymousVmo::purge`].
#[derive(Debug, Clone, Copy)]
struct PurgeableRange {
    start_page: usize,
    end_page: usize,
    volatile: bool,
    /// Set by [`AnonymousVmo::purge`] the first time this range is actually
    /// reclaimed; sticky until the range transitions back to non-volatile.
    was_purged: bool,
}

impl PurgeableRange {
    fn contains_page(&self, page: usize) -> bool {
        (self.start_page..self.end_page).contains(&page)
    }
}

/// Anonymous process memory: the VMO flavor backing `mmap(MAP_ANONYMOUS)`,
/// process stacks, and the kernel's own heap-like allocations.
pub struct AnonymousVmo {
    core: VmoCore,
    /// Number of slots still carrying an uncollected commit-reserve charge
    /// (i.e. still `LazyCommitted`). Tracked separately from the global
    /// counter so [`Self::purge`] can re-commit exactly what it frees.
    uncommitted_lazy_pages: AtomicUsize,
    purgeable_ranges: SpinLock<Vec<PurgeableRange>>,
}

impl AnonymousVmo {
    /// Creates a new anonymous VMO of `size` bytes (rounded down to whole
    /// pages by the caller) using `strategy` to decide how eagerly to
    /// materialize its slots.
    pub fn create_with_size(size: usize, strategy: CreationStrategy) -> Result<Arc<Self>> {
        let npages = size / PAGE_SIZE;
        if npages == 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let mut slots = Vec::with_capacity(npages);
        match strategy {
            CreationStrategy::Reserve => {
                frame_allocator::commit(npages)?;
                for _ in 0..npages {
                    slots.push(frame_allocator::lazy_committed_frame());
                }
            }
            CreationStrategy::AllocateNow => {
                for _ in 0..npages {
                    slots.push(
                        frame_allocator::allocate_user_frame(true).ok_or(Error::NoMemory)?,
                    );
                }
            }
            CreationStrategy::None => {
                for _ in 0..npages {
                    slots.push(frame_allocator::shared_zero_frame());
                }
            }
        }
        Ok(Arc::new(Self {
            core: VmoCore::new(slots),
            uncommitted_lazy_pages: AtomicUsize::new(if strategy == CreationStrategy::Reserve {
                npages
            } else {
                0
            }),
            purgeable_ranges: SpinLock::new(Vec::new()),
        }))
    }

    /// Creates an anonymous VMO directly over an already-allocated set of
    /// frames, e.g. to wrap a contiguous DMA buffer as mappable memory.
    pub fn create_with_frames(frames: Vec<PhysicalFrame>) -> Arc<Self> {
        Arc::new(Self {
            core: VmoCore::new(frames),
            uncommitted_lazy_pages: AtomicUsize::new(0),
            purgeable_ranges: SpinLock::new(Vec::new()),
        })
    }

    pub(super) fn core(&self) -> &VmoCore {
        &self.core
    }

    pub fn page_count(&self) -> usize {
        self.core.page_count()
    }

    pub fn slot(&self, page_idx: usize) -> Option<PhysicalFrame> {
        self.core.slot(page_idx)
    }

    /// The reference count of the frame at `page_idx`, read without
    /// cloning it, so the count this call's own handle would otherwise add
    /// never inflates the result.
    pub fn slot_ref_count(&self, page_idx: usize) -> Option<usize> {
        self.core.slot_ref_count(page_idx)
    }

    pub fn should_cow(&self, page_idx: usize, is_shared: bool) -> bool {
        self.core.should_cow(page_idx, is_shared)
    }

    pub(super) fn register_region(&self, region: &Region) {
        self.core.register_region(region)
    }

    pub(super) fn unregister_region(&self, region: &Region) {
        self.core.unregister_region(region)
    }

    pub(super) fn unregister_region_inner(&self, ptr: *const crate::vm::region::RegionInner) {
        self.core.unregister_region_inner(ptr)
    }

    pub(super) fn for_each_region(&self, f: impl FnMut(&Region)) {
        self.core.for_each_region(f)
    }

    fn is_volatile(&self, page_idx: usize) -> bool {
        self.purgeable_ranges
            .lock()
            .iter()
            .any(|r| r.contains_page(page_idx) && r.volatile)
    }

    /// Resolves the first not-present fault against a `LazyCommitted` slot:
    /// materializes a zeroed frame and debits the commit-reserve tracking.
    pub fn allocate_committed_page_for(&self, page_idx: usize) -> Result<()> {
        let frame = frame_allocator::allocate_committed_frame(true);
        self.core.set_slot(page_idx, frame);
        self.uncommitted_lazy_pages.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Resolves a write fault against a slot that carries no commit
    /// reservation (e.g. `SharedZero`, never lazily committed): allocates a
    /// fresh zeroed frame directly from the free pool instead of debiting
    /// the commit reserve.
    pub fn allocate_user_page_for(&self, page_idx: usize) -> Result<()> {
        let frame = frame_allocator::allocate_user_frame(true).ok_or(Error::NoMemory)?;
        self.core.set_slot(page_idx, frame);
        Ok(())
    }

    /// Resolves a CoW write fault, dispatching to the shared four-case
    /// state machine in [`VmoCore::handle_cow_fault`].
    pub fn handle_cow_fault(
        &self,
        vmo: &super::Vmo,
        page_idx: usize,
        vaddr: Vaddr,
    ) -> PageFaultResponse {
        self.core
            .handle_cow_fault(vmo, page_idx, vaddr, |p| self.is_volatile(p))
    }

    /// Forks this VMO: every non-volatile slot is marked CoW on both sides
    /// and a shared [`CommittedCowPages`] pool is created sized to the
    /// number of pages that might actually need duplicating (purgeable
    /// volatile pages are excluded since their content is disposable and
    /// never needs preserving across the fork).
    pub fn try_clone(&self) -> Result<Arc<Self>> {
        let slots = self.core.clone_slots();
        let npages = slots.len();
        let need = (0..npages).filter(|&p| !self.is_volatile(p)).count();

        frame_allocator::commit(need)?;
        let pool = CommittedCowPages::new(need);

        self.core.mark_fully_cow();
        self.core.set_committed_cow_pages(Some(pool.clone()));

        let child_core = VmoCore::new(slots);
        child_core.mark_fully_cow();
        child_core.set_committed_cow_pages(Some(pool));

        Ok(Arc::new(Self {
            core: child_core,
            uncommitted_lazy_pages: AtomicUsize::new(
                self.uncommitted_lazy_pages.load(Ordering::Acquire),
            ),
            purgeable_ranges: SpinLock::new(self.purgeable_ranges.lock().clone()),
        }))
    }

    pub fn amount_resident(&self) -> usize {
        (0..self.page_count())
            .filter(|&i| self.slot(i).is_some_and(|f| f.kind() == FrameKind::Normal))
            .count()
            * PAGE_SIZE
    }

    /// Registers `[start_page, end_page)` as a user-controllable volatility
    /// set, initially non-volatile (held).
    pub fn register_purgeable_range(&self, start_page: usize, end_page: usize) {
        let mut ranges = self.purgeable_ranges.lock();
        ranges.push(PurgeableRange {
            start_page,
            end_page,
            volatile: false,
            was_purged: false,
        });
    }

    /// Drops a previously registered purgeable range. Has no effect on the
    /// slots themselves; it only stops tracking the range's volatility.
    pub fn unregister_purgeable_range(&self, start_page: usize, end_page: usize) {
        self.purgeable_ranges
            .lock()
            .retain(|r| !(r.start_page == start_page && r.end_page == end_page));
    }

    /// Transitions a registered range to volatile. Every `LazyCommitted`
    /// slot still inside the range is demoted to the shared-zero sentinel
    /// and its commit charge released, since a volatile page's content is
    /// disposable and no longer needs a guaranteed backing frame.
    pub fn mark_volatile(&self, start_page: usize, end_page: usize) {
        let mut ranges = self.purgeable_ranges.lock();
        let Some(r) = ranges
            .iter_mut()
            .find(|r| r.start_page == start_page && r.end_page == end_page)
        else {
            return;
        };
        if r.volatile {
            return;
        }
        r.volatile = true;
        drop(ranges);

        let mut freed = 0usize;
        for page in start_page..end_page {
            if self.slot(page).is_some_and(|f| f.kind() == FrameKind::LazyCommitted) {
                self.core.set_slot(page, frame_allocator::shared_zero_frame());
                freed += 1;
            }
        }
        if freed > 0 {
            self.uncommitted_lazy_pages.fetch_sub(freed, Ordering::AcqRel);
            frame_allocator::uncommit(freed);
        }
    }

    /// Transitions a registered range back to non-volatile. Counts every
    /// `SharedZero`, non-CoW slot in the range and attempts to commit that
    /// many pages; on success those slots become `LazyCommitted` again. The
    /// transition is all-or-nothing: if the commit cannot cover every slot,
    /// nothing in the range is changed and an error is returned.
    pub fn mark_non_volatile(&self, start_page: usize, end_page: usize) -> Result<()> {
        let eligible = |p: usize| {
            self.slot(p).is_some_and(|f| f.kind() == FrameKind::SharedZero) && !self.core.cow_bit_set(p)
        };
        let needed = (start_page..end_page).filter(|&p| eligible(p)).count();

        frame_allocator::commit(needed)?;

        for page in start_page..end_page {
            if eligible(page) {
                self.core.set_slot(page, frame_allocator::lazy_committed_frame());
            }
        }
        self.uncommitted_lazy_pages.fetch_add(needed, Ordering::AcqRel);

        let mut ranges = self.purgeable_ranges.lock();
        if let Some(r) = ranges
            .iter_mut()
            .find(|r| r.start_page == start_page && r.end_page == end_page)
        {
            r.volatile = false;
            r.was_purged = false;
        }
        Ok(())
    }

    /// Whether the purgeable range `[start_page, end_page)` was reclaimed
    /// by [`Self::purge`] since it was last marked non-volatile.
    pub fn was_purged(&self, start_page: usize, end_page: usize) -> bool {
        self.purgeable_ranges
            .lock()
            .iter()
            .find(|r| r.start_page == start_page && r.end_page == end_page)
            .is_some_and(|r| r.was_purged)
    }

    /// Reclaims every page in every currently-volatile purgeable range:
    /// replaces its slot with the shared-zero frame and clears its CoW bit,
    /// then remaps every mapping region so the next access takes a fresh
    /// not-present fault. Returns the number of pages actually reclaimed.
    pub fn purge(self: &Arc<Self>, vmo: &super::Vmo) -> usize {
        let mut ranges = self.purgeable_ranges.lock();
        let volatile_pages: Vec<usize> = ranges
            .iter_mut()
            .filter(|r| r.volatile)
            .flat_map(|r| {
                r.was_purged = true;
                r.start_page..r.end_page
            })
            .collect();
        drop(ranges);

        let mut purged = 0;
        for page in volatile_pages {
            if let Some(frame) = self.slot(page) {
                if frame.kind() == FrameKind::Normal {
                    self.core.set_slot(page, frame_allocator::shared_zero_frame());
                    self.core.set_should_cow(page, false);
                    Region::remap_vmobject_page(vmo, page);
                    purged += 1;
                }
            }
        }
        purged
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::vmo::Vmo;

    #[ktest::ktest]
    fn reserve_strategy_starts_all_lazy() {
        let vmo = AnonymousVmo::create_with_size(3 * PAGE_SIZE, CreationStrategy::Reserve).unwrap();
        assert_eq!(vmo.page_count(), 3);
        assert_eq!(vmo.amount_resident(), 0);
        for i in 0..3 {
            assert_eq!(vmo.slot(i).unwrap().kind(), FrameKind::LazyCommitted);
        }
    }

    #[ktest::ktest]
    fn allocate_now_strategy_is_resident_immediately() {
        let vmo = AnonymousVmo::create_with_size(2 * PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        assert_eq!(vmo.amount_resident(), 2 * PAGE_SIZE);
    }

    #[ktest::ktest]
    fn none_strategy_starts_all_shared_zero() {
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::None).unwrap();
        assert_eq!(vmo.slot(0).unwrap().kind(), FrameKind::SharedZero);
        assert_eq!(vmo.amount_resident(), 0);
    }

    /// S1: first write to a `Reserve`-strategy page allocates a committed
    /// frame and decrements the lazy-page count, leaving the other pages
    /// untouched.
    #[ktest::ktest]
    fn lazy_commit_fault_materializes_exactly_one_page() {
        let vmo = AnonymousVmo::create_with_size(3 * PAGE_SIZE, CreationStrategy::Reserve).unwrap();
        vmo.allocate_committed_page_for(0).unwrap();
        assert_eq!(vmo.slot(0).unwrap().kind(), FrameKind::Normal);
        assert_eq!(vmo.slot(1).unwrap().kind(), FrameKind::LazyCommitted);
        assert_eq!(vmo.amount_resident(), PAGE_SIZE);
    }

    /// S2 (partial): forking an `AllocateNow` VMO marks every page CoW on
    /// both sides and leaves every slot shared (refcount 2).
    #[ktest::ktest]
    fn clone_shares_frames_and_marks_cow() {
        let parent = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let child = parent.try_clone().unwrap();

        assert!(parent.should_cow(0, false));
        assert!(child.should_cow(0, false));
        assert_eq!(parent.slot_ref_count(0), Some(2));
        assert_eq!(parent.slot(0).unwrap(), child.slot(0).unwrap());
    }

    /// S6 (construction variant): a `Reserve` creation whose size could
    /// never be committed fails cleanly and allocates nothing, the same
    /// "commit first, construct only on success" discipline `try_clone`
    /// relies on for its own OOM case.
    #[ktest::ktest]
    fn reserve_strategy_fails_cleanly_when_commit_is_unsatisfiable() {
        let absurd_size = (usize::MAX / PAGE_SIZE) * PAGE_SIZE;
        assert!(AnonymousVmo::create_with_size(absurd_size, CreationStrategy::Reserve).is_err());
    }

    /// S3: allocate-touch-purge-reclaim-recommit round trip.
    #[ktest::ktest]
    fn purge_reclaims_volatile_pages_and_non_volatile_recommits() {
        let vmo = AnonymousVmo::create_with_size(4 * PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        assert_eq!(vmo.amount_resident(), 4 * PAGE_SIZE);

        vmo.register_purgeable_range(0, 4);
        vmo.mark_volatile(0, 4);

        let wrapped = Vmo::Anonymous(vmo.clone());
        let purged = vmo.purge(&wrapped);
        assert_eq!(purged, 4);
        for i in 0..4 {
            assert_eq!(vmo.slot(i).unwrap().kind(), FrameKind::SharedZero);
        }
        assert!(vmo.was_purged(0, 4));

        vmo.mark_non_volatile(0, 4).expect("commit should succeed");
        for i in 0..4 {
            assert_eq!(vmo.slot(i).unwrap().kind(), FrameKind::LazyCommitted);
        }
        assert!(!vmo.was_purged(0, 4));

        // Touching a page after the round trip allocates a fresh committed
        // frame, same as the original `Reserve` path.
        vmo.allocate_committed_page_for(0).unwrap();
        assert_eq!(vmo.slot(0).unwrap().kind(), FrameKind::Normal);
    }

    #[ktest::ktest]
    fn mark_volatile_releases_lazy_commit_charge() {
        let vmo = AnonymousVmo::create_with_size(2 * PAGE_SIZE, CreationStrategy::Reserve).unwrap();
        vmo.register_purgeable_range(0, 2);
        vmo.mark_volatile(0, 2);
        for i in 0..2 {
            assert_eq!(vmo.slot(i).unwrap().kind(), FrameKind::SharedZero);
        }
    }
}
