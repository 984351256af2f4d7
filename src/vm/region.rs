// SPDX-License-Identifier: MPL-2.0

//! A mapping of a contiguous virtual range into a slice of a [`Vmo`].
//!
//! A [`Region`] owns its virtual-range reservation in the owning
//! [`PageDirectory`]'s range allocator and shares its backing [`Vmo`] with
//! every other region mapping the same object. It is the arbitration point
//! for page faults: [`Region::handle_fault`] classifies a fault and
//! dispatches to the VMO or the frame allocator as appropriate, then
//! installs the result via the architecture-specific page table.

use alloc::{string::String, sync::Arc};

use log::trace;

use crate::{
    arch::mm::PageTableFlags,
    config::PAGE_SIZE,
    cpu::{self, PageFaultErrorCode},
    prelude::*,
    sync::SpinLock,
    vm::{
        is_page_aligned, page_directory::PageDirectory, range_allocator::VirtualRange, vmo::Vmo,
        FrameKind, Vaddr, VmIo,
    },
    Error,
};

bitflags::bitflags! {
    /// The access rights a region grants over its virtual range.
    #[derive(Clone, Copy)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Advisory tags describing the purpose of a region, carried for
    /// diagnostics; they have no effect on fault handling.
    #[derive(Clone, Copy)]
    pub struct RegionTags: u8 {
        const STACK   = 1 << 0;
        const MMAP    = 1 << 1;
        const SYSCALL = 1 << 2;
    }
}

/// The CPU-reported reason a page fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    /// The faulting page has no translation at all.
    NotPresent,
    /// The faulting page is mapped but the access violates its protection.
    ProtectionViolation,
}

/// A page fault handed to [`Region::handle_fault`].
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub vaddr: Vaddr,
    pub kind: PageFaultKind,
    pub is_write: bool,
    pub is_instruction_fetch: bool,
}

impl PageFault {
    /// Decodes a fault from the raw CPU error code and faulting address.
    pub fn from_error_code(vaddr: Vaddr, error_code: PageFaultErrorCode) -> Self {
        let kind = if error_code.contains(PageFaultErrorCode::PRESENT) {
            PageFaultKind::ProtectionViolation
        } else {
            PageFaultKind::NotPresent
        };
        Self {
            vaddr,
            kind,
            is_write: error_code.contains(PageFaultErrorCode::WRITE),
            is_instruction_fetch: error_code.contains(PageFaultErrorCode::INSTRUCTION),
        }
    }
}

/// The outcome of resolving a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// The fault was resolved; the faulting instruction should be retried.
    Continue,
    /// The fault could not be resolved because physical memory (or commit
    /// reserve) was exhausted. The upper dispatcher decides whether to
    /// retry after reclaiming memory or to kill the process.
    OutOfMemory,
    /// The access was illegal. The faulting thread should be terminated
    /// with a fault signal; the kernel itself continues unaffected.
    ShouldCrash,
}

pub(crate) struct RegionInner {
    range: VirtualRange,
    offset_pages: usize,
    vmo: SpinLock<Vmo>,
    access: SpinLock<Access>,
    /// The region's access rights before a temporary protection change
    /// (e.g. a debugger-driven mprotect); restored by whoever requested the
    /// temporary change. Kept as an explicit field rather than packed bits
    /// (see DESIGN.md Open Question 2).
    original_access: SpinLock<Access>,
    cacheable: bool,
    shared: bool,
    name: Option<String>,
    page_directory: Option<Arc<PageDirectory>>,
    tags: RegionTags,
    is_kernel: bool,
}

impl RegionInner {
    /// The virtual range this region occupies. Used by
    /// [`crate::vm::page_directory::PageDirectory::find_region`] to
    /// dispatch a faulting address without needing a full `Region` handle.
    pub(crate) fn range(&self) -> VirtualRange {
        self.range
    }
}

/// A mapping of a contiguous virtual range into a slice of a [`Vmo`].
pub struct Region(pub(crate) Arc<RegionInner>);

impl Region {
    #[allow(clippy::too_many_arguments)]
    fn try_create(
        page_directory: Option<Arc<PageDirectory>>,
        range: VirtualRange,
        vmo: Vmo,
        offset_pages: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
        shared: bool,
        tags: RegionTags,
        is_kernel: bool,
    ) -> Option<Region> {
        if !is_page_aligned(range.base()) || range.size() == 0 {
            return None;
        }
        let reserved = if let Some(pd) = &page_directory {
            let allocator = if is_kernel {
                pd.identity_range_allocator()
            } else {
                pd.range_allocator()
            };
            allocator.reserve_at(range.base(), range.size()).ok()?
        } else {
            range
        };

        let inner = Arc::new(RegionInner {
            range: reserved,
            offset_pages,
            vmo: SpinLock::new(vmo),
            access: SpinLock::new(access),
            original_access: SpinLock::new(access),
            cacheable,
            shared,
            name,
            page_directory,
            tags,
            is_kernel,
        });
        let region = Region(inner);
        region.0.vmo.lock().register_region(&region);
        if let Some(pd) = &region.0.page_directory {
            pd.register_region(&region);
        }
        Some(region)
    }

    /// Creates a user-accessible region.
    #[allow(clippy::too_many_arguments)]
    pub fn try_create_user(
        page_directory: &Arc<PageDirectory>,
        range: VirtualRange,
        vmo: Vmo,
        offset_pages: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
        shared: bool,
    ) -> Option<Region> {
        Self::try_create(
            Some(page_directory.clone()),
            range,
            vmo,
            offset_pages,
            name,
            access,
            cacheable,
            shared,
            RegionTags::empty(),
            false,
        )
    }

    /// Creates a kernel-only region (`shared = false`, never user-accessible).
    #[allow(clippy::too_many_arguments)]
    pub fn try_create_kernel(
        page_directory: &Arc<PageDirectory>,
        range: VirtualRange,
        vmo: Vmo,
        offset_pages: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
    ) -> Option<Region> {
        Self::try_create(
            Some(page_directory.clone()),
            range,
            vmo,
            offset_pages,
            name,
            access,
            cacheable,
            false,
            RegionTags::empty(),
            true,
        )
    }

    /// Attaches advisory tags (stack/mmap/syscall) to an already-created
    /// region. Intended to be chained right after a `try_create_*` call,
    /// before the `Region` is shared with anything else.
    pub fn tagged(self, tags: RegionTags) -> Self {
        // No other handle to this `Arc` can exist yet at a legitimate call
        // site (the region has not been registered with the caller's
        // address-space registry), so this is the only mutation the
        // `Arc`'s contents will ever see from more than one owner.
        let Region(inner) = self;
        match Arc::try_unwrap(inner) {
            Ok(mut inner) => {
                inner.tags = tags;
                Region(Arc::new(inner))
            }
            Err(inner) => Region(inner),
        }
    }

    pub fn range(&self) -> VirtualRange {
        self.0.range
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn tags(&self) -> RegionTags {
        self.0.tags
    }

    pub fn access(&self) -> Access {
        *self.0.access.lock()
    }

    pub fn is_shared(&self) -> bool {
        self.0.shared
    }

    pub fn page_directory(&self) -> Option<&Arc<PageDirectory>> {
        self.0.page_directory.as_ref()
    }

    /// Temporarily changes the access rights, stashing the original so it
    /// can be restored later.
    pub fn set_temporary_access(&self, new_access: Access) {
        let mut access = self.0.access.lock();
        *self.0.original_access.lock() = *access;
        *access = new_access;
        let _ = self.remap();
    }

    /// Restores the access rights saved by [`Self::set_temporary_access`].
    pub fn restore_access(&self) {
        let original = *self.0.original_access.lock();
        *self.0.access.lock() = original;
        let _ = self.remap();
    }

    /// Replaces the backing VMO, deregistering from the old one and
    /// registering with the new one. A no-op if the two are the same
    /// object.
    pub fn set_vmobject(&self, new_vmo: Vmo) {
        let mut vmo_slot = self.0.vmo.lock();
        if vmo_slot.is_same_object(&new_vmo) {
            return;
        }
        vmo_slot.unregister_region(self);
        new_vmo.register_region(self);
        *vmo_slot = new_vmo;
    }

    fn npages(&self) -> usize {
        self.0.range.npages()
    }

    fn vmo(&self) -> Vmo {
        self.0.vmo.lock().clone()
    }

    /// Installs every page of the region. Establishes the region's
    /// ownership of its virtual range in the page table. On a mid-sequence
    /// failure, flushes up to the failed index and reports the failure;
    /// the caller is responsible for tearing the region down.
    pub fn map(&self) -> Result<()> {
        for page_idx in 0..self.npages() {
            if !self.map_individual_page(page_idx) {
                if let Some(pd) = &self.0.page_directory {
                    pd.flush_tlb(self.0.range.base(), page_idx + 1);
                }
                return Err(Error::NoMemory);
            }
        }
        if let Some(pd) = &self.0.page_directory {
            pd.flush_tlb(self.0.range.base(), self.npages());
        }
        Ok(())
    }

    /// Re-installs all pages using the current VMO slots and access bits.
    /// Used after a CoW fault clears a bit, a temporary protection change,
    /// or a clone's parent-side remap.
    pub fn remap(&self) -> Result<()> {
        self.map()
    }

    /// Clears every PTE in the region, flushes the TLB once across the
    /// whole range, and optionally releases the virtual range back to the
    /// owning page directory's allocator.
    pub fn unmap(&self, deallocate_range: bool) {
        let Some(pd) = &self.0.page_directory else {
            return;
        };
        for page_idx in 0..self.npages() {
            let vaddr = self.0.range.base() + page_idx * PAGE_SIZE;
            pd.clear_mapping(vaddr);
        }
        pd.flush_tlb(self.0.range.base(), self.npages());
        if deallocate_range {
            let allocator = if self.0.is_kernel {
                pd.identity_range_allocator()
            } else {
                pd.range_allocator()
            };
            allocator.release(self.0.range);
        }
    }

    /// Installs the PTE for a single page of the region, consulting the
    /// VMO slot and the region's access bits.
    ///
    /// Returns `false` if the page table could not be updated (e.g. out of
    /// memory for a new page-table level); `true` otherwise, including the
    /// case where the page is intentionally left unmapped (absent slot, a
    /// lazy-committed sentinel, or a region with neither read nor write
    /// access).
    pub(crate) fn map_individual_page(&self, page_idx: usize) -> bool {
        let Some(pd) = &self.0.page_directory else {
            return true;
        };
        let vaddr = self.0.range.base() + page_idx * PAGE_SIZE;
        let vmo = self.vmo();
        let access = self.access();
        let slot_page = self.0.offset_pages + page_idx;

        let Some(frame) = vmo.slot(slot_page) else {
            pd.clear_mapping(vaddr);
            return true;
        };
        if !access.intersects(Access::READ | Access::WRITE) {
            pd.clear_mapping(vaddr);
            return true;
        }
        // A `LazyCommitted` slot has no real physical address: the only
        // legal transition out of it is through a not-present fault, never
        // through a direct PTE install.
        if frame.kind() == FrameKind::LazyCommitted {
            pd.clear_mapping(vaddr);
            return true;
        }

        let is_sentinel = frame.kind() != FrameKind::Normal;
        let cow_set = vmo.should_cow(slot_page, self.0.shared);
        let writable = access.contains(Access::WRITE) && !is_sentinel && !cow_set;
        let executable = access.contains(Access::EXECUTE) && cpu::has_nx_support();

        let mut flags = PageTableFlags::PRESENT;
        flags.set(PageTableFlags::WRITABLE, writable);
        flags.set(PageTableFlags::NO_CACHE, !self.0.cacheable);
        flags.set(PageTableFlags::NO_EXECUTE, !executable);
        flags.set(
            PageTableFlags::USER,
            !self.0.is_kernel && crate::arch::mm::is_user_vaddr(vaddr),
        );

        pd.set_mapping(vaddr, frame.start_paddr(), flags);
        true
    }

    /// For every region sharing `vmo` at `page_idx`, re-installs that
    /// page's PTE. Returns `false` if any sub-map failed.
    pub(crate) fn remap_vmobject_page(vmo: &Vmo, page_idx: usize) -> bool {
        let mut all_ok = true;
        vmo.for_each_region(|region| {
            if !region.map_individual_page(page_idx) {
                all_ok = false;
            }
        });
        all_ok
    }

    /// The arbitration point for a page fault landing in this region.
    pub fn handle_fault(&self, fault: PageFault) -> PageFaultResponse {
        let access = self.access();
        let page_idx = (fault.vaddr - self.0.range.base()) / PAGE_SIZE;
        let slot_page = self.0.offset_pages + page_idx;
        let vmo = self.vmo();

        match fault.kind {
            PageFaultKind::NotPresent => {
                if fault.is_write && !access.contains(Access::WRITE) {
                    return PageFaultResponse::ShouldCrash;
                }
                if !fault.is_write
                    && !fault.is_instruction_fetch
                    && !access.contains(Access::READ)
                {
                    return PageFaultResponse::ShouldCrash;
                }

                if vmo.is_inode_backed() {
                    return vmo.handle_inode_fault(slot_page, self);
                }
                let Some(frame) = vmo.slot(slot_page) else {
                    trace!("Region: bug, not-present fault on an empty slot");
                    return PageFaultResponse::ShouldCrash;
                };
                if frame.kind() == FrameKind::LazyCommitted {
                    return self.handle_zero_fault(page_idx);
                }
                trace!("Region: bug, not-present fault on a materialized slot");
                PageFaultResponse::ShouldCrash
            }
            PageFaultKind::ProtectionViolation => {
                if !(fault.is_write && access.contains(Access::WRITE)) {
                    return PageFaultResponse::ShouldCrash;
                }
                if !vmo.should_cow(slot_page, self.0.shared) {
                    return PageFaultResponse::ShouldCrash;
                }
                let Some(frame) = vmo.slot(slot_page) else {
                    return PageFaultResponse::ShouldCrash;
                };
                if frame.kind() != FrameKind::Normal {
                    self.handle_zero_fault(page_idx)
                } else {
                    vmo.handle_cow_fault(slot_page, fault.vaddr, self)
                }
            }
        }
    }

    /// Resolves the first write to a zero/lazy-committed page.
    pub(crate) fn handle_zero_fault(&self, page_idx: usize) -> PageFaultResponse {
        let slot_page = self.0.offset_pages + page_idx;
        let vmo = self.vmo();

        let Some(frame) = vmo.slot(slot_page) else {
            trace!("Region: bug, zero fault on an empty slot");
            return PageFaultResponse::ShouldCrash;
        };

        // Another thread may have already raced us and materialized the
        // slot; re-map and continue idempotently rather than allocating
        // twice.
        if frame.kind() == FrameKind::Normal {
            return if Region::remap_vmobject_page(&vmo, page_idx) {
                PageFaultResponse::Continue
            } else {
                PageFaultResponse::OutOfMemory
            };
        }

        // `LazyCommitted` has an outstanding commit-reserve charge to
        // redeem; every other sentinel (`SharedZero`) was never charged
        // against the reserve and must be materialized as a plain
        // allocation instead, or `allocate_committed_frame` would
        // underflow the reserve and panic.
        let result = if frame.kind() == FrameKind::LazyCommitted {
            vmo.allocate_committed_page_for(slot_page)
        } else {
            vmo.allocate_user_page_for(slot_page)
        };

        match result {
            Ok(()) => {
                if Region::remap_vmobject_page(&vmo, page_idx) {
                    PageFaultResponse::Continue
                } else {
                    PageFaultResponse::OutOfMemory
                }
            }
            Err(Error::NoMemory) => PageFaultResponse::OutOfMemory,
            Err(_) => PageFaultResponse::ShouldCrash,
        }
    }

    /// Forks this region into `new_page_directory`. Shared regions alias
    /// the same VMO in the new region; private regions clone the VMO
    /// (anonymous VMOs diverge via CoW, private-inode VMOs deep-copy slot
    /// refs and CoW like anonymous clones). This region is remapped first
    /// so the child observes the cleared write bits the clone may have
    /// set.
    pub fn clone(&self, new_page_directory: &Arc<PageDirectory>) -> Option<Region> {
        let vmo = self.vmo();
        let child_vmo = if self.0.shared {
            vmo
        } else {
            let cloned = vmo.try_clone()?;
            let _ = self.remap();
            cloned
        };

        Region::try_create(
            Some(new_page_directory.clone()),
            self.0.range,
            child_vmo,
            self.0.offset_pages,
            self.0.name.clone(),
            *self.0.access.lock(),
            self.0.cacheable,
            self.0.shared,
            self.0.tags,
            self.0.is_kernel,
        )
    }

    /// Sum of `PAGE_SIZE` over slots that are `Normal` and not
    /// lazy-committed.
    pub fn amount_resident(&self) -> usize {
        let vmo = self.vmo();
        (0..self.npages())
            .filter(|&i| {
                vmo.slot(self.0.offset_pages + i)
                    .is_some_and(|f| f.kind() == FrameKind::Normal)
            })
            .count()
            * PAGE_SIZE
    }

    /// As [`Self::amount_resident`], but only for frames shared with at
    /// least one other handle.
    pub fn amount_shared(&self) -> usize {
        let vmo = self.vmo();
        (0..self.npages())
            .filter(|&i| {
                let slot_page = self.0.offset_pages + i;
                vmo.slot(slot_page).is_some_and(|f| f.kind() == FrameKind::Normal)
                    && vmo.slot_ref_count(slot_page).is_some_and(|c| c > 1)
            })
            .count()
            * PAGE_SIZE
    }

    /// Number of pages in this region still marked copy-on-write.
    pub fn cow_pages(&self) -> usize {
        let vmo = self.vmo();
        (0..self.npages())
            .filter(|&i| vmo.should_cow(self.0.offset_pages + i, self.0.shared))
            .count()
    }
}

/// Reads and writes within the region's virtual range by byte offset,
/// without going through page-fault delivery. `offset` is relative to the
/// start of the region, not to the backing VMO's own offset.
impl VmIo for Region {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let fits = offset.checked_add(buf.len()).map(|end| end <= self.0.range.size());
        if fits != Some(true) {
            return Err(Error::InvalidArgs);
        }
        let vmo_offset = self.0.offset_pages * PAGE_SIZE + offset;
        self.vmo().read_bytes(vmo_offset, buf)
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let fits = offset.checked_add(buf.len()).map(|end| end <= self.0.range.size());
        if fits != Some(true) {
            return Err(Error::InvalidArgs);
        }
        let vmo_offset = self.0.offset_pages * PAGE_SIZE + offset;
        self.vmo().write_bytes(vmo_offset, buf)
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        self.vmo.lock().unregister_region_inner(self as *const _);
        if let Some(pd) = &self.page_directory {
            pd.unregister_region_inner(self as *const _);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::vmo::{anonymous::CreationStrategy, AnonymousVmo};
    use crate::vm::{PhysicalFrame, VmReader, VmWriter};

    fn fresh_pd() -> Arc<PageDirectory> {
        PageDirectory::new((0x1000_0000, 0x2000_0000), (0x2000_0000, 0x3000_0000))
    }

    fn not_present(vaddr: Vaddr, is_write: bool) -> PageFault {
        PageFault {
            vaddr,
            kind: PageFaultKind::NotPresent,
            is_write,
            is_instruction_fetch: false,
        }
    }

    fn protection_violation(vaddr: Vaddr, is_write: bool) -> PageFault {
        PageFault {
            vaddr,
            kind: PageFaultKind::ProtectionViolation,
            is_write,
            is_instruction_fetch: false,
        }
    }

    /// S1: a `Reserve`-strategy region's first write fault allocates a
    /// committed frame for exactly the touched page.
    #[ktest::ktest]
    fn lazy_commit_fault_resolves_and_is_resident() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(3 * PAGE_SIZE, CreationStrategy::Reserve).unwrap();
        let base = pd.range_allocator().reserve(3 * PAGE_SIZE).unwrap().base();
        let region = Region::try_create_user(
            &pd,
            VirtualRange::new(base, 3 * PAGE_SIZE),
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();
        region.map().unwrap();

        let resp = region.handle_fault(not_present(base, true));
        assert_eq!(resp, PageFaultResponse::Continue);
        assert_eq!(region.amount_resident(), PAGE_SIZE);

        // The second and third pages are untouched and still lazily committed.
        let vmo = region.vmo();
        assert_eq!(vmo.slot(1).unwrap().kind(), FrameKind::LazyCommitted);
        assert_eq!(vmo.slot(2).unwrap().kind(), FrameKind::LazyCommitted);
    }

    /// A read or write fault against a region with insufficient access
    /// rights always crashes the faulter, never resolves.
    #[ktest::ktest]
    fn fault_on_non_writable_region_crashes() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let base = pd.range_allocator().reserve(PAGE_SIZE).unwrap().base();
        let region = Region::try_create_user(
            &pd,
            VirtualRange::new(base, PAGE_SIZE),
            vmo.into(),
            0,
            None,
            Access::READ,
            true,
            false,
        )
        .unwrap();
        region.map().unwrap();

        let resp = region.handle_fault(not_present(base, true));
        assert_eq!(resp, PageFaultResponse::ShouldCrash);
    }

    /// S2: fork + CoW. Writing through the child never disturbs the
    /// parent's frame, and vice versa; each side ends up with its own
    /// exclusively-owned frame after both have written.
    #[ktest::ktest]
    fn fork_then_write_is_copy_on_write() {
        let parent_pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let seed = [0x5Au8];
        let mut seed_reader = VmReader::from(&seed[..]);
        vmo.slot(0).unwrap().writer().write(&mut seed_reader);

        let base = parent_pd.range_allocator().reserve(PAGE_SIZE).unwrap().base();
        let parent_region = Region::try_create_user(
            &parent_pd,
            VirtualRange::new(base, PAGE_SIZE),
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();
        parent_region.map().unwrap();

        let child_pd = fresh_pd();
        let child_region = parent_region.clone(&child_pd).unwrap();
        child_region.map().unwrap();

        assert_eq!(parent_region.cow_pages(), 1);
        assert_eq!(child_region.cow_pages(), 1);

        let resp = child_region.handle_fault(protection_violation(base, true));
        assert_eq!(resp, PageFaultResponse::Continue);

        // Measure the true reference count before taking any owned clones
        // of our own, which would otherwise inflate the count by one.
        assert_eq!(parent_region.vmo().slot_ref_count(0), Some(1));
        assert_eq!(child_region.vmo().slot_ref_count(0), Some(1));

        let child_frame = child_region_slot(&child_region);
        let parent_frame = parent_region_slot(&parent_region);
        assert_ne!(parent_frame, child_frame);

        // Diverge: the child writes a new byte, which must not reach the
        // parent's copy.
        let update = [0xA5u8];
        let mut update_reader = VmReader::from(&update[..]);
        child_frame.writer().write(&mut update_reader);

        let mut parent_byte = [0u8; 1];
        let mut parent_writer: VmWriter<'_> = (&mut parent_byte[..]).into();
        parent_frame.reader().read(&mut parent_writer);
        assert_eq!(parent_byte[0], 0x5A);

        let mut child_byte = [0u8; 1];
        let mut child_writer: VmWriter<'_> = (&mut child_byte[..]).into();
        child_frame.reader().read(&mut child_writer);
        assert_eq!(child_byte[0], 0xA5);
    }

    /// A write fault against a still-`SharedZero` slot (no commit
    /// reservation was ever made for it, unlike `LazyCommitted`) must
    /// resolve through a plain allocation rather than panic the commit
    /// reserve.
    #[ktest::ktest]
    fn write_fault_on_shared_zero_slot_does_not_panic() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::None).unwrap();
        assert_eq!(vmo.slot(0).unwrap().kind(), FrameKind::SharedZero);

        let base = pd.range_allocator().reserve(PAGE_SIZE).unwrap().base();
        let region = Region::try_create_user(
            &pd,
            VirtualRange::new(base, PAGE_SIZE),
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();
        region.map().unwrap();

        let resp = region.handle_fault(protection_violation(base, true));
        assert_eq!(resp, PageFaultResponse::Continue);
        assert_eq!(region.vmo().slot(0).unwrap().kind(), FrameKind::Normal);
    }

    #[ktest::ktest]
    fn vm_io_read_write_stays_within_the_region() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let base = pd.range_allocator().reserve(PAGE_SIZE).unwrap().base();
        let region = Region::try_create_user(
            &pd,
            VirtualRange::new(base, PAGE_SIZE),
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();

        region.write_bytes(4, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        region.read_bytes(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        // A read or write that would spill past the region's own range is
        // rejected, even though the backing VMO might have more pages.
        assert!(region.read_bytes(PAGE_SIZE - 1, &mut [0u8; 4]).is_err());
    }

    fn parent_region_slot(region: &Region) -> PhysicalFrame {
        region.vmo().slot(0).unwrap()
    }

    fn child_region_slot(region: &Region) -> PhysicalFrame {
        region.vmo().slot(0).unwrap()
    }
}
