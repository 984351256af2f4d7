// SPDX-License-Identifier: MPL-2.0

//! One address space's page table plus the two range allocators ([`Region`]s
//! carve their virtual ranges out of) and the weak region registry the fault
//! dispatcher in [`super::mm`] uses to find which region owns a faulting
//! address.

use alloc::{sync::Weak, vec::Vec};

use crate::{
    arch::mm::{tlb_flush, PageTableEntry, PageTableFlags},
    config::PAGE_SIZE,
    prelude::*,
    sync::SpinLock,
    vm::{
        page_table::{AddressWidth, PageTable, PageTableConfig, UserMode},
        range_allocator::RangeAllocator,
        region::{Region, RegionInner},
        Paddr, Vaddr,
    },
};

/// One address space: a user page table plus the allocators that hand out
/// virtual ranges within it.
///
/// Two independent range allocators are kept because user mappings
/// (`mmap`, the stack, ...) and kernel "identity" regions installed into
/// this address space (e.g. a kernel worker's view of a user buffer) must
/// never be carved from the same free list — the two belong to mutually
/// exclusive parts of the canonical address space split.
pub struct PageDirectory {
    table: SpinLock<PageTable<PageTableEntry, UserMode>>,
    user_range_allocator: RangeAllocator,
    identity_range_allocator: RangeAllocator,
    regions: SpinLock<Vec<Weak<RegionInner>>>,
}

impl PageDirectory {
    /// Creates a fresh, empty address space with `user_range` given to
    /// ordinary user mappings and `identity_range` reserved for
    /// kernel-installed regions within this address space.
    pub fn new(user_range: (Vaddr, Vaddr), identity_range: (Vaddr, Vaddr)) -> Arc<Self> {
        Arc::new(Self {
            table: SpinLock::new(PageTable::new(PageTableConfig {
                address_width: AddressWidth::Level4,
            })),
            user_range_allocator: RangeAllocator::new(user_range.0, user_range.1),
            identity_range_allocator: RangeAllocator::new(identity_range.0, identity_range.1),
            regions: SpinLock::new(Vec::new()),
        })
    }

    pub fn range_allocator(&self) -> &RangeAllocator {
        &self.user_range_allocator
    }

    pub fn identity_range_allocator(&self) -> &RangeAllocator {
        &self.identity_range_allocator
    }

    pub fn root_paddr(&self) -> Paddr {
        self.table.lock().root_paddr()
    }

    /// Installs this address space's page table as the one the CPU
    /// translates through.
    ///
    /// # Safety
    ///
    /// The caller must ensure no code path currently executing depends on
    /// mappings that exist only in the previously active table.
    pub unsafe fn activate(&self) {
        #[cfg(target_arch = "x86_64")]
        crate::arch::mm::activate_page_table(
            self.root_paddr(),
            x86_64::registers::control::Cr3Flags::empty(),
        );
    }

    pub(crate) fn set_mapping(&self, vaddr: Vaddr, paddr: Paddr, flags: PageTableFlags) {
        // Safety: `Region` is the sole caller and guarantees `vaddr` falls
        // within a range it holds a live reservation for, backed by
        // `paddr` for as long as the mapping exists.
        unsafe { self.table.lock().set_mapping(vaddr, paddr, flags) };
    }

    pub(crate) fn clear_mapping(&self, vaddr: Vaddr) {
        // Safety: clearing a mapping is sound regardless of whether one was
        // present.
        unsafe { self.table.lock().clear_mapping(vaddr) };
    }

    /// Flushes the TLB for every page in `[base, base + npages * PAGE_SIZE)`
    /// on the current CPU. `set_mapping`/`clear_mapping` already flush the
    /// single page they touch; callers that just finished a multi-page
    /// sequence call this once more as a cheap belt-and-suspenders pass
    /// covering any page a concurrent `remap` raced in between.
    pub fn flush_tlb(&self, base: Vaddr, npages: usize) {
        for i in 0..npages {
            tlb_flush(base + i * PAGE_SIZE);
        }
    }

    pub(crate) fn register_region(&self, region: &Region) {
        let mut regions = self.regions.lock();
        regions.retain(|w| w.strong_count() > 0);
        regions.push(Arc::downgrade(&region.0));
    }

    pub(crate) fn unregister_region_inner(&self, ptr: *const RegionInner) {
        let mut regions = self.regions.lock();
        regions.retain(|w| w.as_ptr() != ptr);
    }

    /// Finds the region whose virtual range contains `vaddr`, if any.
    /// Used by [`super::mm::handle_page_fault`] to dispatch a raw faulting
    /// address to the [`Region`] responsible for resolving it.
    pub fn find_region(&self, vaddr: Vaddr) -> Option<Region> {
        self.regions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|inner| inner.range().contains(vaddr))
            .map(Region)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::{
        region::Access,
        vmo::{anonymous::CreationStrategy, AnonymousVmo},
    };

    fn fresh_pd() -> Arc<PageDirectory> {
        PageDirectory::new((0x1000_0000, 0x2000_0000), (0x2000_0000, 0x3000_0000))
    }

    #[ktest::ktest]
    fn find_region_locates_the_owning_region() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let range = pd.range_allocator().reserve(PAGE_SIZE).unwrap();
        let region = Region::try_create_user(
            &pd,
            range,
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();

        assert!(pd.find_region(range.base()).is_some());
        assert!(pd.find_region(range.end()).is_none());
        drop(region);
    }

    #[ktest::ktest]
    fn dropped_region_is_no_longer_found() {
        let pd = fresh_pd();
        let vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow).unwrap();
        let range = pd.range_allocator().reserve(PAGE_SIZE).unwrap();
        let region = Region::try_create_user(
            &pd,
            range,
            vmo.into(),
            0,
            None,
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap();
        assert!(pd.find_region(range.base()).is_some());

        drop(region);
        assert!(pd.find_region(range.base()).is_none());
    }

    #[ktest::ktest]
    fn user_and_identity_allocators_are_independent() {
        let pd = fresh_pd();
        let user_range = pd.range_allocator().reserve(PAGE_SIZE).unwrap();
        let identity_range = pd.identity_range_allocator().reserve(PAGE_SIZE).unwrap();
        // The two allocators carve from disjoint windows, so a range handed
        // out by one is never inside the other's.
        assert!(!user_range.overlaps(&identity_range));
    }
}
