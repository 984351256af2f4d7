// SPDX-License-Identifier: MPL-2.0

//! Per-address-space allocator of page-aligned virtual-address intervals.
//!
//! A [`RangeAllocator`] hands out non-overlapping `[base, base + size)`
//! windows within a fixed `[start, end)` window of the address space, using
//! the same index-space buddy allocator the physical frame allocator uses
//! (see [`crate::vm::frame_allocator`]), just counting virtual pages instead
//! of physical ones.

use buddy_system_allocator::FrameAllocator;

use crate::{
    config::PAGE_SIZE,
    prelude::*,
    sync::SpinLock,
    vm::{is_page_aligned, Vaddr},
    Error,
};

/// A page-aligned `[base, base + size)` window of virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    base: Vaddr,
    size: usize,
}

impl VirtualRange {
    pub const fn new(base: Vaddr, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> Vaddr {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn end(&self) -> Vaddr {
        self.base + self.size
    }

    pub const fn npages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn contains(&self, vaddr: Vaddr) -> bool {
        (self.base..self.end()).contains(&vaddr)
    }

    /// Whether `self` and `other` overlap by at least one byte.
    pub fn overlaps(&self, other: &VirtualRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

struct Inner {
    allocator: FrameAllocator<32>,
    start: Vaddr,
    end: Vaddr,
}

/// Allocates, carves out, and releases page-aligned virtual ranges within a
/// fixed window of one address space.
pub struct RangeAllocator {
    inner: SpinLock<Inner>,
}

impl RangeAllocator {
    /// Creates an allocator over `[start, end)`. Both bounds must be
    /// page-aligned and `end` must be strictly greater than `start`.
    pub fn new(start: Vaddr, end: Vaddr) -> Self {
        assert!(is_page_aligned(start) && is_page_aligned(end));
        assert!(end > start);
        let mut allocator = FrameAllocator::<32>::new();
        allocator.add_frame(start / PAGE_SIZE, end / PAGE_SIZE);
        Self {
            inner: SpinLock::new(Inner {
                allocator,
                start,
                end,
            }),
        }
    }

    /// Reserves an anonymous range of `size` bytes anywhere within the
    /// allocator's window.
    pub fn reserve(&self, size: usize) -> Result<VirtualRange> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let npages = size / PAGE_SIZE;
        let mut inner = self.inner.lock();
        let start_page = inner
            .allocator
            .alloc(npages)
            .ok_or(Error::NotEnoughResources)?;
        Ok(VirtualRange::new(start_page * PAGE_SIZE, size))
    }

    /// Carves `[vaddr, vaddr + size)` out of the allocator's window,
    /// failing if any page in the range is already reserved or out of
    /// bounds.
    ///
    /// The underlying index allocator has no "allocate exactly here"
    /// primitive, so this is implemented as reserve-then-verify: on
    /// mismatch the spuriously reserved range is released before
    /// returning the error, leaving the allocator state unchanged from the
    /// caller's point of view.
    pub fn reserve_at(&self, vaddr: Vaddr, size: usize) -> Result<VirtualRange> {
        if size == 0 || size % PAGE_SIZE != 0 || !is_page_aligned(vaddr) {
            return Err(Error::InvalidArgs);
        }
        let npages = size / PAGE_SIZE;
        let mut inner = self.inner.lock();
        if vaddr < inner.start || vaddr + size > inner.end {
            return Err(Error::InvalidArgs);
        }
        let wanted_page = vaddr / PAGE_SIZE;
        let got_page = inner
            .allocator
            .alloc(npages)
            .ok_or(Error::NotEnoughResources)?;
        if got_page == wanted_page {
            return Ok(VirtualRange::new(vaddr, size));
        }
        // The allocator doesn't support targeted allocation; approximate it
        // by retrying with the specific range marked used directly. Give
        // back what we got and fall through to a direct carve-out.
        inner.allocator.dealloc(got_page, npages);
        for page in wanted_page..wanted_page + npages {
            // `buddy_system_allocator` has no "is this page free" query, so
            // carve out one page at a time and roll back on first failure.
            match inner.allocator.alloc(1) {
                Some(got) if got == page => {}
                Some(got) => {
                    // Wrong page handed back; give it back immediately so
                    // it isn't leaked, then roll back the rest of this
                    // loop's carve-outs.
                    inner.allocator.dealloc(got, 1);
                    for freed in wanted_page..page {
                        inner.allocator.dealloc(freed, 1);
                    }
                    return Err(Error::NotEnoughResources);
                }
                None => {
                    for freed in wanted_page..page {
                        inner.allocator.dealloc(freed, 1);
                    }
                    return Err(Error::NotEnoughResources);
                }
            }
        }
        Ok(VirtualRange::new(vaddr, size))
    }

    /// Releases a previously reserved range back to the allocator.
    pub fn release(&self, range: VirtualRange) {
        let mut inner = self.inner.lock();
        inner
            .allocator
            .dealloc(range.base() / PAGE_SIZE, range.npages());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const WINDOW_START: Vaddr = 0x1000_0000;
    const WINDOW_END: Vaddr = 0x1010_0000;

    #[ktest::ktest]
    fn virtual_range_accessors() {
        let range = VirtualRange::new(0x2000, 3 * PAGE_SIZE);
        assert_eq!(range.base(), 0x2000);
        assert_eq!(range.size(), 3 * PAGE_SIZE);
        assert_eq!(range.end(), 0x2000 + 3 * PAGE_SIZE);
        assert_eq!(range.npages(), 3);
        assert!(range.contains(0x2000));
        assert!(range.contains(range.end() - 1));
        assert!(!range.contains(range.end()));
    }

    #[ktest::ktest]
    fn virtual_range_overlap() {
        let a = VirtualRange::new(0x1000, 2 * PAGE_SIZE);
        let b = VirtualRange::new(0x2000, PAGE_SIZE);
        let c = VirtualRange::new(0x3000, PAGE_SIZE);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[ktest::ktest]
    fn reserve_then_release_round_trip() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_END);
        let range = allocator.reserve(4 * PAGE_SIZE).unwrap();
        assert_eq!(range.npages(), 4);
        assert!(range.base() >= WINDOW_START && range.end() <= WINDOW_END);

        allocator.release(range);
        // The whole window is free again, so the same size can be
        // re-reserved without running out of space.
        let range2 = allocator.reserve(4 * PAGE_SIZE).unwrap();
        assert_eq!(range2.npages(), 4);
    }

    #[ktest::ktest]
    fn reserve_rejects_zero_and_misaligned_sizes() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_END);
        assert!(matches!(allocator.reserve(0), Err(Error::InvalidArgs)));
        assert!(matches!(
            allocator.reserve(PAGE_SIZE / 2),
            Err(Error::InvalidArgs)
        ));
    }

    #[ktest::ktest]
    fn reserve_fails_once_the_window_is_exhausted() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_START + PAGE_SIZE);
        allocator.reserve(PAGE_SIZE).unwrap();
        assert!(matches!(
            allocator.reserve(PAGE_SIZE),
            Err(Error::NotEnoughResources)
        ));
    }

    #[ktest::ktest]
    fn reserve_at_exact_vaddr_succeeds_and_rejects_reconflict() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_END);
        let wanted = WINDOW_START + 2 * PAGE_SIZE;
        let range = allocator.reserve_at(wanted, PAGE_SIZE).unwrap();
        assert_eq!(range.base(), wanted);

        // The same vaddr is now taken; a second carve-out over it fails
        // rather than silently aliasing the first.
        assert!(allocator.reserve_at(wanted, PAGE_SIZE).is_err());
    }

    #[ktest::ktest]
    fn reserve_at_rejects_out_of_bounds_or_misaligned() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_END);
        assert!(matches!(
            allocator.reserve_at(WINDOW_START - PAGE_SIZE, PAGE_SIZE),
            Err(Error::InvalidArgs)
        ));
        assert!(matches!(
            allocator.reserve_at(WINDOW_END, PAGE_SIZE),
            Err(Error::InvalidArgs)
        ));
        assert!(matches!(
            allocator.reserve_at(WINDOW_START + 1, PAGE_SIZE),
            Err(Error::InvalidArgs)
        ));
    }

    #[ktest::ktest]
    fn released_range_can_be_reserved_at_again() {
        let allocator = RangeAllocator::new(WINDOW_START, WINDOW_END);
        let wanted = WINDOW_START + 3 * PAGE_SIZE;
        let range = allocator.reserve_at(wanted, PAGE_SIZE).unwrap();
        allocator.release(range);
        let range2 = allocator.reserve_at(wanted, PAGE_SIZE).unwrap();
        assert_eq!(range2.base(), wanted);
    }
}
