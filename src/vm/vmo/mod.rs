// SPDX-License-Identifier: MPL-2.0

//! Virtual Memory Objects: the backing store a [`Region`](super::region::Region)
//! maps into an address space.
//!
//! A [`Vmo`] is a cheap, cloneable handle (an enum over an `Arc` to one of
//! the concrete VMO flavors) so that every [`Region`](super::region::Region)
//! sharing the same object can hold its own handle without contending on a
//! single lock for the object's identity. Per-slot state (the frame table,
//! the CoW bitmap, the registered-regions back-edge list) lives behind the
//! flavor's own locks; see [`core::VmoCore`].

pub(crate) mod core;

pub mod anonymous;
pub mod inode;

use alloc::vec::Vec;

pub use anonymous::{AnonymousVmo, CreationStrategy};
pub use inode::{Inode, InodeVmo};

use crate::{
    config::PAGE_SIZE,
    prelude::*,
    vm::{
        region::{PageFaultResponse, Region, RegionInner},
        FrameKind, PhysicalFrame, Vaddr, VmIo,
    },
    Error,
};

/// A handle to a virtual memory object: anonymous memory or an
/// inode-backed mapping (shared or private).
#[derive(Clone)]
pub enum Vmo {
    Anonymous(Arc<AnonymousVmo>),
    Inode(Arc<InodeVmo>),
}

impl Vmo {
    pub fn page_count(&self) -> usize {
        match self {
            Self::Anonymous(a) => a.page_count(),
            Self::Inode(i) => i.page_count(),
        }
    }

    pub fn slot(&self, page_idx: usize) -> Option<PhysicalFrame> {
        match self {
            Self::Anonymous(a) => a.slot(page_idx),
            Self::Inode(i) => i.slot(page_idx),
        }
    }

    /// The reference count of the frame at `page_idx`, read without
    /// cloning it, so the count this call's own handle would otherwise add
    /// never inflates the result.
    pub fn slot_ref_count(&self, page_idx: usize) -> Option<usize> {
        match self {
            Self::Anonymous(a) => a.slot_ref_count(page_idx),
            Self::Inode(i) => i.slot_ref_count(page_idx),
        }
    }

    pub fn physical_pages(&self) -> Vec<Option<PhysicalFrame>> {
        (0..self.page_count()).map(|i| self.slot(i)).collect()
    }

    pub fn should_cow(&self, page_idx: usize, is_shared: bool) -> bool {
        match self {
            Self::Anonymous(a) => a.should_cow(page_idx, is_shared),
            Self::Inode(i) => i.should_cow(page_idx, is_shared),
        }
    }

    pub fn is_inode_backed(&self) -> bool {
        matches!(self, Self::Inode(_))
    }

    pub fn is_same_object(&self, other: &Vmo) -> bool {
        match (self, other) {
            (Self::Anonymous(a), Self::Anonymous(b)) => Arc::ptr_eq(a, b),
            (Self::Inode(a), Self::Inode(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn register_region(&self, region: &Region) {
        match self {
            Self::Anonymous(a) => a.register_region(region),
            Self::Inode(i) => i.register_region(region),
        }
    }

    pub(crate) fn unregister_region(&self, region: &Region) {
        match self {
            Self::Anonymous(a) => a.unregister_region(region),
            Self::Inode(i) => i.unregister_region(region),
        }
    }

    pub(crate) fn unregister_region_inner(&self, ptr: *const RegionInner) {
        match self {
            Self::Anonymous(a) => a.unregister_region_inner(ptr),
            Self::Inode(i) => i.unregister_region_inner(ptr),
        }
    }

    pub(crate) fn for_each_region(&self, f: impl FnMut(&Region)) {
        match self {
            Self::Anonymous(a) => a.for_each_region(f),
            Self::Inode(i) => i.for_each_region(f),
        }
    }

    /// Resolves a not-present fault against an inode-backed slot. `region`
    /// is accepted for symmetry with [`Self::handle_cow_fault`] but the
    /// inode flavors don't currently need it; a not-present fault against
    /// anonymous memory never reaches this method (see
    /// [`Region::handle_fault`](super::region::Region::handle_fault)).
    pub(crate) fn handle_inode_fault(&self, page_idx: usize, region: &Region) -> PageFaultResponse {
        let _ = region;
        match self {
            Self::Inode(i) => i.handle_inode_fault(page_idx),
            Self::Anonymous(_) => PageFaultResponse::ShouldCrash,
        }
    }

    pub(crate) fn handle_cow_fault(
        &self,
        page_idx: usize,
        vaddr: Vaddr,
        region: &Region,
    ) -> PageFaultResponse {
        let _ = region;
        match self {
            Self::Anonymous(a) => a.handle_cow_fault(self, page_idx, vaddr),
            Self::Inode(i) => i.handle_cow_fault(self, page_idx, vaddr),
        }
    }

    pub(crate) fn allocate_committed_page_for(&self, page_idx: usize) -> Result<()> {
        match self {
            Self::Anonymous(a) => a.allocate_committed_page_for(page_idx),
            Self::Inode(i) => i.allocate_committed_page_for(page_idx),
        }
    }

    /// Resolves a write fault against a slot holding no commit reservation
    /// (`SharedZero`, or any other non-`LazyCommitted` sentinel): allocates
    /// a fresh zeroed frame straight from the free pool.
    pub(crate) fn allocate_user_page_for(&self, page_idx: usize) -> Result<()> {
        match self {
            Self::Anonymous(a) => a.allocate_user_page_for(page_idx),
            Self::Inode(i) => i.allocate_user_page_for(page_idx),
        }
    }

    /// Forks this VMO for a `Region::clone`. Shared mappings are never
    /// routed here (the caller aliases the same `Vmo` instead); every
    /// variant reaching this point forks via CoW.
    pub fn try_clone(&self) -> Option<Vmo> {
        match self {
            Self::Anonymous(a) => a.try_clone().ok().map(Vmo::Anonymous),
            Self::Inode(i) => i.try_clone().ok().map(Vmo::Inode),
        }
    }

    pub fn amount_resident(&self) -> usize {
        match self {
            Self::Anonymous(a) => a.amount_resident(),
            Self::Inode(i) => i.amount_resident(),
        }
    }
}

/// Reads and writes a VMO directly by byte offset, bypassing page-fault
/// delivery entirely. `LazyCommitted` slots read as zero without
/// materializing anything; writing through one is rejected rather than
/// silently committing a page behind the fault-accounting machinery's back.
impl VmIo for Vmo {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let abs = offset + done;
            let page_idx = abs / PAGE_SIZE;
            let page_off = abs % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let frame = self.slot(page_idx).ok_or(Error::InvalidArgs)?;
            if frame.kind() == FrameKind::LazyCommitted {
                buf[done..done + chunk].fill(0);
            } else {
                frame.read_bytes(page_off, &mut buf[done..done + chunk])?;
            }
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let abs = offset + done;
            let page_idx = abs / PAGE_SIZE;
            let page_off = abs % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            let frame = self.slot(page_idx).ok_or(Error::InvalidArgs)?;
            if frame.kind() != FrameKind::Normal {
                return Err(Error::InvalidArgs);
            }
            frame.write_bytes(page_off, &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }
}

impl From<Arc<AnonymousVmo>> for Vmo {
    fn from(vmo: Arc<AnonymousVmo>) -> Self {
        Self::Anonymous(vmo)
    }
}

impl From<Arc<InodeVmo>> for Vmo {
    fn from(vmo: Arc<InodeVmo>) -> Self {
        Self::Inode(vmo)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[ktest::ktest]
    fn read_bytes_zero_fills_lazy_committed_pages() {
        let vmo: Vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::Reserve)
            .unwrap()
            .into();
        let mut buf = [0xFFu8; 16];
        vmo.read_bytes(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[ktest::ktest]
    fn write_bytes_rejects_a_lazy_committed_page() {
        let vmo: Vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::Reserve)
            .unwrap()
            .into();
        assert!(vmo.write_bytes(0, &[1, 2, 3]).is_err());
    }

    #[ktest::ktest]
    fn read_write_round_trip_across_a_page_boundary() {
        let vmo: Vmo = AnonymousVmo::create_with_size(2 * PAGE_SIZE, CreationStrategy::AllocateNow)
            .unwrap()
            .into();
        let written: Vec<u8> = (0..32u8).collect();
        let offset = PAGE_SIZE - 16;
        vmo.write_bytes(offset, &written).unwrap();

        let mut read_back = [0u8; 32];
        vmo.read_bytes(offset, &mut read_back).unwrap();
        assert_eq!(&read_back[..], &written[..]);
    }

    #[ktest::ktest]
    fn read_bytes_past_the_last_slot_fails() {
        let vmo: Vmo = AnonymousVmo::create_with_size(PAGE_SIZE, CreationStrategy::AllocateNow)
            .unwrap()
            .into();
        let mut buf = [0u8; 4];
        assert!(vmo.read_bytes(PAGE_SIZE - 2, &mut buf).is_err());
    }
}
