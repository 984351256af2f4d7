// SPDX-License-Identifier: MPL-2.0

//! File-backed memory: VMOs whose slots are populated on demand by reading
//! through an [`Inode`], in both `MAP_SHARED` and `MAP_PRIVATE` flavors.

use alloc::vec::Vec;

use bitvec::{bitvec, vec::BitVec};
use log::trace;

use crate::{
    config::PAGE_SIZE,
    prelude::*,
    sync::SpinLock,
    vm::{
        frame_allocator,
        region::{PageFaultResponse, Region},
        vmo::core::{CommittedCowPages, VmoCore},
        FrameKind, PhysicalFrame, VmReader, VmWriter, Vaddr,
    },
    Error,
};

/// The file abstraction a page cache reads through to satisfy a
/// not-present fault. Deliberately minimal: this crate owns page-fault
/// resolution, not the filesystem.
pub trait Inode: Send + Sync {
    /// Reads up to `writer.avail()` bytes starting at `offset` into
    /// `writer`, returning the number of bytes actually read (short reads
    /// past EOF are not an error).
    fn read_bytes(&self, offset: usize, writer: &mut VmWriter<'_>) -> Result<usize>;

    /// The size of the underlying file, in bytes.
    fn size(&self) -> usize;
}

/// A VMO backed by an [`Inode`]: slots start empty and are populated, one
/// page at a time, by the first not-present fault to touch them.
pub struct InodeVmo {
    core: VmoCore,
    inode: Arc<dyn Inode>,
    /// `MAP_SHARED` (false) mappings alias the same frames across every
    /// clone; `MAP_PRIVATE` (true) mappings fork via the same CoW
    /// machinery as anonymous memory once cloned.
    private: bool,
    /// Tracks which pages have ever been faulted in (dirty relative to the
    /// backing file, from this crate's point of view — writeback to the
    /// filesystem is out of scope).
    dirty: SpinLock<BitVec>,
}

impl InodeVmo {
    fn new(inode: Arc<dyn Inode>, npages: usize, private: bool) -> Arc<Self> {
        let slots = (0..npages)
            .map(|_| frame_allocator::shared_zero_frame())
            .collect();
        Arc::new(Self {
            core: VmoCore::new(slots),
            inode,
            private,
            dirty: SpinLock::new(bitvec![0; npages]),
        })
    }

    /// Creates a `MAP_SHARED` mapping of `inode`: every clone (and every
    /// region mapping it) observes the same materialized frames.
    pub fn create_shared(inode: Arc<dyn Inode>, npages: usize) -> Arc<Self> {
        Self::new(inode, npages, false)
    }

    /// Creates a `MAP_PRIVATE` mapping of `inode`: writes are invisible to
    /// other mappings and to the file itself, enforced by CoW from the
    /// first write fault onward.
    pub fn create_private(inode: Arc<dyn Inode>, npages: usize) -> Arc<Self> {
        Self::new(inode, npages, true)
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
        if !self.private {
            return false;
        }
        self.core.should_cow(page_idx, is_shared)
    }

    pub fn is_private(&self) -> bool {
        self.private
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

    /// Resolves a not-present fault by reading the page in from the
    /// inode. The read happens with no lock held (per the file I/O
    /// discipline described in DESIGN.md); once the read completes, the
    /// slot is re-checked under lock and the read result is discarded if
    /// another thread has already materialized the page in the meantime —
    /// that racing thread's result is authoritative, not this one's.
    pub fn handle_inode_fault(&self, page_idx: usize) -> PageFaultResponse {
        if let Some(frame) = self.core.slot(page_idx) {
            if frame.kind() == FrameKind::Normal {
                return PageFaultResponse::Continue;
            }
        }

        let Some(new_frame) = frame_allocator::allocate_user_frame(true) else {
            return PageFaultResponse::OutOfMemory;
        };

        let file_offset = page_idx * PAGE_SIZE;
        if file_offset < self.inode.size() {
            let mut writer = new_frame.writer();
            if let Err(e) = self.inode.read_bytes(file_offset, &mut writer) {
                trace!("InodeVmo: read_bytes failed at offset {file_offset:#x}: {e:?}");
                return PageFaultResponse::ShouldCrash;
            }
        }

        // Re-check: another thread may have raced us and already installed
        // a `Normal` frame for this slot. If so, our freshly-read frame is
        // simply dropped and the existing one wins.
        if let Some(existing) = self.core.slot(page_idx) {
            if existing.kind() == FrameKind::Normal {
                return PageFaultResponse::Continue;
            }
        }
        self.core.set_slot(page_idx, new_frame);
        if let Some(mut bit) = self.dirty.lock().get_mut(page_idx) {
            bit.set(true);
        }
        PageFaultResponse::Continue
    }

    /// Resolves a CoW write fault on a private mapping.
    pub fn handle_cow_fault(
        &self,
        vmo: &super::Vmo,
        page_idx: usize,
        vaddr: Vaddr,
    ) -> PageFaultResponse {
        debug_assert!(self.private, "CoW fault on a shared inode mapping");
        self.core.handle_cow_fault(vmo, page_idx, vaddr, |_| false)
    }

    pub fn allocate_committed_page_for(&self, page_idx: usize) -> Result<()> {
        // Inode-backed slots are always populated via `handle_inode_fault`,
        // never via the lazy-commit not-present path.
        let _ = page_idx;
        Err(Error::InvalidArgs)
    }

    /// Resolves a write fault against a not-yet-faulted-in `SharedZero`
    /// slot directly, bypassing the inode read. Reached when a write lands
    /// on a page before any read has pulled its contents in.
    pub fn allocate_user_page_for(&self, page_idx: usize) -> Result<()> {
        let frame = frame_allocator::allocate_user_frame(true).ok_or(Error::NoMemory)?;
        self.core.set_slot(page_idx, frame);
        Ok(())
    }

    /// `MAP_SHARED` mappings alias: the clone is simply another handle to
    /// the same object, so every mapping keeps observing the same
    /// materialized frames. `MAP_PRIVATE` mappings fork through the same
    /// CoW state machine anonymous memory uses, since once cloned a private
    /// file mapping behaves exactly like anonymous CoW memory (its pages
    /// never write back to the inode).
    pub fn try_clone(self: &Arc<Self>) -> Result<Arc<Self>> {
        if !self.private {
            return Ok(self.clone());
        }
        let slots = self.core.clone_slots();
        let npages = slots.len();

        frame_allocator::commit(npages)?;
        let pool = CommittedCowPages::new(npages);

        self.core.mark_fully_cow();
        self.core.set_committed_cow_pages(Some(pool.clone()));

        let child_core = VmoCore::new(slots);
        child_core.mark_fully_cow();
        child_core.set_committed_cow_pages(Some(pool));

        Ok(Arc::new(Self {
            core: child_core,
            inode: self.inode.clone(),
            private: true,
            dirty: SpinLock::new(self.dirty.lock().clone()),
        }))
    }

    pub fn amount_resident(&self) -> usize {
        (0..self.page_count())
            .filter(|&i| self.slot(i).is_some_and(|f| f.kind() == FrameKind::Normal))
            .count()
            * PAGE_SIZE
    }

    /// Number of pages materialized and (for private mappings) possibly
    /// diverged from the backing file's contents.
    pub fn amount_dirty(&self) -> usize {
        self.dirty.lock().count_ones() * PAGE_SIZE
    }

    pub fn physical_pages(&self) -> Vec<Option<PhysicalFrame>> {
        (0..self.page_count()).map(|i| self.slot(i)).collect()
    }
}

#[cfg(test)]
mod test {
    use alloc::vec;

    use super::*;

    struct TestInode(Vec<u8>);

    impl Inode for TestInode {
        fn read_bytes(&self, offset: usize, writer: &mut VmWriter<'_>) -> Result<usize> {
            if offset >= self.0.len() {
                return Ok(0);
            }
            let mut reader = VmReader::from(&self.0[offset..]);
            Ok(writer.write(&mut reader))
        }

        fn size(&self) -> usize {
            self.0.len()
        }
    }

    /// S4: a one-byte file, mapped shared. Reading page 0 zero-pads
    /// everything past the single real byte.
    #[ktest::ktest]
    fn shared_fault_short_reads_zero_pad() {
        let inode: Arc<dyn Inode> = Arc::new(TestInode(vec![0x7Au8]));
        let vmo = InodeVmo::create_shared(inode, 1);

        assert_eq!(vmo.handle_inode_fault(0), PageFaultResponse::Continue);
        let frame = vmo.slot(0).unwrap();
        assert_eq!(frame.kind(), FrameKind::Normal);

        let mut buf = [0xFFu8; PAGE_SIZE];
        let mut reader = frame.reader();
        let mut writer = VmWriter::from(&mut buf[..]);
        reader.read(&mut writer);
        assert_eq!(buf[0], 0x7A);
        assert!(buf[1..].iter().all(|&b| b == 0));
    }

    #[ktest::ktest]
    fn repeated_fault_on_same_page_is_idempotent() {
        let inode: Arc<dyn Inode> = Arc::new(TestInode(vec![1u8; PAGE_SIZE]));
        let vmo = InodeVmo::create_shared(inode, 1);

        vmo.handle_inode_fault(0);
        let first = vmo.slot(0).unwrap();
        vmo.handle_inode_fault(0);
        let second = vmo.slot(0).unwrap();
        assert_eq!(first, second);
    }

    #[ktest::ktest]
    fn shared_vmo_clone_aliases_the_same_object() {
        let inode: Arc<dyn Inode> = Arc::new(TestInode(vec![1u8; PAGE_SIZE]));
        let vmo = InodeVmo::create_shared(inode, 2);
        let clone = vmo.try_clone().expect("shared clone must alias, not error");
        assert!(Arc::ptr_eq(&vmo, &clone));
    }

    #[ktest::ktest]
    fn private_vmo_clone_forks_via_cow() {
        let inode: Arc<dyn Inode> = Arc::new(TestInode(vec![1u8; PAGE_SIZE]));
        let vmo = InodeVmo::create_private(inode, 1);
        vmo.handle_inode_fault(0);

        let child = vmo.try_clone().unwrap();
        assert!(!Arc::ptr_eq(&vmo, &child));
        assert!(vmo.should_cow(0, false));
        assert!(child.should_cow(0, false));
        assert_eq!(vmo.slot_ref_count(0), Some(2));
    }

    #[ktest::ktest]
    fn amount_dirty_tracks_faulted_pages() {
        let inode: Arc<dyn Inode> = Arc::new(TestInode(vec![1u8; 2 * PAGE_SIZE]));
        let vmo = InodeVmo::create_shared(inode, 2);
        assert_eq!(vmo.amount_dirty(), 0);
        vmo.handle_inode_fault(0);
        assert_eq!(vmo.amount_dirty(), PAGE_SIZE);
    }
}
