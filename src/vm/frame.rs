// SPDX-License-Identifier: MPL-2.0

use alloc::vec;
use core::{
    iter::Iterator,
    marker::PhantomData,
    ops::{BitAnd, BitOr, Not, Range},
};

use crate::{config::PAGE_SIZE, prelude::*, Error};

use super::{frame_allocator, HasPaddr};
use super::{Paddr, VmIo};

/// A collection of page frames (physical memory pages).
///
/// For the most parts, `VmFrameVec` is like `Vec<PhysicalFrame>`. But the
/// implementation may or may not be based on `Vec`. Having a dedicated
/// type to represent a series of page frames is convenient because,
/// more often than not, one needs to operate on a batch of frames rather
/// a single frame.
#[derive(Debug, Clone)]
pub struct VmFrameVec(pub(crate) Vec<PhysicalFrame>);

impl VmFrameVec {
    pub fn get(&self, index: usize) -> Option<&PhysicalFrame> {
        self.0.get(index)
    }

    /// returns an empty vmframe vec
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new_with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Pushs a new frame to the collection.
    pub fn push(&mut self, new_frame: PhysicalFrame) {
        self.0.push(new_frame);
    }

    /// Pop a frame from the collection.
    pub fn pop(&mut self) -> Option<PhysicalFrame> {
        self.0.pop()
    }

    /// Removes a frame at a position.
    pub fn remove(&mut self, at: usize) -> PhysicalFrame {
        self.0.remove(at)
    }

    /// Append some frames.
    pub fn append(&mut self, more: &mut VmFrameVec) -> Result<()> {
        self.0.append(&mut more.0);
        Ok(())
    }

    /// zero all internal vm frames
    pub fn zero(&self) {
        self.0.iter().for_each(|frame| frame.zero())
    }

    /// Truncate some frames.
    ///
    /// If `new_len >= self.len()`, then this method has no effect.
    pub fn truncate(&mut self, new_len: usize) {
        if new_len >= self.0.len() {
            return;
        }
        self.0.truncate(new_len)
    }

    /// Returns an iterator
    pub fn iter(&self) -> core::slice::Iter<'_, PhysicalFrame> {
        self.0.iter()
    }

    /// Returns the number of frames.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the frame collection is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of bytes.
    ///
    /// This method is equivalent to `self.len() * PAGE_SIZE`.
    pub fn nbytes(&self) -> usize {
        self.0.len() * PAGE_SIZE
    }

    pub fn from_one_frame(frame: PhysicalFrame) -> Self {
        Self(vec![frame])
    }
}

impl IntoIterator for VmFrameVec {
    type Item = PhysicalFrame;

    type IntoIter = alloc::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl VmIo for VmFrameVec {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if buf.len() + offset > self.nbytes() {
            return Err(Error::InvalidArgs);
        }

        let num_unread_pages = offset / PAGE_SIZE;
        let mut start = offset % PAGE_SIZE;
        let mut buf_writer: VmWriter = buf.into();
        for frame in self.0.iter().skip(num_unread_pages) {
            let read_len = frame.reader().skip(start).read(&mut buf_writer);
            if read_len == 0 {
                break;
            }
            start = 0;
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.len() + offset > self.nbytes() {
            return Err(Error::InvalidArgs);
        }

        let num_unwrite_pages = offset / PAGE_SIZE;
        let mut start = offset % PAGE_SIZE;
        let mut buf_reader: VmReader = buf.into();
        for frame in self.0.iter().skip(num_unwrite_pages) {
            let write_len = frame.writer().skip(start).write(&mut buf_reader);
            if write_len == 0 {
                break;
            }
            start = 0;
        }
        Ok(())
    }
}

/// An iterator for frames.
pub struct VmFrameVecIter<'a> {
    frames: &'a VmFrameVec,
    current: usize,
}

impl<'a> VmFrameVecIter<'a> {
    pub fn new(frames: &'a VmFrameVec) -> Self {
        Self { frames, current: 0 }
    }
}

impl<'a> Iterator for VmFrameVecIter<'a> {
    type Item = &'a PhysicalFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.frames.0.len() {
            return None;
        }
        let item = self.frames.0.get(self.current);
        self.current += 1;
        item
    }
}

bitflags::bitflags! {
    pub(crate) struct VmFrameFlags : usize {
        const NEED_DEALLOC =    1 << 63;
    }
}

/// The discriminant carried by every slot-filling [`PhysicalFrame`].
///
/// `SharedZero` and `LazyCommitted` are sentinels: they occupy a VMO slot
/// without consuming an ordinary physical frame. Both are process-wide
/// singletons, never individually freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A frame allocated from the physical frame allocator. Freed to the
    /// allocator when its last reference is dropped.
    Normal,
    /// The single, process-wide, all-zero frame. Read-only by construction;
    /// any write must first replace the slot with a `Normal` frame.
    SharedZero,
    /// A placeholder for a frame whose allocation has been charged against
    /// the global commit reserve but that has not yet been materialized.
    LazyCommitted,
}

#[derive(Debug)]
struct Inner {
    /// Physical address, meaningful only when `kind == Normal` or
    /// `kind == SharedZero`; `LazyCommitted` carries no physical backing.
    paddr: Paddr,
    kind: FrameKind,
}

/// A handle to a page frame (a physical memory page), or to one of the two
/// process-wide sentinel frames.
///
/// A cloned `PhysicalFrame` refers to the same underlying frame as the
/// original — behind the scenes a reference count is maintained so that,
/// for `Normal` frames, the physical frame is returned to the allocator
/// once the last handle is dropped. Sentinel frames (`SharedZero`,
/// `LazyCommitted`) are never returned to the allocator.
#[derive(Debug, Clone)]
pub struct PhysicalFrame {
    inner: Arc<Inner>,
}

impl PartialEq for PhysicalFrame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for PhysicalFrame {}

impl HasPaddr for PhysicalFrame {
    fn paddr(&self) -> Paddr {
        self.start_paddr()
    }
}

impl PhysicalFrame {
    /// Creates a new `Normal` frame.
    ///
    /// # Safety
    ///
    /// The given physical address must be a page allocated from the frame
    /// allocator and not otherwise in use.
    pub(crate) unsafe fn new_normal(paddr: Paddr) -> Self {
        assert_eq!(paddr % PAGE_SIZE, 0);
        Self {
            inner: Arc::new(Inner {
                paddr,
                kind: FrameKind::Normal,
            }),
        }
    }

    /// Creates a sentinel frame that is never returned to the allocator.
    ///
    /// # Safety
    ///
    /// For `FrameKind::SharedZero`, `paddr` must refer to a frame that is
    /// kept zeroed and never reclaimed.
    pub(crate) unsafe fn new_sentinel(paddr: Paddr, kind: FrameKind) -> Self {
        debug_assert_ne!(kind, FrameKind::Normal);
        Self {
            inner: Arc::new(Inner { paddr, kind }),
        }
    }

    /// Creates a `Normal` frame over a physical range that must never be
    /// deallocated by this crate (MMIO, reserved firmware regions, ...).
    ///
    /// # Safety
    ///
    /// The physical range must be valid for the lifetime of the returned
    /// frame and must not alias any frame tracked by the allocator.
    pub unsafe fn new_unowned(paddr: Paddr) -> Self {
        assert_eq!(paddr % PAGE_SIZE, 0);
        Self {
            inner: Arc::new(Inner {
                paddr,
                kind: FrameKind::Normal,
            }),
        }
    }

    /// The sentinel discriminant of this frame.
    pub fn kind(&self) -> FrameKind {
        self.inner.kind
    }

    /// Whether this frame is a sentinel (`SharedZero` or `LazyCommitted`)
    /// rather than a real, materialized page.
    pub fn is_sentinel(&self) -> bool {
        self.inner.kind != FrameKind::Normal
    }

    /// The number of outstanding handles to this frame.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns the physical address of the page frame.
    ///
    /// # Panics
    ///
    /// Panics if called on a `LazyCommitted` sentinel, which carries no
    /// physical backing.
    pub fn start_paddr(&self) -> Paddr {
        assert_ne!(
            self.inner.kind,
            FrameKind::LazyCommitted,
            "a lazily-committed slot has no physical address until materialized"
        );
        self.inner.paddr
    }

    pub fn end_paddr(&self) -> Paddr {
        self.start_paddr() + PAGE_SIZE
    }

    /// Fills the frame with zero.
    pub fn zero(&self) {
        // Safety: the range of memory is valid for writes of one page, and
        // callers never zero a sentinel (it would corrupt the shared-zero
        // page or panic for a lazy-committed slot).
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), 0, PAGE_SIZE) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        super::paddr_to_vaddr(self.start_paddr()) as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        super::paddr_to_vaddr(self.start_paddr()) as *mut u8
    }

    pub fn copy_from_frame(&self, src: &PhysicalFrame) {
        if Arc::ptr_eq(&self.inner, &src.inner) {
            return;
        }

        // Safety: src and dst is not overlapped.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_mut_ptr(), PAGE_SIZE);
        }
    }
}

impl<'a> PhysicalFrame {
    /// Returns a reader to read data from it.
    pub fn reader(&'a self) -> VmReader<'a> {
        // Safety: the memory of the page is contiguous and is valid during `'a`.
        unsafe { VmReader::from_raw_parts(self.as_ptr(), PAGE_SIZE) }
    }

    /// Returns a writer to write data into it.
    pub fn writer(&'a self) -> VmWriter<'a> {
        // Safety: the memory of the page is contiguous and is valid during `'a`.
        unsafe { VmWriter::from_raw_parts_mut(self.as_mut_ptr(), PAGE_SIZE) }
    }
}

impl VmIo for PhysicalFrame {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if buf.len() + offset > PAGE_SIZE {
            return Err(Error::InvalidArgs);
        }
        let len = self.reader().skip(offset).read(&mut buf.into());
        debug_assert!(len == buf.len());
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.len() + offset > PAGE_SIZE {
            return Err(Error::InvalidArgs);
        }
        let len = self.writer().skip(offset).write(&mut buf.into());
        debug_assert!(len == buf.len());
        Ok(())
    }
}

impl Drop for PhysicalFrame {
    fn drop(&mut self) {
        if self.inner.kind == FrameKind::Normal && Arc::strong_count(&self.inner) == 1 {
            // Safety: the frame index is valid and was allocated from the
            // frame allocator (`new_normal` is the only non-sentinel
            // constructor reachable outside of this module).
            unsafe {
                frame_allocator::dealloc_single(self.inner.paddr / PAGE_SIZE);
            }
        }
    }
}

/// A handle to a contiguous range of page frames (physical memory pages).
///
/// The biggest difference between `VmSegment` and `VmFrameVec` is that
/// the page frames must be contiguous for `VmSegment`.
///
/// A cloned `VmSegment` refers to the same page frames as the original.
#[derive(Debug, Clone)]
pub struct VmSegment {
    inner: Arc<SegmentInner>,
    range: Range<usize>,
}

#[derive(Debug)]
struct SegmentInner {
    start_frame_index: Paddr,
    nframes: usize,
}

impl SegmentInner {
    /// # Safety
    ///
    /// The constructor of `VmSegment` ensures the safety.
    unsafe fn new(paddr: Paddr, nframes: usize, flags: VmFrameFlags) -> Self {
        assert_eq!(paddr % PAGE_SIZE, 0);
        Self {
            start_frame_index: (paddr / PAGE_SIZE).bitor(flags.bits),
            nframes,
        }
    }

    fn start_frame_index(&self) -> usize {
        self.start_frame_index
            .bitand(VmFrameFlags::all().bits().not())
    }

    fn start_paddr(&self) -> Paddr {
        self.start_frame_index() * PAGE_SIZE
    }
}

impl HasPaddr for VmSegment {
    fn paddr(&self) -> Paddr {
        self.start_paddr()
    }
}

impl VmSegment {
    /// Creates a new `VmSegment`.
    ///
    /// # Safety
    ///
    /// The given range of page frames must be contiguous and valid for use,
    /// and must not already be part of a live `PhysicalFrame` or `VmSegment`.
    pub(crate) unsafe fn new(paddr: Paddr, nframes: usize, flags: VmFrameFlags) -> Self {
        Self {
            inner: Arc::new(SegmentInner::new(paddr, nframes, flags)),
            range: 0..nframes,
        }
    }

    /// Returns a part of the `VmSegment`.
    ///
    /// # Panics
    ///
    /// If `range` is not within the range of this `VmSegment`.
    pub fn range(&self, range: Range<usize>) -> Self {
        let orig_range = &self.range;
        let adj_range = (range.start + orig_range.start)..(range.end + orig_range.start);
        assert!(!adj_range.is_empty() && adj_range.end <= orig_range.end);

        Self {
            inner: self.inner.clone(),
            range: adj_range,
        }
    }

    pub fn start_paddr(&self) -> Paddr {
        self.start_frame_index() * PAGE_SIZE
    }

    pub fn end_paddr(&self) -> Paddr {
        (self.start_frame_index() + self.nframes()) * PAGE_SIZE
    }

    pub fn nframes(&self) -> usize {
        self.range.len()
    }

    pub fn nbytes(&self) -> usize {
        self.nframes() * PAGE_SIZE
    }

    /// Fills the page frames with zero.
    pub fn zero(&self) {
        // Safety: The range of memory is valid for writes of `self.nbytes()` data.
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), 0, self.nbytes()) }
    }

    fn need_dealloc(&self) -> bool {
        (self.inner.start_frame_index & VmFrameFlags::NEED_DEALLOC.bits()) != 0
    }

    fn start_frame_index(&self) -> usize {
        self.inner.start_frame_index() + self.range.start
    }

    pub fn as_ptr(&self) -> *const u8 {
        super::paddr_to_vaddr(self.start_paddr()) as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        super::paddr_to_vaddr(self.start_paddr()) as *mut u8
    }
}

impl<'a> VmSegment {
    /// Returns a reader to read data from it.
    pub fn reader(&'a self) -> VmReader<'a> {
        // Safety: the memory of the page frames is contiguous and is valid during `'a`.
        unsafe { VmReader::from_raw_parts(self.as_ptr(), self.nbytes()) }
    }

    /// Returns a writer to write data into it.
    pub fn writer(&'a self) -> VmWriter<'a> {
        // Safety: the memory of the page frames is contiguous and is valid during `'a`.
        unsafe { VmWriter::from_raw_parts_mut(self.as_mut_ptr(), self.nbytes()) }
    }
}

impl VmIo for VmSegment {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if buf.len() + offset > self.nbytes() {
            return Err(Error::InvalidArgs);
        }
        let len = self.reader().skip(offset).read(&mut buf.into());
        debug_assert!(len == buf.len());
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.len() + offset > self.nbytes() {
            return Err(Error::InvalidArgs);
        }
        let len = self.writer().skip(offset).write(&mut buf.into());
        debug_assert!(len == buf.len());
        Ok(())
    }
}

impl Drop for VmSegment {
    fn drop(&mut self) {
        if self.need_dealloc() && Arc::strong_count(&self.inner) == 1 {
            // Safety: the range of contiguous page frames is valid.
            unsafe {
                frame_allocator::dealloc_contiguous(
                    self.inner.start_frame_index(),
                    self.inner.nframes,
                );
            }
        }
    }
}

/// VmReader is a reader for reading data from a contiguous range of memory.
pub struct VmReader<'a> {
    cursor: *const u8,
    end: *const u8,
    phantom: PhantomData<&'a [u8]>,
}

impl<'a> VmReader<'a> {
    /// # Safety
    ///
    /// User must ensure the memory from `ptr` to `ptr.add(len)` is contiguous
    /// and valid during the entire period of `'a`.
    pub const unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        Self {
            cursor: ptr,
            end: ptr.add(len),
            phantom: PhantomData,
        }
    }

    pub const fn remain(&self) -> usize {
        // Safety: the end is equal to or greater than the cursor.
        unsafe { self.end.sub_ptr(self.cursor) }
    }

    pub const fn cursor(&self) -> *const u8 {
        self.cursor
    }

    pub const fn has_remain(&self) -> bool {
        self.remain() > 0
    }

    /// This method ensures the postcondition of `self.remain() <= max_remain`.
    pub const fn limit(mut self, max_remain: usize) -> Self {
        if max_remain < self.remain() {
            // Safety: the new end is less than the old end.
            unsafe { self.end = self.cursor.add(max_remain) };
        }
        self
    }

    /// # Panics
    ///
    /// If `nbytes` is greater than `self.remain()`.
    pub fn skip(mut self, nbytes: usize) -> Self {
        assert!(nbytes <= self.remain());

        // Safety: the new cursor is less than or equal to the end.
        unsafe { self.cursor = self.cursor.add(nbytes) };
        self
    }

    /// Reads all data into the writer until one of the two conditions is met:
    /// 1. The reader has no remaining data.
    /// 2. The writer has no available space.
    ///
    /// Returns the number of bytes read.
    pub fn read(&mut self, writer: &mut VmWriter<'_>) -> usize {
        let copy_len = self.remain().min(writer.avail());
        if copy_len == 0 {
            return 0;
        }

        // Safety: the memory range is valid since `copy_len` is the minimum
        // of the reader's remaining data and the writer's available space.
        unsafe {
            core::ptr::copy(self.cursor, writer.cursor, copy_len);
            self.cursor = self.cursor.add(copy_len);
            writer.cursor = writer.cursor.add(copy_len);
        }
        copy_len
    }
}

impl<'a> From<&'a [u8]> for VmReader<'a> {
    fn from(slice: &'a [u8]) -> Self {
        // Safety: the range of memory is contiguous and is valid during `'a`.
        unsafe { Self::from_raw_parts(slice.as_ptr(), slice.len()) }
    }
}

/// VmWriter is a writer for writing data to a contiguous range of memory.
pub struct VmWriter<'a> {
    cursor: *mut u8,
    end: *mut u8,
    phantom: PhantomData<&'a mut [u8]>,
}

impl<'a> VmWriter<'a> {
    /// # Safety
    ///
    /// User must ensure the memory from `ptr` to `ptr.add(len)` is contiguous
    /// and valid during the entire period of `'a`.
    pub const unsafe fn from_raw_parts_mut(ptr: *mut u8, len: usize) -> Self {
        Self {
            cursor: ptr,
            end: ptr.add(len),
            phantom: PhantomData,
        }
    }

    pub const fn avail(&self) -> usize {
        // Safety: the end is equal to or greater than the cursor.
        unsafe { self.end.sub_ptr(self.cursor) }
    }

    pub const fn cursor(&self) -> *mut u8 {
        self.cursor
    }

    pub const fn has_avail(&self) -> bool {
        self.avail() > 0
    }

    /// This method ensures the postcondition of `self.avail() <= max_avail`.
    pub const fn limit(mut self, max_avail: usize) -> Self {
        if max_avail < self.avail() {
            // Safety: the new end is less than the old end.
            unsafe { self.end = self.cursor.add(max_avail) };
        }
        self
    }

    /// # Panics
    ///
    /// If `nbytes` is greater than `self.avail()`.
    pub fn skip(mut self, nbytes: usize) -> Self {
        assert!(nbytes <= self.avail());

        // Safety: the new cursor is less than or equal to the end.
        unsafe { self.cursor = self.cursor.add(nbytes) };
        self
    }

    /// Writes data from the reader until one of the two conditions is met:
    /// 1. The writer has no available space.
    /// 2. The reader has no remaining data.
    ///
    /// Returns the number of bytes written.
    pub fn write(&mut self, reader: &mut VmReader<'_>) -> usize {
        let copy_len = self.avail().min(reader.remain());
        if copy_len == 0 {
            return 0;
        }

        // Safety: the memory range is valid since `copy_len` is the minimum
        // of the reader's remaining data and the writer's available space.
        unsafe {
            core::ptr::copy(reader.cursor, self.cursor, copy_len);
            self.cursor = self.cursor.add(copy_len);
            reader.cursor = reader.cursor.add(copy_len);
        }
        copy_len
    }
}

impl<'a> From<&'a mut [u8]> for VmWriter<'a> {
    fn from(slice: &'a mut [u8]) -> Self {
        // Safety: the range of memory is contiguous and is valid during `'a`.
        unsafe { Self::from_raw_parts_mut(slice.as_mut_ptr(), slice.len()) }
    }
}
