use std::alloc::{self as alloc, Layout};
use std::ptr::NonNull;

use tracing::debug;

use crate::config::LayoutConfig;
use crate::error::{LayoutError, Result};

/// A contiguous chunk of bytes handed out by a `RegionAllocator`. It is not `Clone`,
/// the only way to give the memory back is to move the range into `release`.
#[derive(Debug)]
pub struct ByteRange {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

// The range is exclusively owned by one tree; reads and writes through it are serialized by the
// context (`&self` for resolving and reading, `&mut self` for writing and releasing).
unsafe impl Send for ByteRange {}
unsafe impl Sync for ByteRange {}

impl ByteRange {
    /// # Safety
    /// `ptr` must point to `len` bytes that nothing else owns, allocated with alignment `align`
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, align: usize) -> Self {
        ByteRange { ptr, len, align }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// base address, for address arithmetic
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// whether `[offset, offset + size)` lies inside the range
    pub fn within(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).map_or(false, |end| end <= self.len)
    }
}

/// The memory collaborator trees get their backing regions from
pub trait RegionAllocator {
    fn allocate(&mut self, size: usize) -> Result<ByteRange>;

    fn release(&mut self, region: ByteRange);

    /// bytes currently handed out
    fn live_bytes(&self) -> usize;
}

/// Global-allocator backed regions. Regions always come back zeroed, so every byte of a committed
/// tree holds a valid value of any `bytemuck::Pod` element type.
#[derive(Debug)]
pub struct HeapAllocator {
    align: usize,
    live: usize,
    peak: usize,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::from_config(&LayoutConfig::default())
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// expects a config that passed `LayoutConfig::validate`, otherwise every allocation fails
    pub fn from_config(config: &LayoutConfig) -> Self {
        HeapAllocator { align: config.alignment, live: 0, peak: 0 }
    }

    /// largest number of bytes that were live at once
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }
}

impl RegionAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Result<ByteRange> {
        let failed = LayoutError::AllocationFailed { requested: size };
        if size == 0 {
            return Err(failed);
        }
        let layout = Layout::from_size_align(size, self.align).map_err(|_| failed.clone())?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        // unlike a Vec we report failure instead of aborting, the builder stays usable
        let ptr = NonNull::new(ptr).ok_or(failed)?;
        self.live += size;
        self.peak = self.peak.max(self.live);
        debug!(size, align = self.align, live = self.live, "allocated region");
        Ok(ByteRange { ptr, len: size, align: self.align })
    }

    fn release(&mut self, region: ByteRange) {
        // allocate never hands out empty ranges and the range came from the same layout
        if let Ok(layout) = Layout::from_size_align(region.len, region.align) {
            unsafe {
                alloc::dealloc(region.ptr.as_ptr(), layout);
            }
            self.live = self.live.saturating_sub(region.len);
            debug!(size = region.len, live = self.live, "released region");
        }
    }

    fn live_bytes(&self) -> usize {
        self.live
    }
}

/// Caps the bytes an inner allocator may hand out at once
#[derive(Debug)]
pub struct BoundedAllocator<A> {
    inner: A,
    budget: usize,
}

impl<A: RegionAllocator> BoundedAllocator<A> {
    pub fn new(inner: A, budget: usize) -> Self {
        BoundedAllocator { inner, budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: RegionAllocator> RegionAllocator for BoundedAllocator<A> {
    fn allocate(&mut self, size: usize) -> Result<ByteRange> {
        let live = self.inner.live_bytes();
        if live.checked_add(size).map_or(true, |total| total > self.budget) {
            debug!(size, live, budget = self.budget, "region request over budget");
            return Err(LayoutError::AllocationFailed { requested: size });
        }
        self.inner.allocate(size)
    }

    fn release(&mut self, region: ByteRange) {
        self.inner.release(region)
    }

    fn live_bytes(&self) -> usize {
        self.inner.live_bytes()
    }
}

#[test]
fn test_heap_alloc() {
    let mut heap = HeapAllocator::new();
    let region = heap.allocate(100).unwrap();
    assert_eq!(region.len(), 100);
    assert_eq!(region.addr() % 64, 0);
    let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), region.len()) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(heap.live_bytes(), 100);
    heap.release(region);
    assert_eq!(heap.live_bytes(), 0);
    assert_eq!(heap.peak_bytes(), 100);
    assert!(heap.allocate(0).is_err());
}

#[test]
fn test_bounded_alloc() {
    let mut bounded = BoundedAllocator::new(HeapAllocator::new(), 128);
    let a = bounded.allocate(100).unwrap();
    assert!(matches!(bounded.allocate(29), Err(LayoutError::AllocationFailed { requested: 29 })));
    let b = bounded.allocate(28).unwrap();
    bounded.release(a);
    bounded.release(b);
    assert_eq!(bounded.live_bytes(), 0);
    let full = bounded.allocate(128).unwrap();
    bounded.release(full);
}
