//! Backing memory segments and the regions tiers carve out of them.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::Allocator;
use crate::error::Result;

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

enum Backing {
    Direct(Arc<dyn Allocator>),
    Heap,
}

/// One contiguous block of backing memory.
///
/// Direct segments come from an [`Allocator`]; heap segments are boxed byte
/// slices. Either way the memory is released when the last `Arc<Segment>` is
/// dropped, so a segment outlives its pool while buffers still point into it.
pub struct Segment {
    id: u64,
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the segment exclusively owns its memory; concurrent access to the
// bytes is governed by the pool handing out disjoint regions.
unsafe impl Send for Segment {}
// SAFETY: see above; `&Segment` only exposes the base pointer and length.
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocates a direct segment of `len` bytes through `allocator`.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's failure.
    pub fn direct(allocator: &Arc<dyn Allocator>, len: usize) -> Result<Arc<Self>> {
        let ptr = allocator.allocate(len)?;
        Ok(Arc::new(Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            ptr,
            len,
            backing: Backing::Direct(Arc::clone(allocator)),
        }))
    }

    /// Allocates a zeroed heap segment of `len` bytes.
    #[must_use]
    pub fn heap(len: usize) -> Arc<Self> {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Arc::new(Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            ptr,
            len,
            backing: Backing::Heap,
        })
    }

    /// Process-unique identity of this segment.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Size of the segment in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length segment.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the memory came from a direct [`Allocator`].
    #[inline]
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        matches!(self.backing, Backing::Direct(_))
    }

    /// Base address of the segment.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match &self.backing {
            // SAFETY: ptr/len came from this allocator in `direct`
            Backing::Direct(allocator) => unsafe { allocator.deallocate(self.ptr, self.len) },
            Backing::Heap => {
                let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
                // SAFETY: the slice was leaked from a Box<[u8]> of this length in `heap`
                drop(unsafe { Box::from_raw(slice) });
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("direct", &self.is_direct())
            .finish_non_exhaustive()
    }
}

/// A byte range of a segment owned by exactly one buffer at a time.
#[derive(Clone)]
pub struct Region {
    segment: Arc<Segment>,
    offset: usize,
    len: usize,
}

impl Region {
    /// Creates a region over `[offset, offset + len)` of `segment`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit inside the segment.
    #[must_use]
    pub fn new(segment: Arc<Segment>, offset: usize, len: usize) -> Self {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= segment.len()),
            "region [{offset}, +{len}) outside a segment of {} bytes",
            segment.len()
        );
        Self {
            segment,
            offset,
            len,
        }
    }

    /// The segment this region lives in.
    #[inline]
    #[must_use]
    pub const fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Offset of the region within its segment.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length region.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region lives in direct memory.
    #[inline]
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.segment.is_direct()
    }

    /// Exclusive end offset.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Moves the start back by `bytes`, growing the region.
    pub(crate) fn extend_front(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.offset);
        self.offset -= bytes;
        self.len += bytes;
    }

    /// Moves the end forward by `bytes`, growing the region.
    pub(crate) fn extend_back(&mut self, bytes: usize) {
        debug_assert!(self.end() + bytes <= self.segment.len());
        self.len += bytes;
    }

    /// Cuts `bytes` off the end.
    pub(crate) fn truncate_back(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.len);
        self.len -= bytes;
    }

    /// Address of the byte at `at` within the region.
    pub(crate) fn ptr_at(&self, at: usize) -> NonNull<u8> {
        debug_assert!(at <= self.len);
        // SAFETY: offset + at stays within the segment (checked on construction
        // and by every resize)
        unsafe { self.segment.as_ptr().add(self.offset + at) }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("segment", &self.segment.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;

    #[test]
    fn test_heap_segment() {
        let segment = Segment::heap(1024);
        assert_eq!(segment.len(), 1024);
        assert!(!segment.is_direct());
        assert!(!segment.is_empty());
    }

    #[test]
    fn test_direct_segment() {
        let allocator: Arc<dyn Allocator> = Arc::new(DefaultAllocator::new());
        let segment = Segment::direct(&allocator, 8192).unwrap();
        assert!(segment.is_direct());
        assert_eq!(segment.as_ptr().as_ptr() as usize % DefaultAllocator::ALIGNMENT, 0);
    }

    #[test]
    fn test_segment_ids_are_unique() {
        let a = Segment::heap(16);
        let b = Segment::heap(16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_region_resize() {
        let mut region = Region::new(Segment::heap(256), 64, 32);
        region.extend_front(16);
        assert_eq!((region.offset(), region.len()), (48, 48));
        region.extend_back(8);
        assert_eq!(region.end(), 104);
        region.truncate_back(40);
        assert_eq!(region.len(), 16);
    }

    #[test]
    fn test_region_memory_kind() {
        let allocator: Arc<dyn Allocator> = Arc::new(DefaultAllocator::new());
        let direct = Region::new(Segment::direct(&allocator, 4096).unwrap(), 0, 64);
        let heap = Region::new(Segment::heap(4096), 64, 64);
        assert!(direct.is_direct());
        assert!(!heap.is_direct());
    }

    #[test]
    #[should_panic(expected = "outside a segment")]
    fn test_region_out_of_bounds() {
        let _ = Region::new(Segment::heap(64), 32, 64);
    }
}
