//! Tier backed by one [`Page`] tree per memory kind.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{BPool, MemoryUsage, TierKind, TierUsage};
use crate::allocator::Allocator;
use crate::config::PagedConfig;
use crate::error::Result;
use crate::page::{MINIMUM_ALIGN, Page, align};
use crate::segment::{Region, Segment};

/// A page tree together with the segment it describes.
///
/// The segment is allocated on first use and dropped again by
/// [`PagedBPool::trim`] once the tree is idle.
struct Arena {
    direct: bool,
    page: Page,
    segment: Option<Arc<Segment>>,
}

impl Arena {
    fn new(direct: bool, capacity: usize) -> Result<Option<Self>> {
        if capacity == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            direct,
            page: Page::new(capacity)?,
            segment: None,
        }))
    }

    fn segment(&mut self, allocator: &Arc<dyn Allocator>) -> Result<Arc<Segment>> {
        if let Some(segment) = &self.segment {
            return Ok(Arc::clone(segment));
        }
        let len = self.page.total_space();
        let segment = if self.direct {
            Segment::direct(allocator, len)?
        } else {
            Segment::heap(len)
        };
        debug!(direct = self.direct, len, "paged tier mapped a segment");
        self.segment = Some(Arc::clone(&segment));
        Ok(segment)
    }

    fn owns(&self, region: &Region) -> bool {
        self.segment
            .as_ref()
            .is_some_and(|segment| Arc::ptr_eq(segment, region.segment()))
    }

    fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            used: self.page.used_space(),
            total: self.page.total_space(),
        }
    }
}

/// A tier that carves buffers out of a [`Page`] tree.
///
/// It supports zero-copy growth in both directions and releasing the tail of
/// a buffer, with 8-byte granularity.
pub struct PagedBPool {
    direct: Option<Arena>,
    heap: Option<Arena>,
    allocator: Arc<dyn Allocator>,
}

impl PagedBPool {
    /// Creates the tier. No memory is allocated until the first request.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`](crate::PoolError::InvalidConfig)
    /// or [`PoolError::InvalidCapacity`](crate::PoolError::InvalidCapacity) for
    /// an unusable configuration.
    pub fn new(config: &PagedConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            direct: Arena::new(true, config.direct_capacity)?,
            heap: Arena::new(false, config.heap_capacity)?,
            allocator,
        })
    }

    fn arena(&mut self, direct: bool) -> Option<&mut Arena> {
        if direct {
            self.direct.as_mut()
        } else {
            self.heap.as_mut()
        }
    }
}

impl BPool for PagedBPool {
    fn kind(&self) -> TierKind {
        TierKind::Paged
    }

    fn allocate(&mut self, direct: bool, capacity: usize) -> Result<Option<Region>> {
        let allocator = Arc::clone(&self.allocator);
        let Some(arena) = self.arena(direct) else {
            return Ok(None);
        };
        if capacity == 0 || capacity > arena.page.free_space() {
            return Ok(None);
        }
        let len = align(capacity);
        let Some(offset) = arena.page.alloc(len) else {
            return Ok(None);
        };
        let segment = match arena.segment(&allocator) {
            Ok(segment) => segment,
            Err(e) => {
                arena.page.free(offset, len);
                return Err(e);
            }
        };
        trace!(direct, offset, len, "paged allocate");
        Ok(Some(Region::new(segment, offset, len)))
    }

    fn reserve(&mut self, region: Region) {
        let Some(arena) = self.arena(region.is_direct()) else {
            return;
        };
        debug_assert!(arena.owns(&region), "{region:?} not issued by this tier");
        trace!(offset = region.offset(), len = region.len(), "paged reserve");
        arena.page.free(region.offset(), region.len());
    }

    fn expand(&mut self, region: &mut Region, more: usize, add_at_end: bool) -> bool {
        let Some(arena) = self.arena(region.is_direct()) else {
            return false;
        };
        debug_assert!(arena.owns(region), "{region:?} not issued by this tier");
        let more = align(more);
        if add_at_end {
            if !arena.page.alloc_after(region.offset(), region.len(), more) {
                return false;
            }
            region.extend_back(more);
        } else {
            if !arena.page.alloc_before(region.offset(), more) {
                return false;
            }
            region.extend_front(more);
        }
        true
    }

    fn shrink(&mut self, region: &mut Region, less: usize) -> usize {
        let Some(arena) = self.arena(region.is_direct()) else {
            return 0;
        };
        // keep at least one granule so the region stays releasable
        let release = (less & !(MINIMUM_ALIGN - 1)).min(region.len() - MINIMUM_ALIGN);
        if release == 0 {
            return 0;
        }
        arena.page.free(region.end() - release, release);
        region.truncate_back(release);
        release
    }

    fn owns(&self, region: &Region) -> bool {
        let arena = if region.is_direct() {
            &self.direct
        } else {
            &self.heap
        };
        arena.as_ref().is_some_and(|arena| arena.owns(region))
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            kind: TierKind::Paged,
            direct: self.direct.as_ref().map(Arena::usage).unwrap_or_default(),
            heap: self.heap.as_ref().map(Arena::usage).unwrap_or_default(),
        }
    }

    fn trim(&mut self) {
        for arena in [self.direct.as_mut(), self.heap.as_mut()].into_iter().flatten() {
            if arena.page.used_space() != 0 || arena.segment.is_none() {
                continue;
            }
            // nothing is live, so no bytes need to move
            arena.page.compress(|_, _, _| {});
            arena.segment = None;
            debug!(direct = arena.direct, "paged tier released an idle segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;

    fn tier(direct_capacity: usize, heap_capacity: usize) -> PagedBPool {
        let config = PagedConfig {
            direct_capacity,
            heap_capacity,
        };
        PagedBPool::new(&config, Arc::new(DefaultAllocator::new())).unwrap()
    }

    #[test]
    fn test_paged_allocate_and_reserve() {
        let mut tier = tier(64 * 1024, 4096);
        let a = tier.allocate(true, 100).unwrap().unwrap();
        let b = tier.allocate(true, 100).unwrap().unwrap();
        assert!(a.is_direct());
        assert_eq!((a.offset(), a.len()), (0, 104));
        assert_eq!(b.offset(), 104);
        assert!(tier.owns(&a));

        let h = tier.allocate(false, 64).unwrap().unwrap();
        assert!(!h.is_direct());
        assert!(!tier.owns(&Region::new(Segment::heap(64), 0, 64)));

        assert_eq!(tier.usage().direct.used, 208);
        tier.reserve(a);
        tier.reserve(b);
        tier.reserve(h);
        let usage = tier.usage();
        assert_eq!((usage.direct.used, usage.heap.used), (0, 0));
    }

    #[test]
    fn test_paged_declines() {
        let mut tier = tier(0, 4096);
        assert!(tier.allocate(true, 8).unwrap().is_none());
        assert!(tier.allocate(false, 8192).unwrap().is_none());
        assert!(tier.allocate(false, 0).unwrap().is_none());
    }

    struct FailingAllocator;

    impl Allocator for FailingAllocator {
        fn allocate(&self, size: usize) -> Result<std::ptr::NonNull<u8>> {
            Err(crate::PoolError::OutOfMemory(size))
        }

        unsafe fn deallocate(&self, _ptr: std::ptr::NonNull<u8>, _size: usize) {
            unreachable!("nothing was allocated");
        }
    }

    #[test]
    fn test_paged_failed_mapping_leaves_page_empty() {
        let config = PagedConfig {
            direct_capacity: 4096,
            heap_capacity: 4096,
        };
        let mut tier = PagedBPool::new(&config, Arc::new(FailingAllocator)).unwrap();
        assert_eq!(
            tier.allocate(true, 100).unwrap_err(),
            crate::PoolError::OutOfMemory(4096)
        );
        assert_eq!(tier.usage().direct.used, 0);
        assert!(tier.allocate(true, 5000).unwrap().is_none());

        // heap memory does not go through the allocator
        let region = tier.allocate(false, 100).unwrap().unwrap();
        assert_eq!(region.offset(), 0);
    }

    #[test]
    fn test_paged_expand_both_ways() {
        let mut tier = tier(4096, 0);
        let first = tier.allocate(true, 64).unwrap().unwrap();
        let mut second = tier.allocate(true, 16).unwrap().unwrap();
        tier.reserve(first);

        assert!(tier.expand(&mut second, 32, false));
        assert_eq!((second.offset(), second.len()), (32, 48));
        assert!(tier.expand(&mut second, 10, true));
        assert_eq!(second.end(), 96);

        // only 32 bytes are left in front of it
        assert!(!tier.expand(&mut second, 64, false));
        assert_eq!((second.offset(), second.len()), (32, 64));
        assert_eq!(tier.usage().direct.used, 64);
    }

    #[test]
    fn test_paged_shrink_keeps_a_granule() {
        let mut tier = tier(4096, 0);
        let mut region = tier.allocate(true, 256).unwrap().unwrap();
        assert_eq!(tier.shrink(&mut region, 100), 96);
        assert_eq!(region.len(), 160);
        assert_eq!(tier.shrink(&mut region, 4096), 152);
        assert_eq!(region.len(), 8);
        assert_eq!(tier.usage().direct.used, 8);
    }

    #[test]
    fn test_paged_trim_drops_idle_segment() {
        let mut tier = tier(4096, 4096);
        let region = tier.allocate(true, 512).unwrap().unwrap();
        let old = Arc::clone(region.segment());
        tier.trim();
        assert!(tier.owns(&region));

        tier.reserve(region);
        tier.trim();
        let region = tier.allocate(true, 512).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&old, region.segment()));
        assert_eq!(region.offset(), 0);
    }
}
