//! Flat chunk bitmap tier.

use std::sync::Arc;

use fixedbitset::FixedBitSet;
use tracing::{debug, trace};

use super::{BPool, MemoryUsage, TierKind, TierUsage};
use crate::allocator::Allocator;
use crate::config::BitmapConfig;
use crate::error::Result;
use crate::segment::{Region, Segment};

/// Occupancy of one memory kind, one bit per chunk.
struct Chunks {
    direct: bool,
    bits: FixedBitSet,
    segment: Option<Arc<Segment>>,
}

impl Chunks {
    fn new(direct: bool, chunks: usize) -> Self {
        Self {
            direct,
            bits: FixedBitSet::with_capacity(chunks),
            segment: None,
        }
    }

    /// First run of `blocks` clear bits.
    fn first_fit(&self, blocks: usize) -> Option<usize> {
        let mut start = 0;
        while start + blocks <= self.bits.len() {
            match (start..start + blocks).rev().find(|&bit| self.bits.contains(bit)) {
                None => return Some(start),
                Some(taken) => start = taken + 1,
            }
        }
        None
    }

    fn is_clear(&self, from: usize, to: usize) -> bool {
        to <= self.bits.len() && self.bits.count_ones(from..to) == 0
    }
}

/// A single-level bitmap allocator over fixed-size chunks.
///
/// Requests above half the capacity are declined so larger buffers go to a
/// later tier. Buffers can grow in place by whole chunks in either direction.
pub struct BitmapBPool {
    chunk: usize,
    capacity: usize,
    direct: Chunks,
    heap: Chunks,
    allocator: Arc<dyn Allocator>,
}

impl BitmapBPool {
    /// Creates the tier. No memory is allocated until the first request.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`](crate::PoolError::InvalidConfig)
    /// for an unusable configuration.
    pub fn new(config: &BitmapConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            chunk: config.chunk_size,
            capacity: config.capacity,
            direct: Chunks::new(true, config.chunks()),
            heap: Chunks::new(false, config.chunks()),
            allocator,
        })
    }

    /// Allocation granularity in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn chunks(&mut self, direct: bool) -> &mut Chunks {
        if direct { &mut self.direct } else { &mut self.heap }
    }

    fn chunk_range(&self, region: &Region) -> (usize, usize) {
        debug_assert_eq!(region.offset() % self.chunk, 0);
        debug_assert_eq!(region.len() % self.chunk, 0);
        (region.offset() / self.chunk, region.end() / self.chunk)
    }
}

impl BPool for BitmapBPool {
    fn kind(&self) -> TierKind {
        TierKind::Bitmap
    }

    fn allocate(&mut self, direct: bool, capacity: usize) -> Result<Option<Region>> {
        if capacity == 0 || capacity > self.capacity / 2 {
            return Ok(None);
        }
        let blocks = capacity.div_ceil(self.chunk);
        let (chunk, len) = (self.chunk, self.capacity);
        let allocator = Arc::clone(&self.allocator);
        let chunks = self.chunks(direct);
        let Some(start) = chunks.first_fit(blocks) else {
            return Ok(None);
        };

        let segment = match &chunks.segment {
            Some(segment) => Arc::clone(segment),
            None => {
                let segment = if direct {
                    Segment::direct(&allocator, len)?
                } else {
                    Segment::heap(len)
                };
                debug!(direct, len, "bitmap tier mapped a segment");
                chunks.segment = Some(Arc::clone(&segment));
                segment
            }
        };

        chunks.bits.insert_range(start..start + blocks);
        trace!(direct, start, blocks, "bitmap allocate");
        Ok(Some(Region::new(segment, start * chunk, blocks * chunk)))
    }

    fn reserve(&mut self, region: Region) {
        debug_assert!(self.owns(&region), "{region:?} not issued by this tier");
        let (from, to) = self.chunk_range(&region);
        trace!(from, to, "bitmap reserve");
        let chunks = self.chunks(region.is_direct());
        debug_assert_eq!(chunks.bits.count_ones(from..to), to - from);
        chunks.bits.set_range(from..to, false);
    }

    fn expand(&mut self, region: &mut Region, more: usize, add_at_end: bool) -> bool {
        let blocks = more.div_ceil(self.chunk);
        let bytes = blocks * self.chunk;
        let (from, to) = self.chunk_range(region);
        let chunks = self.chunks(region.is_direct());
        if add_at_end {
            // insert after
            if !chunks.is_clear(to, to + blocks) {
                return false;
            }
            chunks.bits.insert_range(to..to + blocks);
            region.extend_back(bytes);
        } else {
            // insert before
            if blocks > from || !chunks.is_clear(from - blocks, from) {
                return false;
            }
            chunks.bits.insert_range(from - blocks..from);
            region.extend_front(bytes);
        }
        true
    }

    fn shrink(&mut self, region: &mut Region, less: usize) -> usize {
        let (from, to) = self.chunk_range(region);
        let blocks = (less / self.chunk).min(to - from - 1);
        if blocks == 0 {
            return 0;
        }
        let bytes = blocks * self.chunk;
        self.chunks(region.is_direct())
            .bits
            .set_range(to - blocks..to, false);
        region.truncate_back(bytes);
        bytes
    }

    fn owns(&self, region: &Region) -> bool {
        let chunks = if region.is_direct() {
            &self.direct
        } else {
            &self.heap
        };
        chunks
            .segment
            .as_ref()
            .is_some_and(|segment| Arc::ptr_eq(segment, region.segment()))
    }

    fn usage(&self) -> TierUsage {
        let usage = |chunks: &Chunks| MemoryUsage {
            used: chunks.bits.count_ones(..) * self.chunk,
            total: self.capacity,
        };
        TierUsage {
            kind: TierKind::Bitmap,
            direct: usage(&self.direct),
            heap: usage(&self.heap),
        }
    }

    fn trim(&mut self) {
        for chunks in [&mut self.direct, &mut self.heap] {
            if chunks.segment.is_some() && chunks.bits.is_clear() {
                chunks.segment = None;
                debug!(direct = chunks.direct, "bitmap tier released an idle segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;

    fn tier() -> BitmapBPool {
        let config = BitmapConfig {
            chunk_size: 512,
            capacity: 8 * 1024,
        };
        BitmapBPool::new(&config, Arc::new(DefaultAllocator::new())).unwrap()
    }

    #[test]
    fn test_bitmap_first_fit() {
        let mut tier = tier();
        let a = tier.allocate(true, 100).unwrap().unwrap();
        let b = tier.allocate(true, 1000).unwrap().unwrap();
        let c = tier.allocate(true, 512).unwrap().unwrap();
        assert_eq!((a.offset(), a.len()), (0, 512));
        assert_eq!((b.offset(), b.len()), (512, 1024));
        assert_eq!(c.offset(), 1536);

        tier.reserve(b);
        // the hole left by `b` is reused
        let d = tier.allocate(true, 600).unwrap().unwrap();
        assert_eq!(d.offset(), 512);
        // a, c and the two chunks of d
        assert_eq!(tier.usage().direct.used, 2 * 1024);
    }

    #[test]
    fn test_bitmap_rejects_large_requests() {
        let mut tier = tier();
        assert!(tier.allocate(true, 4 * 1024).unwrap().is_some());
        assert!(tier.allocate(true, 4 * 1024 + 1).unwrap().is_none());
        assert!(tier.allocate(false, 0).unwrap().is_none());
    }

    #[test]
    fn test_bitmap_exhaustion() {
        let mut tier = tier();
        let _a = tier.allocate(false, 4096).unwrap().unwrap();
        let _b = tier.allocate(false, 4096).unwrap().unwrap();
        assert!(tier.allocate(false, 1).unwrap().is_none());
        // the direct side is independent
        assert!(tier.allocate(true, 1).unwrap().is_some());
    }

    #[test]
    fn test_bitmap_insert_before_and_after() {
        let mut tier = tier();
        let a = tier.allocate(true, 512).unwrap().unwrap();
        let mut b = tier.allocate(true, 512).unwrap().unwrap();
        let c = tier.allocate(true, 512).unwrap().unwrap();

        assert!(!tier.expand(&mut b, 1, true));
        assert!(!tier.expand(&mut b, 1, false));

        tier.reserve(a);
        tier.reserve(c);
        assert!(tier.expand(&mut b, 100, false));
        assert_eq!((b.offset(), b.len()), (0, 1024));
        assert!(tier.expand(&mut b, 1024, true));
        assert_eq!(b.len(), 2048);
        assert!(!tier.expand(&mut b, 512, false));

        assert_eq!(tier.shrink(&mut b, 1500), 1024);
        assert_eq!(b.len(), 1024);
        assert_eq!(tier.usage().direct.used, 1024);
    }

    #[test]
    fn test_bitmap_trim() {
        let mut tier = tier();
        let region = tier.allocate(false, 64).unwrap().unwrap();
        assert!(tier.owns(&region));
        tier.reserve(region.clone());
        tier.trim();
        assert!(!tier.owns(&region));
    }
}
