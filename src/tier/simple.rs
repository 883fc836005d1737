//! Whole-block cache tier.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{BPool, MemoryUsage, TierKind, TierUsage};
use crate::allocator::Allocator;
use crate::config::SimpleConfig;
use crate::error::Result;
use crate::segment::{Region, Segment};

/// A tier of whole segments, recycled through a size-ordered cache.
///
/// Every buffer gets a segment of its own. Returned segments are kept in a
/// list sorted by `(capacity, segment id)` and reused whole for any request
/// that fits; when the cache outgrows `max_count` the smallest block goes.
pub struct SimpleBPool {
    config: SimpleConfig,
    cache: Vec<Region>,
    issued: HashSet<u64>,
    used: [usize; 2],
    allocator: Arc<dyn Allocator>,
}

const fn kind_index(direct: bool) -> usize {
    if direct { 0 } else { 1 }
}

fn sort_key(region: &Region) -> (usize, u64) {
    (region.len(), region.segment().id())
}

impl SimpleBPool {
    /// Creates an empty tier.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`](crate::PoolError::InvalidConfig)
    /// for an unusable configuration.
    pub fn new(config: &SimpleConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: *config,
            cache: Vec::new(),
            issued: HashSet::new(),
            used: [0; 2],
            allocator,
        })
    }

    /// Number of blocks currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn take_cached(&mut self, direct: bool, size: usize) -> Option<Region> {
        let from = self.cache.partition_point(|region| region.len() < size);
        let index = self.cache[from..]
            .iter()
            .position(|region| region.is_direct() == direct)?;
        Some(self.cache.remove(from + index))
    }

    fn cached_bytes(&self, direct: bool) -> usize {
        self.cache
            .iter()
            .filter(|region| region.is_direct() == direct)
            .map(Region::len)
            .sum()
    }
}

impl BPool for SimpleBPool {
    fn kind(&self) -> TierKind {
        TierKind::Simple
    }

    fn allocate(&mut self, direct: bool, capacity: usize) -> Result<Option<Region>> {
        if capacity == 0 || capacity > self.config.max_size {
            return Ok(None);
        }
        let size = capacity.max(self.config.min_size);
        let region = if let Some(region) = self.take_cached(direct, size) {
            trace!(direct, size, len = region.len(), "simple allocate from cache");
            region
        } else {
            let segment = if direct {
                Segment::direct(&self.allocator, size)?
            } else {
                Segment::heap(size)
            };
            trace!(direct, size, "simple allocate fresh block");
            Region::new(segment, 0, size)
        };
        self.issued.insert(region.segment().id());
        self.used[kind_index(direct)] += region.len();
        Ok(Some(region))
    }

    fn reserve(&mut self, region: Region) {
        debug_assert!(self.owns(&region), "{region:?} not issued by this tier");
        debug_assert_eq!(region.offset(), 0);
        self.issued.remove(&region.segment().id());
        self.used[kind_index(region.is_direct())] -= region.len();

        let key = sort_key(&region);
        let at = self.cache.partition_point(|cached| sort_key(cached) < key);
        self.cache.insert(at, region);
        if self.cache.len() > self.config.max_count {
            let evicted = self.cache.remove(0);
            trace!(len = evicted.len(), "simple cache evicted a block");
        }
    }

    fn owns(&self, region: &Region) -> bool {
        self.issued.contains(&region.segment().id())
    }

    fn usage(&self) -> TierUsage {
        let usage = |direct: bool| {
            let used = self.used[kind_index(direct)];
            MemoryUsage {
                used,
                total: used + self.cached_bytes(direct),
            }
        };
        TierUsage {
            kind: TierKind::Simple,
            direct: usage(true),
            heap: usage(false),
        }
    }

    fn trim(&mut self) {
        if !self.cache.is_empty() {
            debug!(blocks = self.cache.len(), "simple tier dropped its cache");
            self.cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::DefaultAllocator;

    fn tier(min_size: usize, max_size: usize, max_count: usize) -> SimpleBPool {
        let config = SimpleConfig {
            min_size,
            max_size,
            max_count,
        };
        SimpleBPool::new(&config, Arc::new(DefaultAllocator::new())).unwrap()
    }

    #[test]
    fn test_simple_cache_is_capped() {
        let mut tier = tier(16, 1024, 4);
        let blocks: Vec<_> = (0..5)
            .map(|_| tier.allocate(false, 100).unwrap().unwrap())
            .collect();
        let first = blocks[0].segment().id();
        for block in blocks {
            tier.reserve(block);
        }
        assert_eq!(tier.cached(), 4);
        // equal sizes order by segment id, so the oldest block went first
        assert!(tier.cache.iter().all(|region| region.segment().id() != first));
    }

    #[test]
    fn test_simple_reuses_smallest_fitting_block() {
        let mut tier = tier(16, 1024, 4);
        let small = tier.allocate(true, 100).unwrap().unwrap();
        let large = tier.allocate(true, 800).unwrap().unwrap();
        let heap = tier.allocate(false, 200).unwrap().unwrap();
        let (small_id, large_id) = (small.segment().id(), large.segment().id());
        tier.reserve(large);
        tier.reserve(small);
        tier.reserve(heap);

        let got = tier.allocate(true, 50).unwrap().unwrap();
        assert_eq!(got.segment().id(), small_id);
        assert_eq!(got.len(), 100);

        // the heap block is big enough but of the wrong kind
        let got = tier.allocate(true, 150).unwrap().unwrap();
        assert_eq!(got.segment().id(), large_id);
        assert_eq!(tier.cached(), 1);
    }

    #[test]
    fn test_simple_bounds() {
        let mut tier = tier(64, 1024, 2);
        assert!(tier.allocate(true, 1025).unwrap().is_none());
        let region = tier.allocate(false, 1).unwrap().unwrap();
        assert_eq!(region.len(), 64);
        assert!(tier.owns(&region));

        let usage = tier.usage();
        assert_eq!((usage.heap.used, usage.heap.total), (64, 64));
        tier.reserve(region);
        assert_eq!(tier.usage().heap, MemoryUsage { used: 0, total: 64 });

        tier.trim();
        assert_eq!(tier.cached(), 0);
        assert_eq!(tier.usage().heap.total, 0);
    }

    #[test]
    fn test_simple_has_no_expand() {
        let mut tier = tier(16, 1024, 2);
        let mut region = tier.allocate(true, 100).unwrap().unwrap();
        assert!(!tier.expand(&mut region, 8, true));
        assert_eq!(tier.shrink(&mut region, 50), 0);
    }
}
