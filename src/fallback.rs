//! Memory a pool falls back to once its own tiers are full.
//!
//! A [`SharedTier`] is a paged tier behind its own lock that any number of
//! pools can use; by default every pool uses one process-wide instance. An
//! [`UnpooledBudget`] caps how many bytes may live in standalone segments,
//! the last resort when the shared tier is full as well.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::allocator::{Allocator, DefaultAllocator};
use crate::config::PagedConfig;
use crate::error::Result;
use crate::segment::{Region, Segment};
use crate::tier::{BPool, PagedBPool, TierUsage};

/// Capacity of each memory kind in the process-wide shared tier.
pub const GLOBAL_SHARED_CAPACITY: usize = 4 * 1024 * 1024;

/// Bytes the process-wide budget allows in unpooled segments.
pub const GLOBAL_UNPOOLED_BUDGET: usize = 10 * 1024 * 1024;

static GLOBAL_SHARED: OnceLock<Arc<SharedTier>> = OnceLock::new();
static GLOBAL_UNPOOLED: OnceLock<Arc<UnpooledBudget>> = OnceLock::new();

/// A paged tier shared between pools.
///
/// Every call locks the tier for its duration. Buffers carved out of it go
/// back to it even if the pool that issued them is gone.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use ruapc_bpool::{BufferPoolBuilder, DefaultAllocator, PagedConfig, SharedTier};
///
/// # fn main() -> ruapc_bpool::Result<()> {
/// let shared = SharedTier::new(&PagedConfig::default(), Arc::new(DefaultAllocator::new()))?;
/// let a = BufferPoolBuilder::new().shared(Some(Arc::clone(&shared))).build()?;
/// let b = BufferPoolBuilder::new().shared(Some(shared)).build()?;
/// assert_ne!(a.id(), b.id());
/// # Ok(())
/// # }
/// ```
pub struct SharedTier {
    tier: Mutex<PagedBPool>,
}

impl SharedTier {
    /// Creates a shared tier of its own.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`](crate::PoolError::InvalidConfig)
    /// or [`PoolError::InvalidCapacity`](crate::PoolError::InvalidCapacity) for
    /// an unusable configuration.
    pub fn new(config: &PagedConfig, allocator: Arc<dyn Allocator>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tier: Mutex::new(PagedBPool::new(config, allocator)?),
        }))
    }

    /// The process-wide shared tier, [`GLOBAL_SHARED_CAPACITY`] bytes of each
    /// memory kind over the [`DefaultAllocator`], created on first use.
    ///
    /// # Errors
    ///
    /// Only if the tier cannot be built, which the fixed configuration rules
    /// out.
    pub fn global() -> Result<Arc<Self>> {
        if let Some(shared) = GLOBAL_SHARED.get() {
            return Ok(Arc::clone(shared));
        }
        let config = PagedConfig {
            direct_capacity: GLOBAL_SHARED_CAPACITY,
            heap_capacity: GLOBAL_SHARED_CAPACITY,
        };
        let candidate = Self::new(&config, Arc::new(DefaultAllocator::new()))?;
        // a racing thread may have won; either way one instance is kept
        Ok(Arc::clone(GLOBAL_SHARED.get_or_init(|| candidate)))
    }

    pub(crate) fn allocate(&self, direct: bool, capacity: usize) -> Result<Option<Region>> {
        self.tier.lock().allocate(direct, capacity)
    }

    pub(crate) fn reserve(&self, region: Region) {
        self.tier.lock().reserve(region);
    }

    pub(crate) fn expand(&self, region: &mut Region, more: usize, add_at_end: bool) -> bool {
        self.tier.lock().expand(region, more, add_at_end)
    }

    pub(crate) fn shrink(&self, region: &mut Region, less: usize) -> usize {
        self.tier.lock().shrink(region, less)
    }

    pub(crate) fn owns(&self, region: &Region) -> bool {
        self.tier.lock().owns(region)
    }

    /// Current usage across every pool using the tier.
    #[must_use]
    pub fn usage(&self) -> TierUsage {
        self.tier.lock().usage()
    }

    /// Releases segments no buffer uses.
    pub fn trim(&self) {
        self.tier.lock().trim();
    }
}

impl std::fmt::Debug for SharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("usage", &self.usage())
            .finish()
    }
}

/// Limit on the bytes held by unpooled segments.
///
/// A request that no tier can serve gets a segment of its own as long as the
/// budget covers it; the bytes are credited back when the buffer returns.
#[derive(Debug)]
pub struct UnpooledBudget {
    capacity: usize,
    remaining: AtomicUsize,
}

impl UnpooledBudget {
    /// Creates a budget of `capacity` bytes; 0 disables unpooled buffers.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            remaining: AtomicUsize::new(capacity),
        })
    }

    /// The process-wide budget of [`GLOBAL_UNPOOLED_BUDGET`] bytes.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_UNPOOLED.get_or_init(|| Self::new(GLOBAL_UNPOOLED_BUDGET)))
    }

    /// Bytes the budget started with.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Takes `len` bytes out of the budget, all or nothing.
    fn take(&self, len: usize) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(len)
            })
            .is_ok()
    }

    pub(crate) fn give_back(&self, len: usize) {
        let before = self.remaining.fetch_add(len, Ordering::AcqRel);
        debug_assert!(before + len <= self.capacity, "unpooled budget over-credited");
    }

    /// Allocates a standalone segment of `len` bytes charged to the budget.
    ///
    /// Returns `Ok(None)` when the budget is short.
    pub(crate) fn allocate(
        &self,
        allocator: &Arc<dyn Allocator>,
        direct: bool,
        len: usize,
    ) -> Result<Option<Region>> {
        if !self.take(len) {
            debug!(len, remaining = self.remaining(), "unpooled budget exhausted");
            return Ok(None);
        }
        let segment = if direct {
            match Segment::direct(allocator, len) {
                Ok(segment) => segment,
                Err(e) => {
                    self.give_back(len);
                    return Err(e);
                }
            }
        } else {
            Segment::heap(len)
        };
        Ok(Some(Region::new(segment, 0, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolError;

    #[test]
    fn test_budget_is_all_or_nothing() {
        let budget = UnpooledBudget::new(1000);
        let allocator: Arc<dyn Allocator> = Arc::new(DefaultAllocator::new());

        let a = budget.allocate(&allocator, false, 600).unwrap().unwrap();
        assert_eq!((a.offset(), a.len()), (0, 600));
        assert_eq!(budget.remaining(), 400);
        assert!(budget.allocate(&allocator, true, 401).unwrap().is_none());
        assert_eq!(budget.remaining(), 400);

        budget.give_back(a.len());
        assert_eq!(budget.remaining(), budget.capacity());
    }

    #[test]
    fn test_budget_refunds_failed_segment() {
        let budget = UnpooledBudget::new(usize::MAX);
        // covered by the budget, but a layout the default allocator rejects
        let allocator: Arc<dyn Allocator> = Arc::new(DefaultAllocator::new());
        let result = budget.allocate(&allocator, true, usize::MAX / 2 + 1);
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
        assert_eq!(budget.remaining(), usize::MAX);
    }

    #[test]
    fn test_global_instances_are_shared() {
        assert!(Arc::ptr_eq(&UnpooledBudget::global(), &UnpooledBudget::global()));
        let shared = SharedTier::global().unwrap();
        assert!(Arc::ptr_eq(&shared, &SharedTier::global().unwrap()));
        assert_eq!(shared.usage().direct.total, GLOBAL_SHARED_CAPACITY);
    }

    #[test]
    fn test_shared_tier_round_trip() {
        let config = PagedConfig {
            direct_capacity: 4096,
            heap_capacity: 0,
        };
        let shared = SharedTier::new(&config, Arc::new(DefaultAllocator::new())).unwrap();
        let mut region = shared.allocate(true, 100).unwrap().unwrap();
        assert!(shared.owns(&region));
        assert!(shared.expand(&mut region, 8, true));
        assert_eq!(shared.usage().direct.used, 112);
        assert_eq!(shared.shrink(&mut region, 8), 8);
        shared.reserve(region);
        assert_eq!(shared.usage().direct.used, 0);
        assert!(shared.allocate(false, 8).unwrap().is_none());
    }
}
