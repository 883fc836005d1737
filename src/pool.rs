//! The tiered buffer pool facade.
//!
//! This module provides the [`BufferPool`] and [`BufferPoolBuilder`] types.
//! A pool owns an ordered list of tiers ([`BPool`] implementations); requests
//! go to each tier in turn, direct memory first, and every buffer remembers
//! which tier it came from so returns and growth go straight back to it.
//! When the pool's own tiers are full it falls back to a [`SharedTier`] and
//! finally to standalone segments charged to an [`UnpooledBudget`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::allocator::{Allocator, DefaultAllocator};
use crate::buffer::{Buffer, Lease, Origin, PooledBuffer, ReturnInfo};
use crate::config::{LeakConfig, TierConfig};
use crate::error::{PoolError, Result};
use crate::fallback::{SharedTier, UnpooledBudget};
use crate::leak::{LeakDetector, LeakReport};
use crate::segment::Region;
use crate::tier::{BPool, BitmapBPool, MemoryUsage, PagedBPool, SimpleBPool, TierUsage};

/// Default bytes kept free in front of every buffer.
pub const DEFAULT_HEADROOM: usize = 16;

/// Default time without allocations after which idle memory is released.
pub const DEFAULT_IDLE_RELEASE: Duration = Duration::from_secs(60);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL_POOL: BufferPool = BufferPool::new();
}

/// Builder for creating a [`BufferPool`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use ruapc_bpool::{BufferPoolBuilder, PagedConfig, SimpleConfig, TierConfig};
///
/// # fn main() -> ruapc_bpool::Result<()> {
/// let pool = BufferPoolBuilder::new()
///     .tier(TierConfig::Paged(PagedConfig {
///         direct_capacity: 64 * 1024,
///         heap_capacity: 0,
///     }))
///     .tier(TierConfig::Simple(SimpleConfig::default()))
///     .headroom(32)
///     .build()?;
/// assert_eq!(pool.buffer(100)?.headroom(), 32);
/// # Ok(())
/// # }
/// ```
pub struct BufferPoolBuilder {
    tiers: Vec<TierConfig>,
    headroom: usize,
    allocator: Arc<dyn Allocator>,
    leak_detection: Option<LeakConfig>,
    shared: SharedChoice,
    large_threshold: usize,
    unpooled: Option<Arc<UnpooledBudget>>,
    idle_release: Option<Duration>,
}

/// The shared tier a builder hands to its pool.
enum SharedChoice {
    Global,
    Given(Option<Arc<SharedTier>>),
}

impl Default for BufferPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPoolBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - Tiers: [`TierConfig::defaults`] (paged, bitmap, simple)
    /// - Headroom: [`DEFAULT_HEADROOM`] bytes
    /// - Allocator: [`DefaultAllocator`]
    /// - Leak detection: off
    /// - Shared tier: [`SharedTier::global`], tried after the pool's tiers
    /// - Unpooled segments: [`UnpooledBudget::global`]
    /// - Idle release: after [`DEFAULT_IDLE_RELEASE`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiers: Vec::new(),
            headroom: DEFAULT_HEADROOM,
            allocator: Arc::new(DefaultAllocator::new()),
            leak_detection: None,
            shared: SharedChoice::Global,
            large_threshold: 0,
            unpooled: Some(UnpooledBudget::global()),
            idle_release: Some(DEFAULT_IDLE_RELEASE),
        }
    }

    /// Appends a tier. Once any tier is given, the default stack is not used.
    #[must_use]
    pub fn tier(mut self, tier: TierConfig) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Sets the bytes kept free in front of every buffer.
    #[must_use]
    pub const fn headroom(mut self, headroom: usize) -> Self {
        self.headroom = headroom;
        self
    }

    /// Sets a custom allocator for direct memory.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Enables sampling leak detection.
    #[must_use]
    pub const fn leak_detection(mut self, config: LeakConfig) -> Self {
        self.leak_detection = Some(config);
        self
    }

    /// Sets the shared tier used once the pool's own tiers are full; `None`
    /// keeps the pool to itself.
    #[must_use]
    pub fn shared(mut self, shared: Option<Arc<SharedTier>>) -> Self {
        self.shared = SharedChoice::Given(shared);
        self
    }

    /// Requests of at least `threshold` bytes, headroom included, try the
    /// shared tier before the pool's own tiers. 0 turns this off.
    #[must_use]
    pub const fn large_threshold(mut self, threshold: usize) -> Self {
        self.large_threshold = threshold;
        self
    }

    /// Sets the budget for standalone segments, the last resort once every
    /// tier is full; `None` fails such requests instead.
    #[must_use]
    pub fn unpooled(mut self, budget: Option<Arc<UnpooledBudget>>) -> Self {
        self.unpooled = budget;
        self
    }

    /// Releases backing memory no buffer uses once nothing was allocated for
    /// `after`; `None` leaves that to [`BufferPool::trim`].
    ///
    /// The check runs at the start of every pool operation.
    #[must_use]
    pub const fn idle_release(mut self, after: Option<Duration>) -> Self {
        self.idle_release = after;
        self
    }

    /// Validates the configuration and builds the pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] or [`PoolError::InvalidCapacity`]
    /// describing the first unusable setting.
    pub fn build(self) -> Result<BufferPool> {
        let shared = match self.shared {
            SharedChoice::Global => Some(SharedTier::global()?),
            SharedChoice::Given(shared) => shared,
        };
        let configs = if self.tiers.is_empty() {
            TierConfig::defaults()
        } else {
            self.tiers
        };
        let tiers = configs
            .iter()
            .map(|config| build_tier(config, &self.allocator))
            .collect::<Result<Vec<_>>>()?;
        let leaks = match self.leak_detection {
            Some(config) => {
                config.validate()?;
                Some(LeakDetector::new(&config))
            }
            None => None,
        };

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (return_tx, return_rx) = mpsc::unbounded_channel();
        debug!(id, tiers = tiers.len(), headroom = self.headroom, "buffer pool created");

        let inner = PoolInner {
            id,
            tiers,
            headroom: self.headroom,
            allocator: self.allocator,
            shared,
            large_threshold: self.large_threshold,
            unpooled: self.unpooled,
            idle_release: self.idle_release,
            idle_since: Instant::now(),
            next_serial: 0,
            zero_copy_expansions: 0,
            copied_expansions: 0,
            leaks,
            return_rx,
            return_tx: Arc::new(return_tx),
        };

        Ok(BufferPool {
            id,
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

fn build_tier(config: &TierConfig, allocator: &Arc<dyn Allocator>) -> Result<Box<dyn BPool>> {
    let allocator = Arc::clone(allocator);
    Ok(match config {
        TierConfig::Paged(config) => Box::new(PagedBPool::new(config, allocator)?),
        TierConfig::Bitmap(config) => Box::new(BitmapBPool::new(config, allocator)?),
        TierConfig::Simple(config) => Box::new(SimpleBPool::new(config, allocator)?),
    })
}

/// A tiered pool of byte buffers.
///
/// Every public operation takes one lock for the whole pool. The lock is a
/// `parking_lot` mutex, so the pool can be used from synchronous code and from
/// inside async runtimes alike. Cloning a pool shares its state.
///
/// # Example
///
/// ```rust
/// use ruapc_bpool::BufferPoolBuilder;
///
/// # fn main() -> ruapc_bpool::Result<()> {
/// let pool = BufferPoolBuilder::new().build()?;
///
/// let mut buffer = pool.buffer(100)?;
/// buffer[..5].copy_from_slice(b"hello");
///
/// // Grow at the end; the data stays where it is if the tier has room
/// pool.expand(&mut buffer, 50, true, true)?;
/// assert_eq!(buffer.len(), 150);
/// assert_eq!(&buffer[..5], b"hello");
///
/// pool.reserve(buffer)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BufferPool {
    id: u64,
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    /// Creates a new buffer pool with default settings.
    ///
    /// This is equivalent to `BufferPoolBuilder::new().build()`.
    ///
    /// # Panics
    ///
    /// Never in practice: the default configuration is always valid.
    #[must_use]
    pub fn new() -> Self {
        BufferPoolBuilder::new()
            .build()
            .expect("default pool configuration is valid")
    }

    /// The pool of the calling thread, created on first use.
    ///
    /// Each worker thread gets its own pool so buffer churn does not contend
    /// on a shared lock; the pool is torn down with its thread. Buffers may
    /// still be moved to and dropped on other threads.
    #[must_use]
    pub fn local() -> Self {
        LOCAL_POOL.with(Clone::clone)
    }

    /// Process-unique identity of the pool.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Allocates a buffer of `capacity` bytes, trying direct memory in every
    /// tier before falling back to heap memory.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when no tier can satisfy the request,
    /// or the allocator's error when backing memory could not be obtained.
    pub fn buffer(&self, capacity: usize) -> Result<Buffer> {
        let mut inner = self.inner.lock();
        inner.maintain();
        let headroom = inner.headroom;
        inner.allocate(&[true, false], capacity, headroom)
    }

    /// Allocates a buffer of `capacity` bytes of the given memory kind only.
    ///
    /// # Errors
    ///
    /// As for [`buffer`](Self::buffer).
    pub fn buffer_in(&self, direct: bool, capacity: usize) -> Result<Buffer> {
        let mut inner = self.inner.lock();
        inner.maintain();
        let headroom = inner.headroom;
        inner.allocate(&[direct], capacity, headroom)
    }

    /// Allocates a buffer with an explicit amount of headroom.
    ///
    /// A request of zero bytes in total returns an empty, unpooled buffer.
    ///
    /// # Errors
    ///
    /// As for [`buffer`](Self::buffer).
    pub fn buffer_with_headroom(
        &self,
        direct: bool,
        capacity: usize,
        headroom: usize,
    ) -> Result<Buffer> {
        let mut inner = self.inner.lock();
        inner.maintain();
        inner.allocate(&[direct], capacity, headroom)
    }

    /// Returns `buf` to the tier it came from.
    ///
    /// Dropping a buffer does the same lazily; reserving hands it back
    /// immediately. The empty sentinel is accepted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Foreign`] if `buf` belongs to another pool. The
    /// buffer then still goes back to its own pool when it is dropped.
    pub fn reserve(&self, mut buf: Buffer) -> Result<()> {
        self.check_owner(&buf)?;
        let Some(lease) = buf.take_lease() else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        inner.maintain();
        inner.release(lease.origin, lease.region, lease.serial);
        Ok(())
    }

    /// Grows `buf` by `more` bytes, at the end or at the front.
    ///
    /// The buffer grows in place when it can: at the end into its slack and
    /// then into adjacent free bytes of its tier; at the front into its
    /// headroom and then into the free bytes right before its region. The
    /// existing bytes keep their address and, for front growth, the new bytes
    /// come before them.
    ///
    /// Otherwise a buffer of `len + more` bytes of the same memory kind is
    /// allocated, the data copied over (to offset `more` for front growth)
    /// and `*buf` rebound to it. The old buffer is reserved when
    /// `reserve_old` is set and returned to the caller otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Foreign`] for a buffer of another pool, or the
    /// allocation error of the copy.
    pub fn expand(
        &self,
        buf: &mut Buffer,
        more: usize,
        add_at_end: bool,
        reserve_old: bool,
    ) -> Result<Option<Buffer>> {
        self.check_owner(buf)?;
        if more == 0 {
            return Ok(None);
        }
        let mut inner = self.inner.lock();
        inner.maintain();

        if inner.expand_in_place(buf, more, add_at_end) {
            inner.zero_copy_expansions += 1;
            trace!(more, add_at_end, len = buf.len(), "zero-copy expand");
            return Ok(None);
        }

        let headroom = inner.headroom;
        let mut grown = inner.allocate(&[buf.is_direct()], buf.len() + more, headroom)?;
        let at = if add_at_end { 0 } else { more };
        grown[at..at + buf.len()].copy_from_slice(buf.as_slice());
        inner.copied_expansions += 1;
        debug!(more, add_at_end, len = grown.len(), "expand by copy");

        let mut old = std::mem::replace(buf, grown);
        if !reserve_old {
            return Ok(Some(old));
        }
        if let Some(lease) = old.take_lease() {
            inner.release(lease.origin, lease.region, lease.serial);
        }
        Ok(None)
    }

    /// Drops `less` bytes off the end of `buf`.
    ///
    /// Whole granules of the freed tail go back to the tier when it supports
    /// it; the rest stays as slack for later growth.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShrinkTooLarge`] if `less` exceeds the length and
    /// [`PoolError::Foreign`] for a buffer of another pool.
    pub fn shrink(&self, buf: &mut Buffer, less: usize) -> Result<()> {
        if less > buf.len() {
            return Err(PoolError::ShrinkTooLarge {
                len: buf.len(),
                less,
            });
        }
        self.check_owner(buf)?;
        let mut inner = self.inner.lock();
        inner.maintain();

        let (lease, start, len) = buf.parts_mut();
        *len -= less;
        if let Some(lease) = lease {
            let slack = lease.region.len() - *start - *len;
            let released = inner.shrink_region(&lease.origin, &mut lease.region, slack);
            trace!(less, released, "shrink");
        }
        Ok(())
    }

    /// Whether `buf` was handed out by this pool.
    #[must_use]
    pub fn is_pooled(&self, buf: &Buffer) -> bool {
        buf.owner() == Some(self.id)
    }

    /// Per-tier usage, fallback usage and expansion counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut inner = self.inner.lock();
        inner.maintain();
        PoolStats {
            id: self.id,
            tiers: inner.tiers.iter().map(|tier| tier.usage()).collect(),
            shared: inner.shared.as_ref().map(|shared| shared.usage()),
            unpooled: inner.unpooled.as_ref().map(|budget| MemoryUsage {
                used: budget.capacity() - budget.remaining(),
                total: budget.capacity(),
            }),
            zero_copy_expansions: inner.zero_copy_expansions,
            copied_expansions: inner.copied_expansions,
            leak_samples: inner.leaks.as_ref().map_or(0, LeakDetector::outstanding),
        }
    }

    /// Releases backing memory that no buffer uses, in the pool's tiers and
    /// in its shared tier.
    pub fn trim(&self) {
        let mut inner = self.inner.lock();
        inner.drain_returns();
        inner.trim_tiers();
        if let Some(shared) = &inner.shared {
            shared.trim();
        }
        debug!(id = self.id, "buffer pool trimmed");
    }

    /// Reports sampled buffers outstanding for at least `older_than`.
    ///
    /// Always empty unless the pool was built with
    /// [`leak_detection`](BufferPoolBuilder::leak_detection).
    #[must_use]
    pub fn check_leaks(&self, older_than: Duration) -> Vec<LeakReport> {
        let mut inner = self.inner.lock();
        inner.maintain();
        inner
            .leaks
            .as_ref()
            .map(|leaks| leaks.scan(older_than))
            .unwrap_or_default()
    }

    fn check_owner(&self, buf: &Buffer) -> Result<()> {
        match buf.owner() {
            Some(owner) if owner != self.id => {
                error!(pool = self.id, owner, "buffer handed to a pool that does not own it");
                Err(PoolError::Foreign)
            }
            _ => Ok(()),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a pool's usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Identity of the pool.
    pub id: u64,
    /// Usage of every tier, in the order they are tried.
    pub tiers: Vec<TierUsage>,
    /// Usage of the shared tier, across every pool using it.
    pub shared: Option<TierUsage>,
    /// Bytes of the unpooled budget in use, across every pool using it.
    pub unpooled: Option<MemoryUsage>,
    /// Expansions done in place.
    pub zero_copy_expansions: u64,
    /// Expansions that had to copy.
    pub copied_expansions: u64,
    /// Sampled buffers still outstanding.
    pub leak_samples: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "buffer pool #{}", self.id)?;
        for tier in &self.tiers {
            writeln!(f, "  {tier}")?;
        }
        if let Some(shared) = &self.shared {
            writeln!(f, "  shared {shared}")?;
        }
        if let Some(unpooled) = &self.unpooled {
            writeln!(f, "  unpooled: {unpooled}")?;
        }
        write!(
            f,
            "  expansions: {} zero-copy, {} copied",
            self.zero_copy_expansions, self.copied_expansions
        )?;
        if self.leak_samples > 0 {
            write!(f, "\n  leak samples outstanding: {}", self.leak_samples)?;
        }
        Ok(())
    }
}

/// Internal pool state protected by the mutex.
struct PoolInner {
    id: u64,
    tiers: Vec<Box<dyn BPool>>,
    headroom: usize,
    allocator: Arc<dyn Allocator>,
    shared: Option<Arc<SharedTier>>,
    large_threshold: usize,
    unpooled: Option<Arc<UnpooledBudget>>,
    idle_release: Option<Duration>,
    /// Last allocation, or the last idle release.
    idle_since: Instant,
    next_serial: u64,
    zero_copy_expansions: u64,
    copied_expansions: u64,
    leaks: Option<LeakDetector>,
    return_rx: mpsc::UnboundedReceiver<ReturnInfo>,
    return_tx: Arc<mpsc::UnboundedSender<ReturnInfo>>,
}

impl PoolInner {
    /// Hands regions of dropped buffers back, then releases idle memory once
    /// nothing was allocated for the configured time.
    fn maintain(&mut self) {
        self.drain_returns();
        let Some(after) = self.idle_release else {
            return;
        };
        if self.idle_since.elapsed() >= after {
            self.trim_tiers();
            self.idle_since = Instant::now();
            debug!(id = self.id, ?after, "released idle memory");
        }
    }

    /// Hands regions of dropped buffers back to their tiers.
    fn drain_returns(&mut self) {
        while let Ok(info) = self.return_rx.try_recv() {
            self.release(info.origin, info.region, info.serial);
        }
    }

    fn trim_tiers(&mut self) {
        for tier in &mut self.tiers {
            tier.trim();
        }
    }

    fn release(&mut self, origin: Origin, region: Region, serial: u64) {
        if let Some(leaks) = &mut self.leaks {
            leaks.untrack(serial);
        }
        trace!(%origin, serial, len = region.len(), "reserve");
        match origin {
            Origin::Tier(index) => {
                debug_assert!(self.tiers[index].owns(&region));
                self.tiers[index].reserve(region);
            }
            Origin::Shared(shared) => {
                debug_assert!(shared.owns(&region));
                shared.reserve(region);
            }
            // the segment is freed with its only region
            Origin::Unpooled(budget) => budget.give_back(region.len()),
        }
    }

    /// Tries each memory kind in `kinds` in order, then an unpooled segment of
    /// the first kind.
    fn allocate(&mut self, kinds: &[bool], capacity: usize, headroom: usize) -> Result<Buffer> {
        let total = capacity
            .checked_add(headroom)
            .ok_or(PoolError::Exhausted { requested: usize::MAX })?;
        if total == 0 {
            return Ok(Buffer::empty(kinds[0]));
        }

        let mut failure = None;
        for &direct in kinds {
            match self.allocate_kind(direct, total) {
                Ok(Some((origin, region))) => {
                    return Ok(self.lease(origin, region, headroom, capacity));
                }
                Ok(None) => {}
                Err(e) => failure = Some(e),
            }
        }

        if let Some(budget) = self.unpooled.clone() {
            match budget.allocate(&self.allocator, kinds[0], total) {
                Ok(Some(region)) => {
                    debug!(direct = kinds[0], total, "unpooled allocation");
                    let origin = Origin::Unpooled(budget);
                    return Ok(self.lease(origin, region, headroom, capacity));
                }
                Ok(None) => {}
                Err(e) => failure = Some(e),
            }
        }
        Err(failure.unwrap_or(PoolError::Exhausted { requested: total }))
    }

    /// Tries the pool's tiers and the shared tier for one memory kind. Large
    /// requests go to the shared tier first.
    fn allocate_kind(&mut self, direct: bool, total: usize) -> Result<Option<(Origin, Region)>> {
        let large = self.large_threshold != 0 && total >= self.large_threshold;
        let mut failure = None;
        if large {
            match self.allocate_shared(direct, total) {
                Ok(None) => {}
                Ok(found) => return Ok(found),
                Err(e) => failure = Some(e),
            }
        }

        for index in 0..self.tiers.len() {
            match self.tiers[index].allocate(direct, total) {
                Ok(Some(region)) => return Ok(Some((Origin::Tier(index), region))),
                Ok(None) => {}
                Err(e) => {
                    debug!(tier = %self.tiers[index].kind(), direct, error = %e, "tier failed");
                    failure = Some(e);
                }
            }
        }

        if !large {
            match self.allocate_shared(direct, total) {
                Ok(None) => {}
                Ok(found) => {
                    debug!(direct, total, "served by the shared tier");
                    return Ok(found);
                }
                Err(e) => failure = Some(e),
            }
        }
        debug!(direct, total, "no tier could serve the request");
        failure.map_or(Ok(None), Err)
    }

    fn allocate_shared(&self, direct: bool, total: usize) -> Result<Option<(Origin, Region)>> {
        let Some(shared) = &self.shared else {
            return Ok(None);
        };
        let region = shared.allocate(direct, total)?;
        Ok(region.map(|region| (Origin::Shared(Arc::clone(shared)), region)))
    }

    fn lease(
        &mut self,
        origin: Origin,
        region: Region,
        headroom: usize,
        capacity: usize,
    ) -> Buffer {
        self.next_serial += 1;
        self.idle_since = Instant::now();
        let serial = self.next_serial;
        let direct = region.is_direct();
        if let Some(leaks) = &mut self.leaks {
            leaks.track(serial, capacity, direct);
        }
        trace!(
            %origin,
            serial,
            direct,
            offset = region.offset(),
            len = region.len(),
            "allocate"
        );
        let lease = Lease {
            pool: self.id,
            origin,
            serial,
            region,
            return_tx: Arc::clone(&self.return_tx),
        };
        Buffer::leased(lease, headroom, capacity, direct)
    }

    /// Grows a region in place through whatever issued it.
    fn grow_region(
        &mut self,
        origin: &Origin,
        region: &mut Region,
        more: usize,
        at_end: bool,
    ) -> bool {
        match origin {
            Origin::Tier(index) => self.tiers[*index].expand(region, more, at_end),
            Origin::Shared(shared) => shared.expand(region, more, at_end),
            Origin::Unpooled(_) => false,
        }
    }

    fn shrink_region(&mut self, origin: &Origin, region: &mut Region, less: usize) -> usize {
        match origin {
            Origin::Tier(index) => self.tiers[*index].shrink(region, less),
            Origin::Shared(shared) => shared.shrink(region, less),
            Origin::Unpooled(_) => 0,
        }
    }

    fn expand_in_place(&mut self, buf: &mut Buffer, more: usize, add_at_end: bool) -> bool {
        let (Some(lease), start, len) = buf.parts_mut() else {
            return false;
        };
        if add_at_end {
            let slack = lease.region.len() - *start - *len;
            if slack < more && !self.grow_region(&lease.origin, &mut lease.region, more - slack, true)
            {
                return false;
            }
        } else if *start < more {
            let before = lease.region.len();
            if !self.grow_region(&lease.origin, &mut lease.region, more - *start, false) {
                return false;
            }
            *start += lease.region.len() - before;
            *start -= more;
        } else {
            *start -= more;
        }
        *len += more;
        true
    }
}
