//! Allocation tiers behind the [`BufferPool`](crate::BufferPool) facade.
//!
//! A tier hands out [`Region`]s of direct or heap memory and takes them back.
//! The facade tries its tiers in order and remembers which one produced a
//! region, so a tier only ever sees regions it issued itself.

use std::fmt;

use crate::error::Result;
use crate::page::write_scaled;
use crate::segment::Region;

mod bitmap;
mod paged;
mod simple;

pub use bitmap::BitmapBPool;
pub use paged::PagedBPool;
pub use simple::SimpleBPool;

/// The allocation strategy of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    /// [`PagedBPool`]: hierarchical bitmap tree.
    Paged,
    /// [`BitmapBPool`]: flat chunk bitmap.
    Bitmap,
    /// [`SimpleBPool`]: cached whole blocks.
    Simple,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Paged => "paged",
            Self::Bitmap => "bitmap",
            Self::Simple => "simple",
        })
    }
}

/// Bytes in use out of the bytes a tier manages for one memory kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes handed out and not yet returned.
    pub used: usize,
    /// Bytes the tier can hand out (or currently caches).
    pub total: usize,
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_scaled(f, self.used)?;
        f.write_str(" / ")?;
        write_scaled(f, self.total)
    }
}

/// Usage snapshot of a single tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierUsage {
    /// Which strategy the tier uses.
    pub kind: TierKind,
    /// Direct memory usage.
    pub direct: MemoryUsage,
    /// Heap memory usage.
    pub heap: MemoryUsage,
}

impl fmt::Display for TierUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: direct {}, heap {}", self.kind, self.direct, self.heap)
    }
}

/// Capability interface shared by every tier.
///
/// All methods take the tier by `&mut self`; the facade serializes access
/// with its lock.
pub trait BPool: Send {
    /// The strategy this tier implements.
    fn kind(&self) -> TierKind;

    /// Allocates at least `capacity` bytes of direct or heap memory.
    ///
    /// Returns `Ok(None)` when the tier cannot satisfy the request, which lets
    /// the facade move on to the next tier.
    ///
    /// # Errors
    ///
    /// Returns an error if backing memory could not be obtained.
    fn allocate(&mut self, direct: bool, capacity: usize) -> Result<Option<Region>>;

    /// Takes back a region previously returned by [`allocate`](Self::allocate).
    fn reserve(&mut self, region: Region);

    /// Grows `region` in place by at least `more` bytes, at its end or in
    /// front of it.
    ///
    /// Returns `false`, leaving `region` untouched, when the adjacent bytes are
    /// not available.
    fn expand(&mut self, region: &mut Region, more: usize, add_at_end: bool) -> bool {
        let _ = (region, more, add_at_end);
        false
    }

    /// Releases up to `less` bytes off the end of `region`, in whole
    /// granules, and returns how many bytes were released.
    fn shrink(&mut self, region: &mut Region, less: usize) -> usize {
        let _ = (region, less);
        0
    }

    /// Whether `region` lives in memory managed by this tier.
    fn owns(&self, region: &Region) -> bool;

    /// Current usage.
    fn usage(&self) -> TierUsage;

    /// Releases backing memory the tier holds without using it.
    fn trim(&mut self) {}
}
