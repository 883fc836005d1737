//! Buffer type that automatically returns to the pool on drop.
//!
//! A [`Buffer`] views part of a [`Region`] handed out by one of the pool's
//! tiers. Bytes before the data are headroom, kept free so the buffer can
//! grow at the front without copying; bytes after it are slack left by the
//! tier's rounding. When a `Buffer` is dropped its region is sent back to the
//! pool through a channel, so dropping never takes the pool lock.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::fallback::{SharedTier, UnpooledBudget};
use crate::segment::Region;

/// Where the region of a buffer came from.
#[derive(Debug)]
pub(crate) enum Origin {
    /// A tier of the issuing pool, by index.
    Tier(usize),
    /// The shared tier the pool falls back to.
    Shared(Arc<SharedTier>),
    /// A standalone segment charged to an unpooled budget.
    Unpooled(Arc<UnpooledBudget>),
}

/// Information needed to return a region to where it came from.
#[derive(Debug)]
pub(crate) struct ReturnInfo {
    pub(crate) origin: Origin,
    /// Allocation serial, used by leak detection.
    pub(crate) serial: u64,
    pub(crate) region: Region,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tier(index) => write!(f, "tier {index}"),
            Self::Shared(_) => f.write_str("shared"),
            Self::Unpooled(_) => f.write_str("unpooled"),
        }
    }
}

impl ReturnInfo {
    /// Settles a return whose pool is gone. The pool's own tiers went with
    /// it, but shared memory and the unpooled budget outlive it.
    fn orphan(self) {
        match self.origin {
            Origin::Tier(_) => {}
            Origin::Shared(shared) => shared.reserve(self.region),
            Origin::Unpooled(budget) => budget.give_back(self.region.len()),
        }
    }
}

/// Ownership record of a pooled buffer.
pub(crate) struct Lease {
    pub(crate) pool: u64,
    pub(crate) origin: Origin,
    pub(crate) serial: u64,
    pub(crate) region: Region,
    pub(crate) return_tx: Arc<mpsc::UnboundedSender<ReturnInfo>>,
}

impl Lease {
    fn into_return(self) -> (Arc<mpsc::UnboundedSender<ReturnInfo>>, ReturnInfo) {
        let info = ReturnInfo {
            origin: self.origin,
            serial: self.serial,
            region: self.region,
        };
        (self.return_tx, info)
    }
}

/// Capabilities every pooled buffer exposes to the pool and its users.
pub trait PooledBuffer {
    /// Whether the bytes live in direct (allocator-backed) memory.
    fn is_direct(&self) -> bool;

    /// Identity of the owning pool, or `None` for an unpooled buffer.
    fn owner(&self) -> Option<u64>;

    /// The region backing the buffer, headroom and slack included.
    fn region(&self) -> Option<&Region>;

    /// Hands the buffer back to its owning pool.
    fn release(self)
    where
        Self: Sized;
}

/// A buffer allocated from the pool.
///
/// This type provides read/write access to a contiguous memory region. When dropped,
/// the buffer is automatically returned to the pool for reuse.
///
/// # Example
///
/// ```rust
/// use ruapc_bpool::BufferPoolBuilder;
///
/// # fn main() -> ruapc_bpool::Result<()> {
/// let pool = BufferPoolBuilder::new().build()?;
/// let mut buffer = pool.buffer(1024)?;
///
/// // Write to the buffer
/// buffer[0] = 42;
/// buffer[1] = 43;
///
/// // Read from the buffer
/// assert_eq!(buffer[0], 42);
/// assert_eq!(buffer.len(), 1024);
///
/// // Buffer is returned to the pool when dropped
/// # Ok(())
/// # }
/// ```
pub struct Buffer {
    /// Owning pool, tier and region; `None` for the empty sentinel.
    lease: Option<Lease>,

    /// Offset of the data within the region.
    start: usize,

    /// Length of the data.
    len: usize,

    /// Memory kind, kept for the sentinel which has no region.
    direct: bool,
}

impl Buffer {
    pub(crate) const fn leased(lease: Lease, headroom: usize, len: usize, direct: bool) -> Self {
        Self {
            lease: Some(lease),
            start: headroom,
            len,
            direct,
        }
    }

    /// An empty buffer that belongs to no pool.
    #[must_use]
    pub const fn empty(direct: bool) -> Self {
        Self {
            lease: None,
            start: 0,
            len: 0,
            direct,
        }
    }

    /// Returns the length of the buffer in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free bytes in front of the data, usable for zero-copy front growth.
    #[inline]
    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.start
    }

    /// Free bytes after the data, usable for zero-copy growth at the end.
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.lease
            .as_ref()
            .map_or(0, |lease| lease.region.len() - self.start - self.len)
    }

    fn data_ptr(&self) -> NonNull<u8> {
        self.lease
            .as_ref()
            .map_or(NonNull::dangling(), |lease| lease.region.ptr_at(self.start))
    }

    /// Returns a raw pointer to the buffer's memory.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data_ptr().as_ptr()
    }

    /// Returns a mutable raw pointer to the buffer's memory.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data_ptr().as_ptr()
    }

    /// Returns the buffer as a byte slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is valid for start + len bytes and handed out to
        // this buffer alone; the sentinel uses a dangling pointer with len 0
        unsafe { std::slice::from_raw_parts(self.data_ptr().as_ptr(), self.len) }
    }

    /// Returns the buffer as a mutable byte slice.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr().as_ptr(), self.len) }
    }

    /// Splits the buffer into its lease and the data span.
    pub(crate) fn parts_mut(&mut self) -> (Option<&mut Lease>, &mut usize, &mut usize) {
        (self.lease.as_mut(), &mut self.start, &mut self.len)
    }

    /// Takes the lease so that dropping the buffer no longer returns it.
    pub(crate) fn take_lease(&mut self) -> Option<Lease> {
        self.lease.take()
    }
}

impl PooledBuffer for Buffer {
    fn is_direct(&self) -> bool {
        self.direct
    }

    fn owner(&self) -> Option<u64> {
        self.lease.as_ref().map(|lease| lease.pool)
    }

    fn region(&self) -> Option<&Region> {
        self.lease.as_ref().map(|lease| &lease.region)
    }

    fn release(self) {
        drop(self);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Return the region via the channel; a closed channel means the pool
        // is gone
        if let Some(lease) = self.lease.take() {
            let (return_tx, info) = lease.into_return();
            if let Err(mpsc::error::SendError(info)) = return_tx.send(info) {
                info.orphan();
            }
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for Buffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for Buffer {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("headroom", &self.start)
            .field("direct", &self.direct)
            .field("region", &self.region())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPoolBuilder;

    #[test]
    fn test_buffer_basic_operations() {
        let pool = BufferPoolBuilder::new().build().unwrap();
        let mut buffer = pool.buffer(1024).unwrap();

        assert_eq!(buffer.len(), 1024);
        assert!(!buffer.is_empty());
        assert!(buffer.is_direct());
        assert_eq!(buffer.headroom(), 16);

        buffer[0] = 0xAB;
        buffer[1] = 0xCD;
        assert_eq!(buffer[0], 0xAB);
        assert_eq!(buffer[1], 0xCD);

        let slice = buffer.as_slice();
        assert_eq!(slice[0], 0xAB);

        buffer.as_mut_slice()[2] = 0xEF;
        assert_eq!(buffer[2], 0xEF);
    }

    #[test]
    fn test_buffer_deref() {
        let pool = BufferPoolBuilder::new().build().unwrap();
        let mut buffer = pool.buffer(1024).unwrap();

        for (i, byte) in buffer.iter_mut().take(100).enumerate() {
            *byte = i as u8;
        }

        for i in 0..100 {
            assert_eq!(buffer[i], i as u8);
        }
    }

    #[test]
    fn test_buffer_debug() {
        let pool = BufferPoolBuilder::new().build().unwrap();
        let buffer = pool.buffer(1024).unwrap();

        let debug_str = format!("{buffer:?}");
        assert!(debug_str.contains("Buffer"));
        assert!(debug_str.contains("headroom"));
    }

    #[test]
    fn test_empty_sentinel() {
        let mut buffer = Buffer::empty(false);
        assert!(buffer.is_empty());
        assert!(buffer.as_mut_slice().is_empty());
        assert_eq!(buffer.owner(), None);
        assert!(buffer.region().is_none());
        assert_eq!(buffer.tailroom(), 0);
        buffer.release();
    }

    #[test]
    fn test_release_returns_region() {
        let pool = BufferPoolBuilder::new().build().unwrap();
        let buffer = pool.buffer_in(false, 100).unwrap();
        assert!(pool.stats().tiers[0].heap.used > 0);
        buffer.release();
        assert_eq!(pool.stats().tiers[0].heap.used, 0);
    }
}
