//! Memory allocator trait and default implementation.
//!
//! This module provides the [`Allocator`] trait that backs every "direct"
//! segment of the pool, and [`DefaultAllocator`] which uses the standard
//! library's global allocator. Heap segments never go through this trait.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::error::{PoolError, Result};

/// Trait for direct-memory backends.
///
/// # Safety
///
/// Implementations must ensure:
/// - `allocate` returns a valid pointer to `size` initialized bytes
/// - `deallocate` is only called with pointers previously returned by `allocate`
/// - The allocated memory remains valid until `deallocate` is called
///
/// # Example
///
/// ```rust
/// use std::ptr::NonNull;
/// use ruapc_bpool::{Allocator, Result};
///
/// struct MyAllocator;
///
/// impl Allocator for MyAllocator {
///     fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
///         // Custom allocation logic
///         # unimplemented!()
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
///         // Custom deallocation logic
///         # unimplemented!()
///     }
/// }
/// ```
pub trait Allocator: Send + Sync {
    /// Allocates `size` bytes of initialized memory.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutOfMemory`] if the memory cannot be provided, or
    /// [`PoolError::InvalidConfig`] for a zero or unrepresentable size.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Deallocates memory previously allocated by this allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `ptr` was returned by a previous call to `allocate` on this allocator
    /// - `size` matches the size passed to the matching `allocate` call
    /// - The memory has not already been deallocated
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Default allocator using the standard library's global allocator.
///
/// Memory is zeroed and aligned to 4 KiB pages so that direct buffers can be
/// handed to I/O syscalls that expect page alignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    /// Page alignment of every direct segment.
    pub const ALIGNMENT: usize = 4096;

    /// Creates a new default allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, Self::ALIGNMENT)
            .map_err(|e| PoolError::InvalidConfig(format!("segment of {size} bytes: {e}")))
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(PoolError::InvalidConfig("segment size must be > 0".into()));
        }

        let layout = Self::layout(size)?;

        // SAFETY: layout is valid (non-zero size, power-of-two alignment)
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(PoolError::OutOfMemory(size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }

        if let Ok(layout) = Self::layout(size) {
            // SAFETY: ptr was allocated with this layout by allocate()
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocator_basic() {
        let allocator = DefaultAllocator::new();

        let size = 64 * 1024;
        let ptr = allocator.allocate(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % DefaultAllocator::ALIGNMENT, 0);

        unsafe {
            // Zeroed on arrival
            assert_eq!(*ptr.as_ptr(), 0);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0);

            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, size);
            assert_eq!(*ptr.as_ptr().add(size - 1), 0xAB);

            allocator.deallocate(ptr, size);
        }
    }

    #[test]
    fn test_default_allocator_zero_size() {
        let allocator = DefaultAllocator::new();
        assert!(matches!(
            allocator.allocate(0),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_allocator_unrepresentable_size() {
        let allocator = DefaultAllocator::new();
        assert!(allocator.allocate(usize::MAX).is_err());
    }
}
