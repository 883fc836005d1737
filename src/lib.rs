//! # ruapc-bpool
//!
//! A tiered byte-buffer pool for network I/O. Buffers come from "direct"
//! memory (page-aligned, obtained through a pluggable [`Allocator`]) or heap
//! memory, carved out by a stack of interchangeable tiers.
//!
//! ## Features
//!
//! - **Hierarchical bitmap allocator**: [`Page`] tracks a region with 64-slot
//!   nodes that subdivide only where small allocations happen, with a bump
//!   pointer fast path and exact-offset placement
//! - **Zero-copy growth**: buffers grow in place at either end when the
//!   neighbouring bytes are free, and fall back to a copy otherwise
//! - **Tiers**: [`PagedBPool`] (page tree), [`BitmapBPool`] (flat chunk
//!   bitmap) and [`SimpleBPool`] (cached whole blocks) behind the [`BPool`]
//!   trait
//! - **Fallbacks**: a [`SharedTier`] used by every pool once its own tiers
//!   are full, then standalone segments within an [`UnpooledBudget`]
//! - **Automatic Memory Reclamation**: buffers are returned to their tier on
//!   drop, and memory left idle is released after a while
//! - **Leak detection**: optional sampling of outstanding buffers
//!
//! ## Example
//!
//! ```rust
//! use ruapc_bpool::{BufferPool, PooledBuffer};
//!
//! # fn main() -> ruapc_bpool::Result<()> {
//! let pool = BufferPool::local();
//!
//! let mut buffer = pool.buffer(1024)?;
//! assert_eq!(buffer.len(), 1024);
//! assert!(buffer.is_direct());
//!
//! // Prepend a header without moving the payload
//! pool.expand(&mut buffer, 8, false, true)?;
//! assert_eq!(buffer.len(), 1032);
//!
//! // Buffer is automatically returned to the pool when dropped
//! drop(buffer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Page tree
//!
//! ```rust
//! use ruapc_bpool::Page;
//!
//! # fn main() -> ruapc_bpool::Result<()> {
//! let mut page = Page::new(64 * 1024)?;
//! let a = page.alloc(100).unwrap();
//! assert!(page.alloc_after(a, 100, 50));
//! page.free(a, 160);
//! assert_eq!(page.used_space(), 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod buffer;
mod config;
mod error;
mod fallback;
mod leak;
mod page;
mod pool;
mod segment;
mod tier;

pub use allocator::{Allocator, DefaultAllocator};
pub use buffer::{Buffer, PooledBuffer};
pub use config::{BitmapConfig, LeakConfig, PagedConfig, SimpleConfig, TierConfig};
pub use error::{PoolError, Result};
pub use fallback::{GLOBAL_SHARED_CAPACITY, GLOBAL_UNPOOLED_BUDGET, SharedTier, UnpooledBudget};
pub use leak::{LeakDetector, LeakReport};
pub use page::{MINIMUM_ALIGN, MINIMUM_CAPACITY, MINIMUM_SHIFT, Page, align};
pub use pool::{BufferPool, BufferPoolBuilder, DEFAULT_HEADROOM, DEFAULT_IDLE_RELEASE, PoolStats};
pub use segment::{Region, Segment};
pub use tier::{BPool, BitmapBPool, MemoryUsage, PagedBPool, SimpleBPool, TierKind, TierUsage};
