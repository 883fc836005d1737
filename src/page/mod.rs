//! Hierarchical bitmap allocator.
//!
//! A [`Page`] tracks a byte range with a tree of 64-slot nodes. Each node owns a
//! 64-bit bitmap with one bit per chunk of `1 << shift` bytes; a slot can be
//! opened ("split") into a child node at `shift - 6`, down to 8-byte leaves.
//! Depth is only added where sub-chunk allocations actually happen.
//!
//! Branches also carry a bump prefix: as long as nothing was freed out of
//! order, allocation just advances `prefix`. The first out-of-order free or
//! exact placement past the prefix "locks" it and turns it into ordinary bits.
//!
//! Offsets and lengths are always multiples of [`MINIMUM_ALIGN`].

use std::fmt;
use std::ops::Range;

use crate::error::{PoolError, Result};

mod branch;
mod leaf;
#[cfg(test)]
mod proptests;

use branch::Branch;
use leaf::Leaf;

/// Slots per node.
pub(crate) const SLOTS: u32 = 64;
/// Shift difference between a node and its children.
pub(crate) const LONG_SHIFT: u32 = 6;
/// Shift of the finest granularity (8 bytes).
pub const MINIMUM_SHIFT: u32 = 3;
/// Allocation granularity in bytes.
pub const MINIMUM_ALIGN: usize = 1 << MINIMUM_SHIFT;
/// Smallest capacity a page tree can be built over.
pub const MINIMUM_CAPACITY: usize = (SLOTS as usize) << MINIMUM_SHIFT;

const MINIMUM_MASK: usize = MINIMUM_ALIGN - 1;

/// Rounds `n` up to the allocation granularity.
#[inline]
#[must_use]
pub const fn align(n: usize) -> usize {
    (n + MINIMUM_MASK) & !MINIMUM_MASK
}

/// Bits `[from, to)` set.
#[inline]
pub(crate) fn bit_range(from: u32, to: u32) -> u64 {
    debug_assert!(from <= to && to <= SLOTS, "bit range [{from}, {to})");
    if from == to {
        return 0;
    }
    let low = u64::MAX << from;
    if to == SLOTS { low } else { low & ((1u64 << to) - 1) }
}

/// Positions of the set bits of `bits`, lowest first.
pub(crate) fn set_bits(mut bits: u64) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        if bits == 0 {
            return None;
        }
        let id = bits.trailing_zeros();
        bits &= bits - 1;
        Some(id)
    })
}

/// Maximal runs of set bits as `[from, to)` slot ranges.
pub(crate) fn runs(mut bits: u64) -> impl Iterator<Item = Range<u32>> {
    std::iter::from_fn(move || {
        if bits == 0 {
            return None;
        }
        let from = bits.trailing_zeros();
        let to = from + (!(bits >> from)).trailing_zeros();
        bits &= !bit_range(from, to);
        Some(from..to)
    })
}

/// A tree node: an 8-byte granularity leaf or a branch with children.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Node {
    Leaf(Leaf),
    Branch(Box<Branch>),
}

impl Node {
    fn empty(shift: u32, child_id: u32) -> Self {
        if shift > MINIMUM_SHIFT {
            Self::Branch(Box::new(Branch::new(shift, child_id, SLOTS)))
        } else {
            Self::Leaf(Leaf::new(child_id))
        }
    }

    /// A node whose whole range is already allocated.
    fn full(shift: u32, child_id: u32) -> Self {
        if shift > MINIMUM_SHIFT {
            Self::Branch(Box::new(Branch::full(shift, child_id)))
        } else {
            Self::Leaf(Leaf::full(child_id))
        }
    }

    fn child_id(&self) -> u32 {
        match self {
            Self::Leaf(leaf) => leaf.child_id(),
            Self::Branch(branch) => branch.child_id(),
        }
    }

    fn malloc(&mut self, len: usize) -> Option<usize> {
        match self {
            Self::Leaf(leaf) => leaf.malloc(len),
            Self::Branch(branch) => branch.malloc(len),
        }
    }

    fn malloc_at(&mut self, off: usize, len: usize) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.malloc_at(off, len),
            Self::Branch(branch) => branch.malloc_at(off, len),
        }
    }

    fn mfree(&mut self, off: usize, len: usize) {
        match self {
            Self::Leaf(leaf) => leaf.mfree(off, len),
            Self::Branch(branch) => branch.mfree(off, len),
        }
    }

    fn head_empty(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.head_empty(),
            Self::Branch(branch) => branch.head_empty(),
        }
    }

    fn tail_empty(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.tail_empty(),
            Self::Branch(branch) => branch.tail_empty(),
        }
    }

    fn used_space(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.used_space(),
            Self::Branch(branch) => branch.used_space(),
        }
    }

    fn total_space(&self) -> usize {
        match self {
            Self::Leaf(_) => Leaf::TOTAL,
            Self::Branch(branch) => branch.total_space(),
        }
    }

    fn collect_ranges(&self, base: usize, out: &mut Vec<Range<usize>>) {
        match self {
            Self::Leaf(leaf) => leaf.collect_ranges(base, out),
            Self::Branch(branch) => branch.collect_ranges(base, out),
        }
    }

    #[cfg(any(test, feature = "validate"))]
    fn validate(&self) {
        if let Self::Branch(branch) = self {
            branch.validate();
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Self::Leaf(leaf) => leaf.render(f, depth),
            Self::Branch(branch) => branch.render(f, depth),
        }
    }
}

/// Writes `used / total` with binary units, e.g. `1.5 KiB / 512 KiB`.
fn write_usage(f: &mut fmt::Formatter<'_>, used: usize, total: usize) -> fmt::Result {
    write_scaled(f, used)?;
    f.write_str(" / ")?;
    write_scaled(f, total)?;
    #[allow(clippy::cast_precision_loss)]
    let percent = if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    };
    write!(f, " ({percent:.2}%)")
}

pub(crate) fn write_scaled(f: &mut fmt::Formatter<'_>, bytes: usize) -> fmt::Result {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut unit = 0;
    let mut scaled = bytes;
    while scaled >= 1024 && scaled % 1024 == 0 && unit + 1 < UNITS.len() {
        scaled /= 1024;
        unit += 1;
    }
    if unit == 0 && bytes >= 1024 {
        #[allow(clippy::cast_precision_loss)]
        return write!(f, "{:.1} KiB", bytes as f64 / 1024.0);
    }
    write!(f, "{scaled} {}", UNITS[unit])
}

fn write_indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        f.write_str("  ")?;
    }
    Ok(())
}

/// Hierarchical bitmap allocator over a fixed byte range.
///
/// `Page` hands out `(offset, len)` pairs and keeps no record of individual
/// allocations: callers present the same pair back to [`free`](Self::free).
/// All mutation goes through `&mut self`; a page is owned by one tier and
/// protected by the pool lock.
///
/// # Example
///
/// ```rust
/// use ruapc_bpool::Page;
///
/// # fn main() -> ruapc_bpool::Result<()> {
/// let mut page = Page::new(512)?;
/// let a = page.alloc(64).unwrap();
/// let b = page.alloc(16).unwrap();
/// assert_eq!((a, b), (0, 64));
///
/// page.free(a, 64);
/// assert_eq!(page.head_empty(), 64);
///
/// // Grow `b` backwards into the freed space
/// assert!(page.alloc_before(b, 32));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    root: Branch,
}

impl Page {
    /// Creates a page tree covering at least `capacity` bytes.
    ///
    /// The root granularity is the smallest `8 << 6k` that fits `capacity` in
    /// at most 64 slots; the root then spans `ceil(capacity / chunk)` slots.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidCapacity`] if `capacity` is below
    /// [`MINIMUM_CAPACITY`] or too large to represent.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < MINIMUM_CAPACITY {
            return Err(PoolError::InvalidCapacity(capacity));
        }
        let bits = capacity
            .checked_next_power_of_two()
            .ok_or(PoolError::InvalidCapacity(capacity))?
            .trailing_zeros();
        let target = bits.saturating_sub(LONG_SHIFT);
        let mut shift = MINIMUM_SHIFT;
        while shift < target {
            shift += LONG_SHIFT;
        }
        if shift >= usize::BITS {
            return Err(PoolError::InvalidCapacity(capacity));
        }
        let slots = u32::try_from(capacity.div_ceil(1 << shift))
            .map_err(|_| PoolError::InvalidCapacity(capacity))?;
        Ok(Self {
            root: Branch::new(shift, 0, slots),
        })
    }

    /// Allocates `len` bytes (rounded up to 8) and returns the offset.
    ///
    /// Returns `None` when no contiguous range is available.
    pub fn alloc(&mut self, len: usize) -> Option<usize> {
        if len == 0 || len > self.total_space() {
            return None;
        }
        self.root.malloc(align(len))
    }

    /// Claims exactly `[off, off + len)`.
    ///
    /// Returns `false`, leaving the tree untouched, if any byte of the range is
    /// taken or the range leaves the page.
    pub fn alloc_at(&mut self, off: usize, len: usize) -> bool {
        debug_assert_eq!(off & MINIMUM_MASK, 0, "unaligned offset {off}");
        let len = align(len);
        if len == 0 || off.checked_add(len).is_none_or(|end| end > self.total_space()) {
            return false;
        }
        self.root.malloc_at(off, len)
    }

    /// Releases `[off, off + len)`, which must have been allocated.
    pub fn free(&mut self, off: usize, len: usize) {
        let len = align(len);
        debug_assert_eq!(off & MINIMUM_MASK, 0, "unaligned offset {off}");
        debug_assert!(
            len > 0 && off + len <= self.total_space(),
            "range [{off}, +{len}) outside the page"
        );
        self.root.mfree(off, len);
    }

    /// Claims the `more` bytes right before `off`, i.e.
    /// `[off - align(more), off)`.
    pub fn alloc_before(&mut self, off: usize, more: usize) -> bool {
        let more = align(more);
        more != 0 && more <= off && self.alloc_at(off - more, more)
    }

    /// Claims the `more` bytes right after the allocation `[off, off + len)`.
    pub fn alloc_after(&mut self, off: usize, len: usize, more: usize) -> bool {
        self.alloc_at(off + align(len), more)
    }

    /// Free bytes before the first allocated byte.
    #[must_use]
    pub fn head_empty(&self) -> usize {
        self.root.head_empty()
    }

    /// Free bytes after the last allocated byte.
    #[must_use]
    pub fn tail_empty(&self) -> usize {
        self.root.tail_empty()
    }

    /// Allocated bytes.
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.root.used_space()
    }

    /// Unallocated bytes, fragmented or not.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.root.free_space()
    }

    /// Bytes covered by the tree.
    #[must_use]
    pub fn total_space(&self) -> usize {
        self.root.total_space()
    }

    /// Granularity of the root slots.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        1 << self.root.shift()
    }

    /// Packs every allocation to the front of the page.
    ///
    /// Occupied ranges are sorted and coalesced, then moved down in order;
    /// `mover(old, new, len)` is called for each range whose offset changes and
    /// must copy the bytes (ranges never move up, so a forward copy is safe).
    /// Afterwards the tree is a single unlocked prefix of
    /// [`used_space`](Self::used_space) bytes and every previously issued
    /// offset is stale.
    pub fn compress<F>(&mut self, mut mover: F)
    where
        F: FnMut(usize, usize, usize),
    {
        let mut ranges = Vec::new();
        self.root.collect_ranges(0, &mut ranges);
        ranges.sort_unstable_by_key(|range| range.start);

        let mut packed = 0;
        let mut ranges = ranges.into_iter().peekable();
        while let Some(mut range) = ranges.next() {
            while let Some(next) = ranges.next_if(|next| next.start == range.end) {
                range.end = next.end;
            }
            let len = range.len();
            if range.start != packed {
                mover(range.start, packed, len);
            }
            packed += len;
        }

        debug_assert_eq!(packed, self.used_space());
        self.root.reset(packed);
    }

    /// Checks every structural invariant of the tree.
    ///
    /// # Panics
    ///
    /// Panics describing the first violated invariant.
    #[cfg(any(test, feature = "validate"))]
    pub fn validate(&self) {
        self.root.validate();
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.render(f, 0)
    }
}
