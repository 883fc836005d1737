//! 8-byte granularity leaves: a bare 64-bit bitmap.

use std::fmt;
use std::ops::Range;

use super::{MINIMUM_SHIFT, SLOTS, bit_range, runs, write_indent, write_usage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Leaf {
    child_id: u32,
    bitmap: u64,
}

impl Leaf {
    pub(super) const TOTAL: usize = (SLOTS as usize) << MINIMUM_SHIFT;

    pub(super) const fn new(child_id: u32) -> Self {
        Self {
            child_id,
            bitmap: 0,
        }
    }

    pub(super) const fn full(child_id: u32) -> Self {
        Self {
            child_id,
            bitmap: u64::MAX,
        }
    }

    pub(super) const fn child_id(&self) -> u32 {
        self.child_id
    }

    fn mask(off: usize, len: usize) -> u64 {
        debug_assert!(off + len <= Self::TOTAL);
        #[allow(clippy::cast_possible_truncation)]
        bit_range((off >> MINIMUM_SHIFT) as u32, ((off + len) >> MINIMUM_SHIFT) as u32)
    }

    pub(super) fn malloc(&mut self, len: usize) -> Option<usize> {
        #[allow(clippy::cast_possible_truncation)]
        let blocks = (len >> MINIMUM_SHIFT) as u32;
        debug_assert!(blocks > 0 && blocks <= SLOTS);

        let mut offset = 0;
        while offset + blocks <= SLOTS {
            let conflict = self.bitmap & bit_range(offset, offset + blocks);
            if conflict == 0 {
                self.bitmap |= bit_range(offset, offset + blocks);
                return Some((offset as usize) << MINIMUM_SHIFT);
            }
            // restart past the highest taken bit of the window
            offset = SLOTS - conflict.leading_zeros();
        }
        None
    }

    pub(super) fn malloc_at(&mut self, off: usize, len: usize) -> bool {
        let mask = Self::mask(off, len);
        if self.bitmap & mask != 0 {
            return false;
        }
        self.bitmap |= mask;
        true
    }

    pub(super) fn mfree(&mut self, off: usize, len: usize) {
        let mask = Self::mask(off, len);
        debug_assert_eq!(
            self.bitmap & mask,
            mask,
            "freeing [{off}, +{len}) of leaf {} which is not fully allocated",
            self.child_id
        );
        self.bitmap &= !mask;
    }

    pub(super) const fn head_empty(&self) -> usize {
        (self.bitmap.trailing_zeros() as usize) << MINIMUM_SHIFT
    }

    pub(super) const fn tail_empty(&self) -> usize {
        (self.bitmap.leading_zeros() as usize) << MINIMUM_SHIFT
    }

    pub(super) const fn used_space(&self) -> usize {
        (self.bitmap.count_ones() as usize) << MINIMUM_SHIFT
    }

    pub(super) fn collect_ranges(&self, base: usize, out: &mut Vec<Range<usize>>) {
        for run in runs(self.bitmap) {
            out.push(
                base + ((run.start as usize) << MINIMUM_SHIFT)
                    ..base + ((run.end as usize) << MINIMUM_SHIFT),
            );
        }
    }

    pub(super) fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        f.write_str("[ shift = 3\n")?;
        write_indent(f, depth + 1)?;
        f.write_str("usage = ")?;
        write_usage(f, self.used_space(), Self::TOTAL)?;
        f.write_str("\n")?;
        write_indent(f, depth + 1)?;
        f.write_str("mapping = ")?;
        for id in 0..SLOTS {
            f.write_str(if self.bitmap & (1 << id) == 0 { "o" } else { "1" })?;
        }
        f.write_str("\n")?;
        write_indent(f, depth)?;
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_first_fit() {
        let mut leaf = Leaf::new(0);
        assert_eq!(leaf.malloc(16), Some(0));
        assert_eq!(leaf.malloc(8), Some(16));
        assert!(leaf.malloc_at(40, 8));
        // [24, 40) is the first hole that fits 16 bytes
        assert_eq!(leaf.malloc(16), Some(24));
        assert_eq!(leaf.malloc(24), Some(48));
        assert_eq!(leaf.used_space(), 72);
    }

    #[test]
    fn test_leaf_exhaustion() {
        let mut leaf = Leaf::new(3);
        assert_eq!(leaf.malloc(Leaf::TOTAL), Some(0));
        assert_eq!(leaf.malloc(8), None);
        assert_eq!(leaf.tail_empty(), 0);

        leaf.mfree(8, 16);
        assert_eq!(leaf.malloc(24), None);
        assert_eq!(leaf.malloc(16), Some(8));
        assert_eq!(leaf, Leaf::full(3));
    }

    #[test]
    fn test_leaf_edges() {
        let mut leaf = Leaf::new(0);
        assert_eq!((leaf.head_empty(), leaf.tail_empty()), (512, 512));
        assert!(leaf.malloc_at(256, 8));
        assert_eq!((leaf.head_empty(), leaf.tail_empty()), (256, 248));
        assert!(!leaf.malloc_at(248, 16));

        let mut ranges = Vec::new();
        leaf.collect_ranges(1024, &mut ranges);
        assert_eq!(ranges, [1280..1288]);
    }
}
