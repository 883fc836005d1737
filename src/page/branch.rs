//! Branch nodes: 64 slots of `1 << shift` bytes, lazily split into children,
//! plus the bump prefix.
//!
//! Slot states are encoded by two disjoint bitmaps: `bitmap` (whole slot
//! allocated) and `split` (slot owned by a child). A slot with neither bit is
//! free unless it is covered by the prefix. The prefix `[0, prefix)` is fully
//! allocated and its slots carry no bits and no children; while it is unlocked
//! both bitmaps are empty.

use std::fmt;
use std::ops::Range;

use super::{
    LONG_SHIFT, MINIMUM_MASK, MINIMUM_SHIFT, Node, SLOTS, bit_range, runs, set_bits,
    write_indent, write_usage,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Branch {
    shift: u32,
    child_id: u32,
    slots: u32,
    bitmap: u64,
    split: u64,
    /// Sorted by child id, one per `split` bit.
    children: Vec<Node>,
    prefix: usize,
    /// Bytes of the prefix moved into the child right after it.
    prefix_tail: usize,
    prefix_locked: bool,
    free: usize,
}

#[allow(clippy::cast_possible_truncation)]
impl Branch {
    pub(super) fn new(shift: u32, child_id: u32, slots: u32) -> Self {
        debug_assert!(shift > MINIMUM_SHIFT || child_id == 0, "non-root branch at leaf depth");
        debug_assert!(slots > 0 && slots <= SLOTS);
        Self {
            shift,
            child_id,
            slots,
            bitmap: 0,
            split: 0,
            children: Vec::new(),
            prefix: 0,
            prefix_tail: 0,
            prefix_locked: false,
            free: (slots as usize) << shift,
        }
    }

    pub(super) fn full(shift: u32, child_id: u32) -> Self {
        let mut branch = Self::new(shift, child_id, SLOTS);
        branch.prefix = branch.free;
        branch.free = 0;
        branch
    }

    pub(super) const fn shift(&self) -> u32 {
        self.shift
    }

    pub(super) const fn child_id(&self) -> u32 {
        self.child_id
    }

    pub(super) const fn total_space(&self) -> usize {
        (self.slots as usize) << self.shift
    }

    pub(super) const fn free_space(&self) -> usize {
        self.free
    }

    pub(super) const fn used_space(&self) -> usize {
        self.total_space() - self.free
    }

    const fn chunk(&self) -> usize {
        1 << self.shift
    }

    const fn mask(&self) -> usize {
        self.chunk() - 1
    }

    const fn slot_base(&self, id: u32) -> usize {
        (id as usize) << self.shift
    }

    /// Slots touched by the prefix.
    const fn prefix_slots(&self) -> u32 {
        ((self.prefix + self.mask()) >> self.shift) as u32
    }

    fn occupied(&self) -> u64 {
        self.bitmap | self.split | bit_range(0, self.prefix_slots())
    }

    fn find(&self, id: u32) -> Result<usize, usize> {
        self.children.binary_search_by_key(&id, Node::child_id)
    }

    fn child(&self, id: u32) -> Option<&Node> {
        self.find(id).ok().map(|i| &self.children[i])
    }

    /// Gets or creates the child of slot `id`. A wholly allocated slot becomes
    /// a fully allocated child.
    fn goc(&mut self, id: u32) -> &mut Node {
        let i = match self.find(id) {
            Ok(i) => i,
            Err(i) => {
                debug_assert!(self.shift > MINIMUM_SHIFT, "no subpages below 8 bytes");
                debug_assert!(id >= self.prefix_slots(), "slot {id} is covered by the prefix");
                let bit = 1u64 << id;
                let shift = self.shift - LONG_SHIFT;
                let node = if self.bitmap & bit == 0 {
                    Node::empty(shift, id)
                } else {
                    self.bitmap ^= bit;
                    Node::full(shift, id)
                };
                self.split |= bit;
                self.children.insert(i, node);
                i
            }
        };
        &mut self.children[i]
    }

    fn release_if_empty(&mut self, id: u32) {
        if let Ok(i) = self.find(id) {
            if self.children[i].used_space() == 0 {
                self.children.remove(i);
                self.split &= !(1u64 << id);
            }
        }
    }

    fn try_unlock(&mut self) {
        if self.bitmap == 0 && self.split == 0 {
            self.prefix_locked = false;
        }
    }

    /// Claims `[off, off + len)` inside slot `id` through its child. Does not
    /// touch `free`.
    fn claim(&mut self, id: u32, off: usize, len: usize) -> bool {
        if self.bitmap & (1u64 << id) != 0 || id < self.prefix_slots() {
            return false;
        }
        let claimed = self.goc(id).malloc_at(off, len);
        if !claimed {
            self.release_if_empty(id);
        }
        claimed
    }

    /// Releases `[off, off + len)` inside slot `id`. Does not touch `free`.
    fn release(&mut self, id: u32, off: usize, len: usize) {
        debug_assert!(
            (self.bitmap | self.split) & (1u64 << id) != 0,
            "slot {id} of page(shift={}) is not allocated",
            self.shift
        );
        self.goc(id).mfree(off, len);
        self.release_if_empty(id);
    }

    fn bump(&mut self, len: usize) -> Option<usize> {
        let end = self.prefix + len;
        if end > self.total_space() {
            return None;
        }
        let grown = bit_range(self.prefix_slots(), ((end + self.mask()) >> self.shift) as u32);
        if (self.bitmap | self.split) & grown != 0 {
            return None;
        }
        let off = self.prefix;
        self.prefix = end;
        self.free -= len;
        Some(off)
    }

    /// Turns the prefix into ordinary bookkeeping: whole chunks become bits,
    /// the partial last chunk becomes a child.
    fn split_prefix(&mut self) {
        let whole = (self.prefix >> self.shift) as u32;
        let rest = self.prefix & self.mask();
        let bits = bit_range(0, whole);
        debug_assert_eq!((self.bitmap | self.split) & bits, 0);

        self.bitmap |= bits;
        self.prefix = 0;
        self.prefix_locked = true;
        if rest != 0 {
            let claimed = self.goc(whole).malloc_at(0, rest);
            debug_assert!(claimed);
        }
    }

    /// Moves only the partially used last chunk of the prefix into a child.
    /// The whole chunks stay in the prefix.
    fn split_prefix_tail(&mut self) {
        let rest = self.prefix & self.mask();
        debug_assert!(rest != 0 && self.prefix_tail == 0);

        self.prefix -= rest;
        self.prefix_tail = rest;
        self.prefix_locked = true;
        let id = self.prefix_slots();
        let claimed = self.goc(id).malloc_at(0, rest);
        debug_assert!(claimed);
    }

    /// Undoes `split_prefix_tail` once the child holds nothing but the bytes
    /// it took from the prefix.
    fn fold_prefix_tail(&mut self) {
        if self.prefix_tail == 0 {
            return;
        }
        let id = self.prefix_slots();
        if let Ok(i) = self.find(id) {
            if self.children[i].used_space() == self.prefix_tail {
                self.children.remove(i);
                self.split &= !(1u64 << id);
                self.prefix += self.prefix_tail;
                self.prefix_tail = 0;
            }
        }
    }

    pub(super) fn malloc(&mut self, len: usize) -> Option<usize> {
        debug_assert!(len > 0 && len & MINIMUM_MASK == 0);
        if self.free < len {
            return None;
        }
        if !self.prefix_locked {
            return self.bump(len);
        }
        if self.prefix != 0 && self.prefix + len <= self.slot_base(self.prefix_slots()) {
            return self.bump(len);
        }

        let blocks = (len >> self.shift) as u32;
        if blocks > 0 {
            self.malloc_slots(blocks, len)
        } else {
            self.malloc_small(len)
        }
    }

    /// First fit over runs of `blocks` free slots; a sub-chunk remainder goes
    /// to a neighbouring slot.
    fn malloc_slots(&mut self, blocks: u32, len: usize) -> Option<usize> {
        let rest = len & self.mask();
        let taken = self.bitmap | self.split;
        let first = self.prefix_slots();

        let mut offset = first;
        while offset + blocks <= self.slots {
            let run = bit_range(offset, offset + blocks);
            if taken & run == 0 {
                if let Some(start) = self.place_rest(offset, blocks, rest) {
                    self.bitmap |= run;
                    self.free -= len;
                    return Some(start);
                }
            }
            offset += 1;
        }
        None
    }

    /// Finds room for the `rest` bytes that do not fill a whole slot: the head
    /// of the slot after the run, else the tail of the split slot before it.
    fn place_rest(&mut self, offset: u32, blocks: u32, rest: usize) -> Option<usize> {
        let start = self.slot_base(offset);
        if rest == 0 {
            return Some(start);
        }
        let next = offset + blocks;
        if next < self.slots && self.claim(next, 0, rest) {
            return Some(start);
        }
        if offset > self.prefix_slots()
            && self.split & (1u64 << (offset - 1)) != 0
            && self.claim(offset - 1, self.chunk() - rest, rest)
        {
            return Some(start - rest);
        }
        None
    }

    fn malloc_small(&mut self, len: usize) -> Option<usize> {
        let chunk = self.chunk();

        let mut i = 0;
        while i < self.children.len() {
            let id = self.children[i].child_id();
            if let Some(off) = self.children[i].malloc(len) {
                self.free -= len;
                return Some(self.slot_base(id) + off);
            }

            // steal the tail of this child and the head of the next slot
            let tail = self.children[i].tail_empty();
            if tail > 0 && tail < len && id + 1 < self.slots && self.claim(id + 1, 0, len - tail) {
                if self.claim(id, chunk - tail, tail) {
                    self.free -= len;
                    return Some(self.slot_base(id + 1) - tail);
                }
                self.release(id + 1, 0, len - tail);
            }
            i += 1;
        }

        // same for the free tail of the prefix's last chunk
        let reserved = self.prefix_slots();
        let tail = self.slot_base(reserved) - self.prefix;
        if tail > 0 && tail < len && reserved < self.slots && self.claim(reserved, 0, len - tail) {
            let off = self.prefix;
            self.prefix += tail;
            self.free -= len;
            return Some(off);
        }

        let open = !self.occupied() & bit_range(0, self.slots);
        if open == 0 {
            return None;
        }
        let id = open.trailing_zeros();
        match self.goc(id).malloc(len) {
            Some(off) => {
                self.free -= len;
                Some(self.slot_base(id) + off)
            }
            None => {
                self.release_if_empty(id);
                None
            }
        }
    }

    pub(super) fn malloc_at(&mut self, off: usize, len: usize) -> bool {
        debug_assert!(off + len <= self.total_space());
        if self.free < len {
            return false;
        }
        if off == self.prefix {
            if self.bump(len).is_some() {
                return true;
            }
            // keep the prefix, take the slots after its last chunk instead
            let base = self.slot_base(self.prefix_slots());
            if off < base && off + len > base {
                if !self.claim_range(base, off + len - base) {
                    return false;
                }
                self.prefix = base;
                self.free -= len;
                return true;
            }
        }
        if off < self.prefix {
            return false;
        }

        if off < self.slot_base(self.prefix_slots()) {
            self.split_prefix_tail();
        } else {
            self.prefix_locked = true;
        }

        if self.claim_range(off, len) {
            self.free -= len;
            return true;
        }
        self.fold_prefix_tail();
        self.try_unlock();
        false
    }

    /// Claims head piece, whole middle slots and tail piece of a range, rolling
    /// back the head piece when a later part is taken.
    fn claim_range(&mut self, off: usize, len: usize) -> bool {
        let end = off + len;
        let mut first = (off >> self.shift) as u32;
        let last = (end >> self.shift) as u32;
        let head = off & self.mask();
        let tail = end & self.mask();
        if first == last {
            return self.claim(first, head, len);
        }

        let mut head_len = 0;
        if head != 0 {
            head_len = self.chunk() - head;
            if !self.claim(first, head, head_len) {
                return false;
            }
            first += 1;
        }

        let run = bit_range(first, last);
        if !self.take_free(run) || (tail != 0 && !self.claim(last, 0, tail)) {
            if head_len != 0 {
                self.release(first - 1, head, head_len);
            }
            return false;
        }
        self.bitmap |= run;
        true
    }

    /// Whether every slot of `run` is unallocated.
    fn take_free(&self, run: u64) -> bool {
        if (self.bitmap | bit_range(0, self.prefix_slots())) & run != 0 {
            return false;
        }
        // children are never empty at rest
        self.split & run == 0
    }

    pub(super) fn mfree(&mut self, off: usize, len: usize) {
        debug_assert!(off + len <= self.total_space());
        debug_assert!(self.free + len <= self.total_space(), "double free of [{off}, +{len})");
        self.free += len;
        if off < self.prefix + self.prefix_tail {
            // bytes of the prefix itself come back, the split chunk stays a child
            self.prefix_tail = 0;
        }

        let end = off + len;
        if off >= self.prefix {
            self.release_range(off, len);
        } else if end < self.prefix {
            self.split_prefix();
            self.release_range(off, len);
        } else {
            // the range holds the end of the prefix, possibly running past it
            let cut = self.prefix;
            self.prefix = off;
            if end > cut {
                self.release_range(cut, end - cut);
            }
        }
        self.fold_prefix_tail();
        self.try_unlock();
    }

    /// Clears a tracked range: head piece, whole slots and tail piece.
    fn release_range(&mut self, off: usize, len: usize) {
        let end = off + len;
        let mut first = (off >> self.shift) as u32;
        let last = (end >> self.shift) as u32;
        let head = off & self.mask();
        let tail = end & self.mask();
        if first == last {
            self.release(first, head, len);
            return;
        }

        if head != 0 {
            self.release(first, head, self.chunk() - head);
            first += 1;
        }
        let run = bit_range(first, last);
        debug_assert_eq!(
            (self.bitmap | self.split) & run,
            run,
            "freeing slots of page(shift={}) that are not allocated",
            self.shift
        );
        let whole = self.bitmap & run;
        self.bitmap &= !whole;
        let chunk = self.chunk();
        for id in set_bits(run & !whole) {
            self.release(id, 0, chunk);
        }
        if tail != 0 {
            self.release(last, 0, tail);
        }
    }

    pub(super) fn head_empty(&self) -> usize {
        if self.prefix != 0 {
            return 0;
        }
        let chunk = self.chunk();
        let mut empty = 0;
        for id in 0..self.slots {
            let bit = 1u64 << id;
            if self.bitmap & bit != 0 {
                break;
            }
            if self.split & bit == 0 {
                empty += chunk;
                continue;
            }
            let head = self.child(id).map_or(0, Node::head_empty);
            empty += head;
            if head < chunk {
                break;
            }
        }
        empty
    }

    pub(super) fn tail_empty(&self) -> usize {
        let chunk = self.chunk();
        let reserved = self.prefix_slots();
        let mut empty = 0;
        for id in (0..self.slots).rev() {
            if id < reserved {
                return empty + self.slot_base(reserved) - self.prefix;
            }
            let bit = 1u64 << id;
            if self.bitmap & bit != 0 {
                break;
            }
            if self.split & bit == 0 {
                empty += chunk;
                continue;
            }
            let tail = self.child(id).map_or(0, Node::tail_empty);
            empty += tail;
            if tail < chunk {
                break;
            }
        }
        empty
    }

    pub(super) fn collect_ranges(&self, base: usize, out: &mut Vec<Range<usize>>) {
        if self.prefix != 0 {
            out.push(base..base + self.prefix);
        }
        for run in runs(self.bitmap) {
            out.push(base + self.slot_base(run.start)..base + self.slot_base(run.end));
        }
        for child in &self.children {
            child.collect_ranges(base + self.slot_base(child.child_id()), out);
        }
    }

    /// Drops all structure, leaving an unlocked prefix of `used` bytes.
    pub(super) fn reset(&mut self, used: usize) {
        debug_assert!(used <= self.total_space());
        self.bitmap = 0;
        self.split = 0;
        self.children.clear();
        self.prefix = used;
        self.prefix_tail = 0;
        self.prefix_locked = false;
        self.free = self.total_space() - used;
    }

    #[cfg(any(test, feature = "validate"))]
    pub(super) fn validate(&self) {
        let me = format!("page(shift={}, id={})", self.shift, self.child_id);
        let tracked = self.bitmap | self.split;

        assert_eq!(self.bitmap & self.split, 0, "{me}: slot both allocated and split");
        assert_eq!(tracked & !bit_range(0, self.slots), 0, "{me}: bits past the last slot");
        assert_eq!(self.prefix & MINIMUM_MASK, 0, "{me}: unaligned prefix {}", self.prefix);
        assert!(self.prefix <= self.total_space(), "{me}: prefix past the end");
        assert_eq!(
            tracked & bit_range(0, self.prefix_slots()),
            0,
            "{me}: prefix overlaps tracked slots"
        );
        if !self.prefix_locked {
            assert_eq!(tracked, 0, "{me}: unlocked prefix with tracked slots");
        }
        if self.prefix_tail != 0 {
            assert_eq!(self.prefix & self.mask(), 0, "{me}: split tail after a partial chunk");
            let tail = self.child(self.prefix_slots());
            assert!(
                tail.is_some_and(|child| child.head_empty() == 0
                    && child.used_space() > self.prefix_tail),
                "{me}: split tail of {} bytes not held by its child",
                self.prefix_tail
            );
        }

        let ids = self.children.iter().fold(0u64, |ids, child| ids | 1 << child.child_id());
        assert_eq!(ids, self.split, "{me}: children do not match the split bitmap");
        assert!(
            self.children.windows(2).all(|w| w[0].child_id() < w[1].child_id()),
            "{me}: children out of order"
        );

        let mut used = self.prefix + ((self.bitmap.count_ones() as usize) << self.shift);
        for child in &self.children {
            assert_eq!(child.total_space(), self.chunk(), "{me}: child size mismatch");
            assert_ne!(child.used_space(), 0, "{me}: empty child {} kept", child.child_id());
            child.validate();
            used += child.used_space();
        }
        assert_eq!(self.free, self.total_space() - used, "{me}: free counter drifted");
    }

    pub(super) fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "[ shift = {}", self.shift)?;
        write_indent(f, depth + 1)?;
        f.write_str("usage = ")?;
        write_usage(f, self.used_space(), self.total_space())?;
        f.write_str("\n")?;
        if self.prefix != 0 {
            write_indent(f, depth + 1)?;
            let state = if self.prefix_locked { "locked" } else { "bump" };
            writeln!(f, "prefix = {} ({state})", self.prefix)?;
        }
        if self.prefix_tail != 0 {
            write_indent(f, depth + 1)?;
            writeln!(f, "prefix tail = {} (split)", self.prefix_tail)?;
        }
        write_indent(f, depth + 1)?;
        f.write_str("mapping = ")?;
        let reserved = self.prefix_slots();
        for id in 0..self.slots {
            let bit = 1u64 << id;
            let state = if id < reserved {
                "p"
            } else if self.bitmap & bit != 0 {
                "1"
            } else if self.split & bit != 0 {
                "S"
            } else {
                "o"
            };
            f.write_str(state)?;
        }
        f.write_str("\n")?;
        for child in &self.children {
            write_indent(f, depth + 1)?;
            write!(f, "child[{}] = ", child.child_id())?;
            child.render(f, depth + 1)?;
            f.write_str("\n")?;
        }
        write_indent(f, depth)?;
        f.write_str("]")
    }
}
