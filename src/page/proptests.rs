//! Randomised checks of the page tree against a flat model of live ranges.

use proptest::prelude::*;
use proptest::sample::Index;

use super::{Page, align};

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    AllocAt(usize, usize),
    Free(Index),
    Grow(Index, usize, bool),
}

fn capacity() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(512),
        Just(4096),
        Just(32 * 1024),
        Just(64 * 1024),
        Just(300_000),
    ]
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => (1usize..=3000).prop_map(Op::Alloc),
        2 => (any::<u32>(), 1usize..=700).prop_map(|(off, len)| Op::AllocAt(off as usize, len)),
        3 => any::<Index>().prop_map(Op::Free),
        2 => (any::<Index>(), 1usize..=600, any::<bool>())
            .prop_map(|(which, more, at_end)| Op::Grow(which, more, at_end)),
    ];
    prop::collection::vec(op, 1..250)
}

/// Live allocations, kept beside the tree.
#[derive(Default)]
struct Model {
    live: Vec<(usize, usize)>,
}

impl Model {
    fn is_free(&self, off: usize, len: usize) -> bool {
        self.live
            .iter()
            .all(|&(o, l)| off + len <= o || o + l <= off)
    }

    fn used(&self) -> usize {
        self.live.iter().map(|&(_, l)| l).sum()
    }
}

fn check(page: &Page, model: &Model) -> Result<(), TestCaseError> {
    page.validate();
    prop_assert_eq!(page.used_space(), model.used());
    prop_assert_eq!(page.free_space(), page.total_space() - model.used());

    let mut live = model.live.clone();
    live.sort_unstable();
    for &(off, len) in &live {
        prop_assert_eq!(off % 8, 0, "unaligned offset {}", off);
        prop_assert_eq!(len % 8, 0, "unaligned length {}", len);
        prop_assert!(off + len <= page.total_space());
    }
    for pair in live.windows(2) {
        prop_assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "overlap between {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
    Ok(())
}

fn run(page: &mut Page, model: &mut Model, ops: Vec<Op>) -> Result<(), TestCaseError> {
    for op in ops {
        match op {
            Op::Alloc(len) => {
                if let Some(off) = page.alloc(len) {
                    prop_assert!(model.is_free(off, align(len)), "alloc({}) -> {} overlaps", len, off);
                    model.live.push((off, align(len)));
                } else {
                    prop_assert!(
                        page.used_space() > 0 || align(len) > page.total_space(),
                        "alloc({}) failed on an empty page",
                        len
                    );
                }
            }
            Op::AllocAt(off, len) => {
                let off = align(off % page.total_space());
                let len = align(len);
                let expected = off + len <= page.total_space() && model.is_free(off, len);
                let before = page.clone();
                let claimed = page.alloc_at(off, len);
                prop_assert_eq!(claimed, expected, "alloc_at({}, {})", off, len);
                if claimed {
                    model.live.push((off, len));
                } else {
                    prop_assert_eq!(&*page, &before);
                }
            }
            Op::Free(which) => {
                if !model.live.is_empty() {
                    let (off, len) = model.live.swap_remove(which.index(model.live.len()));
                    page.free(off, len);
                }
            }
            Op::Grow(which, more, at_end) => {
                if model.live.is_empty() {
                    continue;
                }
                let (off, len) = model.live[which.index(model.live.len())];
                let more = align(more);
                let (start, expected) = if at_end {
                    let start = off + len;
                    (start, start + more <= page.total_space() && model.is_free(start, more))
                } else {
                    let start = off.wrapping_sub(more);
                    (start, more <= off && model.is_free(start, more))
                };

                let before = page.clone();
                let grown = if at_end {
                    page.alloc_after(off, len, more)
                } else {
                    page.alloc_before(off, more)
                };
                prop_assert_eq!(grown, expected, "grow {:?} by {} at_end={}", (off, len), more, at_end);
                if grown {
                    page.validate();
                    page.free(start, more);
                }
                // growing and giving the bytes back leaves no trace
                prop_assert_eq!(&*page, &before);
            }
        }
        check(page, model)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_random_operations_keep_invariants(capacity in capacity(), ops in ops()) {
        let mut page = Page::new(capacity).unwrap();
        let mut model = Model::default();
        run(&mut page, &mut model, ops)?;

        // conservation
        for (off, len) in model.live.drain(..) {
            page.free(off, len);
        }
        page.validate();
        prop_assert_eq!(page.used_space(), 0);
        prop_assert_eq!(page.free_space(), page.total_space());
        prop_assert_eq!(page.head_empty(), page.total_space());
        prop_assert_eq!(page.tail_empty(), page.total_space());
    }

    #[test]
    fn test_compress_preserves_bytes(capacity in capacity(), ops in ops()) {
        let mut page = Page::new(capacity).unwrap();
        let mut model = Model::default();
        run(&mut page, &mut model, ops)?;

        let mut memory = vec![0u8; page.total_space()];
        model.live.sort_unstable();
        let mut expected = Vec::new();
        for (i, &(off, len)) in model.live.iter().enumerate() {
            for (j, byte) in memory[off..off + len].iter_mut().enumerate() {
                *byte = (i * 31 + j) as u8;
            }
            expected.extend_from_slice(&memory[off..off + len]);
        }

        let used = page.used_space();
        page.compress(|old, new, len| {
            assert!(new < old);
            memory.copy_within(old..old + len, new);
        });
        page.validate();
        prop_assert_eq!(page.used_space(), used);
        prop_assert_eq!(&memory[..used], &expected[..]);
        prop_assert_eq!(page.head_empty(), if used == 0 { page.total_space() } else { 0 });
        prop_assert_eq!(page.tail_empty(), page.total_space() - used);
    }

    #[test]
    fn test_headroom_queries_match_model(capacity in capacity(), ops in ops()) {
        let mut page = Page::new(capacity).unwrap();
        let mut model = Model::default();
        run(&mut page, &mut model, ops)?;

        let first = model.live.iter().map(|&(o, _)| o).min().unwrap_or(page.total_space());
        let last = model.live.iter().map(|&(o, l)| o + l).max().unwrap_or(0);
        prop_assert_eq!(page.head_empty(), first);
        prop_assert_eq!(page.tail_empty(), page.total_space() - last);
    }
}
