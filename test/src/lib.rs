//! Model-based and scenario tests for `fib_alloc`.
//!
//! The `Operations` model replays randomized alloc/free sequences against a
//! fresh allocator, with every payload filled with a deterministic pattern
//! that is verified just before its free; any header or free-list corruption
//! shows up as a payload mismatch.

use std::ptr::NonNull;

use fib_alloc::FibAlloc;
use quickcheck::{Arbitrary, Gen};

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),
}

use self::Operation::*;

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 2_000;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

fn arbitrary_size<R: rand::Rng>(rng: &mut R) -> usize {
    // Mostly small and medium requests, with the occasional chunk-sized
    // outlier, so splitting, coalescing, and chunk acquisition all see
    // traffic.
    match rng.gen_range(0..10) {
        0 => rng.gen_range(1..=50_000),
        1..=4 => rng.gen_range(1..=64),
        _ => rng.gen_range(1..=1_000),
    }
}

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // `Gen`'s own integer instances are bounded by its size parameter,
        // which is far too small for allocation sizes; draw a seed from it
        // and do the real generation with a full-width RNG.
        let mut rng = StdRng::seed_from_u64(u64::arbitrary(g));

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 so that allocation pressure stays high and
            // the size-class table keeps growing.
            if !active_allocs.is_empty() && rng.gen_ratio(1, 4) {
                let i = rng.gen_range(0..active_allocs.len());
                operations.push(Free(active_allocs.swap_remove(i)));
            } else {
                active_allocs.push(num_allocs);
                num_allocs += 1;
                operations.push(Alloc(arbitrary_size(&mut rng)));
            }
        }

        // Wind down to an empty heap so every sequence finishes by driving
        // the coalescer all the way back to the chunk roots.
        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            let i = rng.gen_range(0..active_allocs.len());
            operations.push(Free(active_allocs.swap_remove(i)));
        }

        Operations(operations)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        let prefixes =
            (0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect()));

        // Dropping a Free leaves the allocation numbering intact, so no
        // reindexing is needed.
        let free_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| if let Free(_) = *op { Some(i) } else { None })
            .collect();

        let ops = self.0.clone();
        let without_frees = free_indices.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        let alloc_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| if let Alloc(_) = *op { Some(i) } else { None })
            .collect();

        let ops = self.0.clone();
        let smaller_allocs = alloc_indices.into_iter().filter_map(move |i| {
            // Halving must make strict progress or the shrinker never
            // terminates; single-byte requests are left alone.
            match ops[i] {
                Alloc(size) if size > 1 => {
                    let mut shrunk = ops.clone();
                    shrunk[i] = Alloc(size / 2);
                    Some(Operations(shrunk))
                }
                _ => None,
            }
        });

        Box::new(prefixes.chain(without_frees).chain(smaller_allocs))
    }
}

impl Operations {
    /// Replay this sequence against a fresh allocator, verifying payload
    /// integrity throughout and full coalescing at the end when the sequence
    /// frees everything it allocated.
    pub fn run(self) {
        let mut fib = FibAlloc::new();
        let mut allocs: Vec<Option<(NonNull<u8>, usize, u64)>> = Vec::new();
        let mut live = 0usize;

        for op in self.0 {
            match op {
                Alloc(size) => {
                    let seed = allocs.len() as u64;
                    match fib.alloc(size) {
                        Ok(area) => {
                            unsafe { fill_pattern(area.as_ptr(), size, seed) };
                            allocs.push(Some((area, size, seed)));
                            live += 1;
                        }
                        Err(_) => allocs.push(None),
                    }
                }
                Free(idx) => {
                    if let Some(entry) = allocs.get_mut(idx) {
                        if let Some((area, size, seed)) = entry.take() {
                            unsafe {
                                check_pattern(area.as_ptr(), size, seed);
                                fib.dealloc(area);
                            }
                            live -= 1;
                        }
                    }
                }
            }
        }

        if live == 0 {
            assert_fully_coalesced(&fib);
        }
    }
}

/// Deterministic payload byte for position `i` of the allocation with the
/// given seed.
fn pattern_byte(seed: u64, i: usize) -> u8 {
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(i as u64) as u8
}

/// Write the allocation's pattern over its whole payload.
pub unsafe fn fill_pattern(area: *mut u8, size: usize, seed: u64) {
    for i in 0..size {
        area.add(i).write(pattern_byte(seed, i));
    }
}

/// Verify the allocation's pattern survived, byte for byte.
pub unsafe fn check_pattern(area: *const u8, size: usize, seed: u64) {
    for i in 0..size {
        assert_eq!(
            area.add(i).read(),
            pattern_byte(seed, i),
            "payload byte {} of a live allocation was clobbered",
            i
        );
    }
}

/// The complete free-list state: (class, item address, header word) per free
/// item, in walk order.
///
/// Keep the decoding in sync with `fib_alloc`'s header layout: the low three
/// bits are the inherited-side, side, and in-use flags, and the rest of the
/// word is the block count.
pub fn snapshot(fib: &FibAlloc) -> Vec<(usize, usize, usize)> {
    let mut state = Vec::new();
    fib.each_free_item(|class, item| {
        let header = unsafe { *(item as *const usize) };
        state.push((class, item as usize, header));
    });
    state
}

/// After a sequence that freed everything it allocated, every surviving free
/// item must be a whole chunk: merged all the way up and sitting directly
/// against its chunk's sentinel.
pub fn assert_fully_coalesced(fib: &FibAlloc) {
    fib.each_free_item(|class, item| {
        let size = fib.class_size(class);
        unsafe {
            let beyond = *((item as usize + size * fib_alloc::BLOCK_SIZE.0) as *const usize);
            assert_eq!(
                beyond >> 3,
                0,
                "a fully freed heap holds only chunk-sized items, each ending at a sentinel"
            );
            assert_ne!(beyond & 0b100, 0, "the sentinel is permanently in use");
        }
    });
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ( $name:ident ) => {
        #[test]
        fn $name() {
            quickcheck::QuickCheck::new()
                .tests(1)
                .quickcheck(Operations::run as fn(Operations));
        }
    };
}

// Let the test harness run each of our quickchecks concurrently with each
// other; every run gets its own allocator.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
run_quickchecks!(quickchecks_2);
run_quickchecks!(quickchecks_3);

////////////////////////////////////////////////////////////////////////////////

#[test]
fn two_allocations_coalesce_back_to_one_chunk_item() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(100).unwrap();
    let b = fib.alloc(40).unwrap();
    unsafe {
        fib.dealloc(a);
        fib.dealloc(b);
    }
    let state = snapshot(&fib);
    assert_eq!(state.len(), 1, "both frees must merge back into the chunk");
    assert_fully_coalesced(&fib);
}

#[test]
fn large_allocations_get_their_own_chunks() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(1000).unwrap();
    let b = fib.alloc(1000).unwrap();
    let c = fib.alloc(1000).unwrap();
    assert_ne!(a, b);
    assert_ne!(b, c);
    unsafe {
        fib.dealloc(a);
        fib.dealloc(b);
        fib.dealloc(c);
    }
    // Three chunks, each holding a single full-size free item again, and no
    // merging across chunk boundaries.
    let state = snapshot(&fib);
    assert_eq!(state.len(), 3);
    assert!(state.iter().all(|&(class, _, _)| class == state[0].0));
    assert_fully_coalesced(&fib);

    #[cfg(target_pointer_width = "64")]
    assert_eq!(fib.class_size(state[0].0), 131);
}

#[test]
fn split_then_merge_restores_state_bit_for_bit() {
    let mut fib = FibAlloc::new();
    let p = fib.alloc(1500).unwrap();
    unsafe { fib.dealloc(p) };
    let baseline = snapshot(&fib);
    assert_eq!(baseline.len(), 1);

    // Carve the chunk up and hand it back; addresses and every header bit
    // (size, side, inherited side) must return to the baseline.
    let p = fib.alloc(100).unwrap();
    assert!(snapshot(&fib).len() > 1, "the chunk item must have split");
    unsafe { fib.dealloc(p) };
    assert_eq!(snapshot(&fib), baseline);
}

#[test]
fn unsplittable_minimum_class() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(1).unwrap();
    let b = fib.alloc(300).unwrap();
    unsafe { fib.dealloc(b) };
    let c = fib.alloc(10).unwrap();
    let d = fib.alloc(40).unwrap();
    unsafe {
        fib.dealloc(a);
        fib.dealloc(c);
        fib.dealloc(d);
    }
    assert_fully_coalesced(&fib);
}

#[test]
fn splitting_reuses_carved_pieces() {
    let mut fib = FibAlloc::new();
    let big = fib.alloc(1500).unwrap();
    unsafe { fib.dealloc(big) };
    let a = fib.alloc(100).unwrap();
    let b = fib.alloc(250).unwrap();
    let c = fib.alloc(80).unwrap();
    let d = fib.alloc(25).unwrap();
    unsafe {
        fib.dealloc(d);
        fib.dealloc(a);
    }
    let e = fib.alloc(300).unwrap();
    unsafe {
        fib.dealloc(c);
        fib.dealloc(b);
    }
    let f = fib.alloc(350).unwrap();
    unsafe {
        fib.dealloc(f);
        fib.dealloc(e);
    }
    assert_fully_coalesced(&fib);
}

#[test]
fn interleaved_frees_still_merge() {
    let mut fib = FibAlloc::new();
    let big = fib.alloc(1800).unwrap();
    unsafe { fib.dealloc(big) };
    let a = fib.alloc(525).unwrap();
    let b = fib.alloc(75).unwrap();
    let c = fib.alloc(200).unwrap();
    let d = fib.alloc(70).unwrap();
    unsafe {
        fib.dealloc(c);
        fib.dealloc(b);
    }
    let e = fib.alloc(950).unwrap();
    unsafe { fib.dealloc(d) };
    let f = fib.alloc(281).unwrap();
    unsafe {
        fib.dealloc(e);
        fib.dealloc(a);
        fib.dealloc(f);
    }
    assert_fully_coalesced(&fib);
}

#[test]
fn table_capacity_doubles_under_growth() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(2500).unwrap();
    let b = fib.alloc(10_000).unwrap();
    unsafe {
        fib.dealloc(a);
        fib.dealloc(b);
    }
    // Reaching a 10 KiB class forces the table well past its seeded
    // capacity.
    assert!(fib.class_count() > 16);
    assert_eq!(snapshot(&fib).len(), 2);
    assert_fully_coalesced(&fib);
}

#[test]
fn zero_size_allocation_is_usable() {
    let mut fib = FibAlloc::new();
    let p = fib.alloc(0).unwrap();
    unsafe { fib.dealloc(p) };
    assert_fully_coalesced(&fib);
}

#[test]
fn payloads_are_block_aligned() {
    let mut fib = FibAlloc::new();
    let mut live = Vec::new();
    for size in [1, 7, 8, 9, 40, 100, 1000, 4096, 50_000] {
        let p = fib.alloc(size).unwrap();
        assert_eq!(p.as_ptr() as usize % fib_alloc::BLOCK_SIZE.0, 0);
        live.push(p);
    }
    for p in live {
        unsafe { fib.dealloc(p) };
    }
    assert_fully_coalesced(&fib);
}

////////////////////////////////////////////////////////////////////////////////

// Sequences recorded from earlier randomized failures.

#[test]
fn regression_sequence_0() {
    let mut fib = FibAlloc::new();
    let mut array: [Option<NonNull<u8>>; 4] = [None; 4];
    array[2] = Some(fib.alloc(721).unwrap());
    unsafe { fib.dealloc(array[2].take().unwrap()) };
    array[1] = Some(fib.alloc(501).unwrap());
    array[0] = Some(fib.alloc(12).unwrap());
    array[2] = Some(fib.alloc(307).unwrap());
    unsafe {
        fib.dealloc(array[0].take().unwrap());
        fib.dealloc(array[1].take().unwrap());
    }
    array[1] = Some(fib.alloc(438).unwrap());
    unsafe { fib.dealloc(array[2].take().unwrap()) };
}

#[test]
fn regression_sequence_1() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(97).unwrap();
    let b = fib.alloc(76).unwrap();
    let c = fib.alloc(98).unwrap();
    unsafe { fib.dealloc(c) };
    let _d = fib.alloc(77).unwrap();
    let _e = fib.alloc(91).unwrap();
    unsafe { fib.dealloc(a) };
    let _ = b;
}

#[test]
fn regression_sequence_2() {
    let mut fib = FibAlloc::new();
    let a = fib.alloc(2493).unwrap();
    unsafe { fib.dealloc(a) };
    assert_fully_coalesced(&fib);
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn randomized_soak() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SLOTS: usize = 800;
    const ALLOCATIONS: usize = 1_000;
    const MAX_SIZE: usize = 50_000;

    let mut rng = StdRng::seed_from_u64(0x5eed_f1b);
    let mut fib = FibAlloc::new();
    let mut slots: Vec<Option<(NonNull<u8>, usize, u64)>> = vec![None; SLOTS];
    let mut rotate = 0;
    let mut count = 0;
    let mut next_seed = 0u64;

    while count < ALLOCATIONS {
        let i = rng.gen_range(0..SLOTS);
        match slots[i].take() {
            None => {
                let size = rng.gen_range(1..=MAX_SIZE);
                let area = fib.alloc(size).unwrap();
                next_seed += 1;
                unsafe { fill_pattern(area.as_ptr(), size, next_seed) };
                slots[i] = Some((area, size, next_seed));
                count += 1;
            }
            Some((area, size, seed)) => unsafe {
                check_pattern(area.as_ptr(), size, seed);
                fib.dealloc(area);
            },
        }

        // One rotating slot gets its payload rewritten every round, proving
        // live payloads stay writable while the heap churns around them.
        if let Some((area, size, _)) = slots[rotate] {
            next_seed += 1;
            unsafe { fill_pattern(area.as_ptr(), size, next_seed) };
            slots[rotate] = Some((area, size, next_seed));
        }
        rotate = (rotate + 1) % SLOTS;
    }

    for slot in slots.iter_mut() {
        if let Some((area, size, seed)) = slot.take() {
            unsafe {
                check_pattern(area.as_ptr(), size, seed);
                fib.dealloc(area);
            }
        }
    }
    assert_fully_coalesced(&fib);
}
