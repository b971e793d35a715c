/*!

## About

`fib_alloc`: a buddy allocator whose size classes follow a generalized
Fibonacci sequence instead of the powers of two.

Class sizes are block counts obeying `S[k] = S[k-1] + S[k-4]` (on 64-bit
hosts: 3, 4, 5, 7, 10, 14, 19, 26, 36, 50, 69, ...), where a block is eight
bytes. Consecutive classes are therefore much closer together than doubling
classes, which keeps internal fragmentation low, at the price of a slightly
more involved buddy rule: a class-`k` item splits into a *left* buddy of
class `k - 4` and a *right* buddy of class `k - 1`, and an item finds its
buddy three classes away rather than at an XOR-ed address.

Backing memory comes from a host coarse allocator (the C library allocator on
unix, the process heap on Windows) in chunks that are registered for wholesale
release, so dropping the allocator returns every byte to the host.

## Usage

[`FibAlloc`] is the single-actor core: allocation and release take `&mut
self`, and dropping it is the finalize step.

```
let mut fib = fib_alloc::FibAlloc::new();

let area = fib.alloc(100).unwrap();
// ... use the 100 bytes at `area` ...
unsafe { fib.dealloc(area) };
```

[`StaticFibAlloc`] wraps the core in one host mutex and implements
[`GlobalAlloc`], for use from statics:

```
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: fib_alloc::StaticFibAlloc = fib_alloc::StaticFibAlloc::INIT;

let layout = Layout::from_size_align(64, 8).unwrap();
unsafe {
    let p = ALLOC.alloc(layout);
    assert!(!p.is_null());
    ALLOC.dealloc(p, layout);
}
```

Payloads are aligned to the eight-byte block and no further; `StaticFibAlloc`
fails (returns null) any request whose alignment exceeds that, so it is only
suitable as a `#[global_allocator]` in environments where no allocation asks
for alignment above eight bytes.

## `cargo` Features

- **extra_assertions**: Enable expensive integrity checks: after every
  mutation, each free list is verified to be well linked, cycle free, and to
  hold only free items of its class's exact size. Useful when debugging a
  use-after-free or `fib_alloc` itself.

## Implementation Notes and Constraints

- Every item carries a one-word header packing its block count and three
  flag bits; the two words after the header double as free-list links while
  the item is free. The minimum class is chosen per word size so that the
  three words always fit.

- A host chunk holds one registry link word, one maximal item, and a one-word
  sentinel marked permanently in use:

```text
+-----------+--------------------------------------------+----------+
| registry  | item: header | payload ...                 | sentinel |
| link word | (S[k] * 8 bytes)                           |   word   |
+-----------+--------------------------------------------+----------+
```

  The sentinel is why coalescing needs no boundary test: walking right it
  always meets an in-use "item" and stops, so merges can never cross a chunk.

- Freeing is eager-coalescing: buddies are merged back up immediately, so
  free lists stay short and the linear scans over them stay cheap.

- The allocator is single-actor and not reentrant. `FibAlloc` encodes that
  with `&mut self`; `StaticFibAlloc` serializes callers with one mutex and
  nothing finer.

- Chunk acquisition is monotone: a new chunk is never smaller than the
  largest class in the table at the time (and never smaller than 64 words),
  amortizing host calls as the table grows.

 */

#![deny(missing_docs)]
#![cfg_attr(not(feature = "use_std_for_test_debugging"), no_std)]

#[macro_use]
extern crate cfg_if;

#[macro_use]
mod extra_assert;

cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        pub(crate) use self::imp_unix as imp;
    } else if #[cfg(windows)] {
        mod imp_windows;
        pub(crate) use self::imp_windows as imp;
    } else {
        compile_error! {
            "There is no `fib_alloc` host backend for this target; want to send a pull request? :)"
        }
    }
}

mod const_init;
mod item;
mod size_classes;

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr::{self, NonNull};
use memory_units::Bytes;

use crate::const_init::ConstInit;
use crate::item::{ItemPtr, Side};
use crate::size_classes::SizeClassTable;

/// The fixed allocation quantum. Every item's size is a whole number of
/// blocks.
pub const BLOCK_SIZE: Bytes = Bytes(8);

/// One machine word, reserved at the front of every item for its header.
const HEADER_SIZE: Bytes = Bytes(mem::size_of::<usize>());

/// The smallest number of blocks a fresh host chunk may carry (64 words).
/// Together with acquiring only at the table's last class, this makes
/// successive chunk sizes grow monotonically.
const MIN_CHUNK_BLOCKS: usize = blocks_for(mem::size_of::<usize>() << 6);

/// How many whole blocks cover `bytes`.
const fn blocks_for(bytes: usize) -> usize {
    (bytes + BLOCK_SIZE.0 - 1) / BLOCK_SIZE.0
}

/// An error returned when the host coarse allocator cannot provide more
/// memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocErr;

/// The registry of raw host regions, single-linked through each region's
/// first word. It exists solely so that finalization can hand every chunk
/// back to the host, whatever state its items are in.
struct ChunkList {
    head: *mut u8,
}

impl ConstInit for ChunkList {
    const INIT: ChunkList = ChunkList {
        head: ptr::null_mut(),
    };
}

impl ChunkList {
    /// Acquire a fresh chunk sized for one class-`blocks` item, link it into
    /// the registry, lay down the sentinel, and return the item.
    ///
    /// `blocks` is always the size of some class in the table.
    unsafe fn alloc_new_item(&mut self, blocks: usize) -> Result<ItemPtr, AllocErr> {
        let bytes = blocks
            .checked_mul(BLOCK_SIZE.0)
            .and_then(|b| b.checked_add(2 * HEADER_SIZE.0))
            .ok_or(AllocErr)?;
        let chunk = imp::acquire(Bytes(bytes))?.as_ptr();

        (chunk as *mut *mut u8).write(self.head);
        self.head = chunk;

        let item = ItemPtr::from_raw(chunk.add(HEADER_SIZE.0));
        item.write_header(blocks, Side::Left, false, Side::Left);

        let sentinel = ItemPtr::from_raw(chunk.add(HEADER_SIZE.0 + blocks * BLOCK_SIZE.0));
        sentinel.write_header(0, Side::Right, true, Side::Left);

        Ok(item)
    }

    /// Hand every chunk back to the host.
    unsafe fn release_all(&mut self) {
        while !self.head.is_null() {
            let next = (self.head as *mut *mut u8).read();
            imp::release(NonNull::new_unchecked(self.head));
            self.head = next;
        }
    }
}

/// A generalized Fibonacci buddy allocator.
///
/// The allocator is single-actor: all operations take `&mut self` and run to
/// completion. Dropping it releases every host chunk wholesale, which is only
/// sound for the caller if no allocation handed out by [`alloc`] is used
/// afterwards.
///
/// [`alloc`]: FibAlloc::alloc
pub struct FibAlloc {
    classes: SizeClassTable,
    chunks: ChunkList,
}

impl ConstInit for FibAlloc {
    const INIT: FibAlloc = FibAlloc {
        classes: SizeClassTable::INIT,
        chunks: ChunkList::INIT,
    };
}

impl FibAlloc {
    /// An initial `const` default construction of a `FibAlloc`.
    ///
    /// Usable for initializing `static`s; see [`StaticFibAlloc`] for the
    /// shareable wrapper.
    pub const INIT: Self = <Self as ConstInit>::INIT;

    /// Create a new, empty allocator. No host memory is acquired until the
    /// first allocation.
    pub fn new() -> FibAlloc {
        Self::INIT
    }

    /// Allocate at least `size` usable bytes and return a pointer to them,
    /// aligned to the block size. The contents are undefined.
    ///
    /// `size` may be zero; the minimum class is allocated.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocErr> {
        if !self.classes.is_seeded() {
            self.classes.seed()?;
        }

        // One word on top of the request for the header, rounded up to whole
        // blocks.
        let blocks = match size.checked_add(HEADER_SIZE.0 + (BLOCK_SIZE.0 - 1)) {
            Some(total) => total / BLOCK_SIZE.0,
            None => return Err(AllocErr),
        };

        let class = self.locate_source_class(blocks)?;

        unsafe {
            let item = if self.classes.head(class).is_null() {
                self.chunks.alloc_new_item(self.classes.size_of(class))?
            } else {
                self.classes.take_first(class)
            };

            let item = self.split_item(class, item, blocks);
            item.set_in_use(true);
            assert_is_valid_table(&self.classes);

            let payload = item.payload();
            extra_assert_eq!(payload as usize % BLOCK_SIZE.0, 0);
            Ok(NonNull::new_unchecked(payload))
        }
    }

    /// Return an allocation to the free lists and merge it with as many free
    /// buddies as possible.
    ///
    /// # Safety
    ///
    /// `area` must have been returned by [`alloc`] on this same allocator,
    /// must not have been freed already, and must not be used afterwards.
    ///
    /// [`alloc`]: FibAlloc::alloc
    pub unsafe fn dealloc(&mut self, area: NonNull<u8>) {
        let item = ItemPtr::from_payload(area.as_ptr());
        let class = self.classes.class_of_size(item.size());
        item.set_in_use(false);
        self.classes.insert(class, item);
        self.coalesce(class);
        assert_is_valid_table(&self.classes);
    }

    /// Walk the table for the first class that can satisfy a request for
    /// `blocks` blocks, extending the table as the scan passes its end.
    ///
    /// A class qualifies when it is large enough and either already has a
    /// free item, or is the last class and at least [`MIN_CHUNK_BLOCKS`], in
    /// which case the caller acquires a fresh chunk of that size. Smaller
    /// tail classes are skipped over (extending the table as needed) so that
    /// host acquisitions never shrink.
    fn locate_source_class(&mut self, blocks: usize) -> Result<usize, AllocErr> {
        let mut class = 0;
        loop {
            let last = self.classes.len() - 1;
            let cell = self.classes.cell(class);
            if cell.size >= blocks
                && (!cell.head.is_null() || (class == last && cell.size >= MIN_CHUNK_BLOCKS))
            {
                return Ok(class);
            }
            if class == last {
                self.classes.extend_once()?;
            }
            class += 1;
        }
    }

    /// Split `item` down until it lands in the smallest class still holding
    /// `blocks` blocks, pushing the unused half of each split onto its free
    /// list.
    ///
    /// On entry and exit `item` is free and unlinked. Below class 4 the
    /// recurrence has no left half, so the loop also stops there. When both
    /// halves would do, the left is kept and the right goes to the free
    /// lists, preserving larger right halves for future requests.
    unsafe fn split_item(&mut self, mut class: usize, mut item: ItemPtr, blocks: usize) -> ItemPtr {
        while class > 4 && self.classes.size_of(class - 1) >= blocks {
            let left_size = self.classes.size_of(class - 4);
            let right_size = self.classes.size_of(class - 1);

            // The children remember the parent's bits: the left its side, the
            // right its inherited side. Merging reads them back out.
            let left_inherits = item.side();
            let right_inherits = item.inherited();

            let left = item;
            let right = item.forward_blocks(left_size);
            left.write_header(left_size, Side::Left, false, left_inherits);
            right.write_header(right_size, Side::Right, false, right_inherits);

            if left_size >= blocks {
                self.classes.insert(class - 1, right);
                class -= 4;
                item = left;
            } else {
                self.classes.insert(class - 4, left);
                class -= 1;
                item = right;
            }
        }
        item
    }

    /// Locate the buddy of `item` at `class`, and the buddy's class.
    ///
    /// A left item's parent is four classes up, so its right sibling is three
    /// classes up and starts where the item ends; symmetrically a right
    /// item's left sibling is three classes down and ends where the item
    /// starts.
    unsafe fn buddy_of(&self, item: ItemPtr, class: usize) -> (ItemPtr, usize) {
        match item.side() {
            Side::Left => (item.forward_blocks(item.size()), class + 3),
            Side::Right => {
                let buddy_class = class - 3;
                (
                    item.backward_blocks(self.classes.size_of(buddy_class)),
                    buddy_class,
                )
            }
        }
    }

    /// Merge the just-freed head of `class`'s list with consecutive free
    /// buddies, restoring the parents' header bits as recorded at split time.
    /// Stops at an in-use buddy; the chunk sentinel guarantees one is always
    /// eventually met.
    unsafe fn coalesce(&mut self, mut class: usize) {
        let mut item = self.classes.head(class);
        let (mut buddy, mut buddy_class) = self.buddy_of(item, class);
        loop {
            if buddy.is_in_use() {
                return;
            }
            // A buddy whose header reports some other class's size has been
            // split and not yet reassembled; merging would swallow its live
            // pieces.
            if buddy_class >= self.classes.len()
                || self.classes.size_of(buddy_class) != buddy.size()
            {
                return;
            }

            self.classes.delete_specific(class, item);
            self.classes.delete_specific(buddy_class, buddy);

            let (left, right) = match item.side() {
                Side::Left => {
                    class += 4;
                    (item, buddy)
                }
                Side::Right => {
                    class += 1;
                    (buddy, item)
                }
            };

            // The parent reoccupies the left child's bytes; its side and
            // inherited side come back out of the children's inherited bits.
            item = left;
            let side = left.inherited();
            let inherited = right.inherited();
            item.set_side(side);
            item.set_inherited(inherited);
            item.set_size(self.classes.size_of(class));
            item.set_in_use(false);

            let (next_buddy, next_buddy_class) = self.buddy_of(item, class);
            buddy = next_buddy;
            buddy_class = next_buddy_class;

            self.classes.insert(class, item);
        }
    }
}

impl Default for FibAlloc {
    fn default() -> FibAlloc {
        FibAlloc::new()
    }
}

impl Drop for FibAlloc {
    fn drop(&mut self) {
        unsafe {
            self.chunks.release_all();
        }
        self.classes.release_storage();
    }
}

/// Free-list introspection, used by the property tests to snapshot and
/// compare allocator state.
impl FibAlloc {
    /// How many size classes the table currently holds.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// The block count of size class `class`.
    pub fn class_size(&self, class: usize) -> usize {
        self.classes.size_of(class)
    }

    /// Walk every free list in class order, calling `f` with each free
    /// item's class index and address.
    pub fn each_free_item<F>(&self, mut f: F)
    where
        F: FnMut(usize, *const u8),
    {
        unsafe {
            for class in 0..self.classes.len() {
                let mut item = self.classes.head(class);
                while !item.is_null() {
                    f(class, item.as_raw() as *const u8);
                    item = item.next_free();
                }
            }
        }
    }
}

/// Verify that every free list is well formed: doubly linked, cycle free,
/// and holding only free items of its class's exact size.
#[cfg(feature = "extra_assertions")]
fn assert_is_valid_table(classes: &SizeClassTable) {
    unsafe {
        for class in 0..classes.len() {
            let size = classes.size_of(class);
            let mut slow = classes.head(class);
            if slow.is_null() {
                continue;
            }
            assert!(slow.prev_free().is_null(), "list head has no predecessor");
            // Classic tortoise-and-hare to rule out cycles while checking
            // each node.
            let mut fast = slow.next_free();
            while !slow.is_null() {
                assert_eq!(slow.size(), size, "free item size must match its class");
                assert!(!slow.is_in_use(), "free lists hold only free items");
                let next = slow.next_free();
                if !next.is_null() {
                    assert_eq!(next.prev_free(), slow, "prev(next(item)) == item");
                }
                if !fast.is_null() {
                    assert!(slow != fast, "free list must not have cycles");
                    fast = fast.next_free();
                    if !fast.is_null() {
                        fast = fast.next_free();
                    }
                }
                slow = next;
            }
        }
    }
}

#[cfg(not(feature = "extra_assertions"))]
#[inline(always)]
fn assert_is_valid_table(_classes: &SizeClassTable) {}

/// A [`FibAlloc`] behind one host mutex, shareable from a `static`.
///
/// This implements [`GlobalAlloc`], with two deliberate narrowings of that
/// contract:
///
/// - payloads are aligned to [`BLOCK_SIZE`] and no further, so any request
///   with a larger alignment fails (returns null);
/// - the backing chunks are never returned to the host (a `static` is never
///   finalized).
pub struct StaticFibAlloc {
    inner: imp::Exclusive<FibAlloc>,
}

unsafe impl Sync for StaticFibAlloc {}

impl ConstInit for StaticFibAlloc {
    const INIT: StaticFibAlloc = StaticFibAlloc {
        inner: imp::Exclusive::INIT,
    };
}

impl StaticFibAlloc {
    /// An initial `const` default construction of a `StaticFibAlloc`.
    ///
    /// This is usable for initializing `static`s.
    pub const INIT: Self = <Self as ConstInit>::INIT;
}

unsafe impl GlobalAlloc for StaticFibAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_SIZE.0 {
            return ptr::null_mut();
        }
        if layout.size() == 0 {
            // Ensure that our made up pointer is properly aligned by using
            // the alignment as the pointer.
            return layout.align() as *mut u8;
        }
        self.inner.with_lock(|fib| match fib.alloc(layout.size()) {
            Ok(area) => area.as_ptr(),
            Err(AllocErr) => ptr::null_mut(),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            // Made up pointers from zero sized allocations are not freed.
            return;
        }
        if let Some(area) = NonNull::new(ptr) {
            self.inner.with_lock(|fib| fib.dealloc(area));
        }
    }
}

#[test]
fn smallest_class_holds_header_and_links() {
    assert!(
        size_classes::SEED_SIZES[0] * BLOCK_SIZE.0 >= 3 * mem::size_of::<usize>(),
        "free items store a header and two links"
    );
}

#[cfg(target_pointer_width = "64")]
#[test]
fn chunk_floor_is_512_bytes() {
    assert_eq!(MIN_CHUNK_BLOCKS * BLOCK_SIZE.0, 512);
}
