//! The allocation unit (the *item*) and its one-word header codec.

use core::ptr;

use crate::BLOCK_SIZE;

/// Which half of a buddy pair an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    #[inline]
    fn from_bit(bit: usize) -> Side {
        if bit == 0 {
            Side::Left
        } else {
            Side::Right
        }
    }

    #[inline]
    fn bit(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// A raw handle to an item: a whole-block region whose first machine word
/// packs the four header fields, and whose remaining bytes are either handed
/// out to the caller or reused as free-list links.
///
/// Header word, low bits first:
///
/// ```text
/// bit 0       inherited side: the side this item's parent had, re-installed
///             when the pair merges back together
/// bit 1       side: Left or Right half of its buddy pair
/// bit 2       in-use flag
/// bits 3..    size, as a block count (not a class index)
/// ```
///
/// `ItemPtr` is deliberately not a reference type. Ownership of the bytes it
/// designates migrates between the free lists and the caller, and nothing
/// here tracks that statically; every accessor is `unsafe` and requires the
/// handle to point into live chunk memory. Free-list links are themselves
/// stored as `ItemPtr` values in the two words after the header, never as
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItemPtr(*mut usize);

const INH_BIT: usize = 0b001;
const SIDE_BIT: usize = 0b010;
const IN_USE_BIT: usize = 0b100;
const FLAGS_MASK: usize = 0b111;
const SIZE_SHIFT: u32 = 3;

impl ItemPtr {
    pub(crate) const NULL: ItemPtr = ItemPtr(ptr::null_mut());

    #[inline]
    pub(crate) fn from_raw(raw: *mut u8) -> ItemPtr {
        ItemPtr(raw as *mut usize)
    }

    #[inline]
    pub(crate) fn as_raw(self) -> *mut u8 {
        self.0 as *mut u8
    }

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Recover the item from the payload pointer handed out by `alloc`. The
    /// header is the word immediately before the payload.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: *mut u8) -> ItemPtr {
        ItemPtr((payload as *mut usize).offset(-1))
    }

    /// The payload: everything after the header word.
    #[inline]
    pub(crate) unsafe fn payload(self) -> *mut u8 {
        self.0.offset(1) as *mut u8
    }

    /// The item starting `blocks` blocks after this one.
    #[inline]
    pub(crate) unsafe fn forward_blocks(self, blocks: usize) -> ItemPtr {
        ItemPtr::from_raw(self.as_raw().add(blocks * BLOCK_SIZE.0))
    }

    /// The item starting `blocks` blocks before this one.
    #[inline]
    pub(crate) unsafe fn backward_blocks(self, blocks: usize) -> ItemPtr {
        ItemPtr::from_raw(self.as_raw().sub(blocks * BLOCK_SIZE.0))
    }
}

/// Header accessors. Each setter preserves the other three fields.
impl ItemPtr {
    #[inline]
    unsafe fn header(self) -> usize {
        self.0.read()
    }

    /// Compose and store a complete header word. This is the only way to give
    /// a header to fresh (uninitialized) memory; the read-modify-write
    /// setters below require an already-written header.
    #[inline]
    pub(crate) unsafe fn write_header(
        self,
        size: usize,
        side: Side,
        in_use: bool,
        inherited: Side,
    ) {
        let word = (size << SIZE_SHIFT)
            | if in_use { IN_USE_BIT } else { 0 }
            | (side.bit() << 1)
            | inherited.bit();
        self.0.write(word);
    }

    /// The item's size in blocks.
    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        self.header() >> SIZE_SHIFT
    }

    #[inline]
    pub(crate) unsafe fn set_size(self, size: usize) {
        self.0.write((self.header() & FLAGS_MASK) | (size << SIZE_SHIFT));
    }

    #[inline]
    pub(crate) unsafe fn is_in_use(self) -> bool {
        self.header() & IN_USE_BIT != 0
    }

    #[inline]
    pub(crate) unsafe fn set_in_use(self, in_use: bool) {
        let word = self.header() & !IN_USE_BIT;
        self.0.write(word | if in_use { IN_USE_BIT } else { 0 });
    }

    #[inline]
    pub(crate) unsafe fn side(self) -> Side {
        Side::from_bit((self.header() & SIDE_BIT) >> 1)
    }

    #[inline]
    pub(crate) unsafe fn set_side(self, side: Side) {
        let word = self.header() & !SIDE_BIT;
        self.0.write(word | (side.bit() << 1));
    }

    #[inline]
    pub(crate) unsafe fn inherited(self) -> Side {
        Side::from_bit(self.header() & INH_BIT)
    }

    #[inline]
    pub(crate) unsafe fn set_inherited(self, side: Side) {
        let word = self.header() & !INH_BIT;
        self.0.write(word | side.bit());
    }
}

/// Free-list links, stored in the first two payload words while the item is
/// free. The minimum class is sized so that header plus both links always
/// fit.
impl ItemPtr {
    #[inline]
    pub(crate) unsafe fn prev_free(self) -> ItemPtr {
        ItemPtr(self.0.add(1).read() as *mut usize)
    }

    #[inline]
    pub(crate) unsafe fn set_prev_free(self, prev: ItemPtr) {
        self.0.add(1).write(prev.0 as usize);
    }

    #[inline]
    pub(crate) unsafe fn next_free(self) -> ItemPtr {
        ItemPtr(self.0.add(2).read() as *mut usize)
    }

    #[inline]
    pub(crate) unsafe fn set_next_free(self, next: ItemPtr) {
        self.0.add(2).write(next.0 as usize);
    }
}
