//! The size-class table: one free list per class, class sizes following the
//! generalized Fibonacci recurrence `S[k] = S[k-1] + S[k-4]`.

use core::cmp;
use core::mem;
use core::ptr::{self, NonNull};

use memory_units::Bytes;

use crate::const_init::ConstInit;
use crate::imp;
use crate::item::ItemPtr;
use crate::AllocErr;

/// The seed classes. The smallest must hold a header and two free-list links,
/// which is three machine words, hence the dependence on the word size.
#[cfg(target_pointer_width = "64")]
pub(crate) const SEED_SIZES: [usize; 4] = [3, 4, 5, 7];

#[cfg(target_pointer_width = "32")]
pub(crate) const SEED_SIZES: [usize; 4] = [2, 3, 4, 5];

#[cfg(target_pointer_width = "16")]
pub(crate) const SEED_SIZES: [usize; 4] = [1, 2, 3, 4];

/// One class: its size in blocks and the head of its doubly-linked list of
/// free items. The links themselves live inside the free items' payloads.
pub(crate) struct ClassCell {
    pub(crate) size: usize,
    pub(crate) head: ItemPtr,
}

/// An ordered, growable sequence of `ClassCell`s, indexed by class.
///
/// This is the "bootstrap-minimal" arrangement: the table's storage is a
/// plain region obtained from the host coarse allocator, and growing it never
/// re-enters the buddy allocator it serves.
pub(crate) struct SizeClassTable {
    data: *mut ClassCell,
    len: usize,
    capacity: usize,
}

impl ConstInit for SizeClassTable {
    const INIT: SizeClassTable = SizeClassTable {
        data: ptr::null_mut(),
        len: 0,
        capacity: 0,
    };
}

impl SizeClassTable {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_seeded(&self) -> bool {
        self.capacity != 0
    }

    /// Acquire initial storage and write the seed classes.
    pub(crate) fn seed(&mut self) -> Result<(), AllocErr> {
        debug_assert!(!self.is_seeded());
        let capacity = SEED_SIZES.len();
        self.data = imp::acquire(Self::storage_bytes(capacity))?.as_ptr() as *mut ClassCell;
        self.capacity = capacity;
        for &size in SEED_SIZES.iter() {
            unsafe { self.push_cell(size) }
        }
        Ok(())
    }

    /// Hand the table's storage back to the host, leaving the table empty.
    pub(crate) fn release_storage(&mut self) {
        if !self.data.is_null() {
            unsafe { imp::release(NonNull::new_unchecked(self.data as *mut u8)) }
        }
        self.data = ptr::null_mut();
        self.len = 0;
        self.capacity = 0;
    }

    #[inline]
    pub(crate) fn cell(&self, class: usize) -> &ClassCell {
        assert!(class < self.len);
        unsafe { &*self.data.add(class) }
    }

    #[inline]
    fn cell_mut(&mut self, class: usize) -> &mut ClassCell {
        assert!(class < self.len);
        unsafe { &mut *self.data.add(class) }
    }

    /// The block count `S[class]`.
    #[inline]
    pub(crate) fn size_of(&self, class: usize) -> usize {
        self.cell(class).size
    }

    #[inline]
    pub(crate) fn head(&self, class: usize) -> ItemPtr {
        self.cell(class).head
    }

    /// Append the next class of the recurrence, with an empty free list.
    /// Requires at least the four seed classes to be present already.
    pub(crate) fn extend_once(&mut self) -> Result<(), AllocErr> {
        let k = self.len;
        extra_assert!(k >= SEED_SIZES.len());
        let size = self
            .size_of(k - 1)
            .checked_add(self.size_of(k - 4))
            .ok_or(AllocErr)?;
        if self.len == self.capacity {
            self.grow(self.len + 1)?;
        }
        unsafe { self.push_cell(size) }
        Ok(())
    }

    /// The class whose size is exactly `size` blocks. Panics when no class
    /// matches, which can only mean the caller handed back a pointer this
    /// allocator never produced.
    pub(crate) fn class_of_size(&self, size: usize) -> usize {
        for class in 0..self.len {
            if self.size_of(class) == size {
                return class;
            }
        }
        panic!("freed pointer does not belong to this allocator");
    }

    fn storage_bytes(cells: usize) -> Bytes {
        Bytes(cells * mem::size_of::<ClassCell>())
    }

    unsafe fn push_cell(&mut self, size: usize) {
        debug_assert!(self.len < self.capacity);
        self.data.add(self.len).write(ClassCell {
            size,
            head: ItemPtr::NULL,
        });
        self.len += 1;
    }

    /// Move to a larger storage region, doubling at minimum. This path talks
    /// only to the host coarse allocator.
    fn grow(&mut self, needed: usize) -> Result<(), AllocErr> {
        let new_capacity = cmp::max(2 * self.len, needed);
        let new_data = imp::acquire(Self::storage_bytes(new_capacity))?.as_ptr() as *mut ClassCell;
        unsafe {
            ptr::copy_nonoverlapping(self.data, new_data, self.len);
            imp::release(NonNull::new_unchecked(self.data as *mut u8));
        }
        self.data = new_data;
        self.capacity = new_capacity;
        Ok(())
    }
}

/// Free-list operations. All three leave `in_use` untouched; flipping that
/// bit is the engines' job.
impl SizeClassTable {
    /// Prepend `item` to its class's list.
    pub(crate) unsafe fn insert(&mut self, class: usize, item: ItemPtr) {
        let old_head = self.cell(class).head;
        item.set_next_free(old_head);
        if !old_head.is_null() {
            old_head.set_prev_free(item);
        }
        self.cell_mut(class).head = item;
        item.set_prev_free(ItemPtr::NULL);
    }

    /// Unlink and return the first item of the class's list, which must be
    /// non-empty.
    pub(crate) unsafe fn take_first(&mut self, class: usize) -> ItemPtr {
        let item = self.cell(class).head;
        extra_assert!(!item.is_null());
        let next = item.next_free();
        if !next.is_null() {
            next.set_prev_free(ItemPtr::NULL);
        }
        self.cell_mut(class).head = next;
        item
    }

    /// Find `item` by address in the class's list and splice it out. A miss
    /// is a no-op; the coalescer relies on that tolerance.
    pub(crate) unsafe fn delete_specific(&mut self, class: usize, item: ItemPtr) {
        let mut curr = self.cell(class).head;
        while !curr.is_null() && curr != item {
            curr = curr.next_free();
        }
        if curr.is_null() {
            return;
        }
        let prev = curr.prev_free();
        let next = curr.next_free();
        if !prev.is_null() {
            prev.set_next_free(next);
        }
        if !next.is_null() {
            next.set_prev_free(prev);
        }
        if curr == self.cell(class).head {
            self.cell_mut(class).head = next;
        }
    }
}
