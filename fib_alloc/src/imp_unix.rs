use core::cell::UnsafeCell;
use core::ptr::NonNull;

use memory_units::Bytes;

use crate::const_init::ConstInit;
use crate::AllocErr;

/// Acquire a raw region of at least `bytes` from the host. The C library
/// allocator already provides the contract we need: natural alignment, no
/// zeroing, and release in any order without a recorded length.
pub(crate) fn acquire(bytes: Bytes) -> Result<NonNull<u8>, AllocErr> {
    unsafe { NonNull::new(libc::malloc(bytes.0) as *mut u8).ok_or(AllocErr) }
}

/// Return a region previously handed out by `acquire`.
///
/// # Safety
///
/// `region` must have come from `acquire` on this host and must not be
/// touched again afterwards.
pub(crate) unsafe fn release(region: NonNull<u8>) {
    libc::free(region.as_ptr() as *mut libc::c_void);
}

/// One value guarded by a host mutex, const-constructible so it can live in
/// a `static`. `PTHREAD_MUTEX_INITIALIZER` is a compile-time constant, so the
/// lock needs no setup on first use.
// A whole cache line, to keep neighboring statics from false-sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    inner: UnsafeCell<T>,
    lock: UnsafeCell<libc::pthread_mutex_t>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: UnsafeCell::new(T::INIT),
        lock: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
    };
}

impl<T> Exclusive<T> {
    /// Run `f` with the lock held and a mutable view of the guarded value.
    ///
    /// # Safety
    ///
    /// `f` must not call back into this same `Exclusive`. The mutex return
    /// codes are only checked under the "extra_assertions" feature, so a
    /// re-entrant caller can end up with a second mutable view of the value
    /// rather than a clean deadlock, and that aliasing is UB.
    #[inline]
    pub(crate) unsafe fn with_lock<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let locked = libc::pthread_mutex_lock(self.lock.get());
        extra_assert_eq!(locked, 0, "acquiring the host mutex must succeed");

        let result = f(&mut *self.inner.get());

        let unlocked = libc::pthread_mutex_unlock(self.lock.get());
        extra_assert_eq!(unlocked, 0, "releasing the host mutex must succeed");

        result
    }
}
