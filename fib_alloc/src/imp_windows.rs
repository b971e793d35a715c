use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

use memory_units::Bytes;

use winapi::shared::minwindef::FALSE;
use winapi::um::heapapi::{GetProcessHeap, HeapAlloc, HeapFree};
use winapi::um::synchapi::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

use crate::const_init::ConstInit;
use crate::AllocErr;

/// Acquire a raw region of at least `bytes` from the process heap.
pub(crate) fn acquire(bytes: Bytes) -> Result<NonNull<u8>, AllocErr> {
    unsafe { NonNull::new(HeapAlloc(GetProcessHeap(), 0, bytes.0) as *mut u8).ok_or(AllocErr) }
}

/// Return a region previously handed out by `acquire`.
///
/// # Safety
///
/// `region` must have come from `acquire` on this host and must not be
/// touched again afterwards.
pub(crate) unsafe fn release(region: NonNull<u8>) {
    let code = HeapFree(GetProcessHeap(), 0, region.as_ptr() as *mut _);
    extra_assert!(code != 0, "HeapFree should return nonzero");
}

/// One value guarded by a host mutex, const-constructible so it can live in
/// a `static`. Win32 has no static mutex initializer, so the handle starts
/// null and whoever takes the lock first creates it.
// A whole cache line, to keep neighboring statics from false-sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    inner: UnsafeCell<T>,
    lock: UnsafeCell<HANDLE>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: UnsafeCell::new(T::INIT),
        lock: UnsafeCell::new(ptr::null_mut()),
    };
}

impl<T> Exclusive<T> {
    /// Run `f` with the lock held and a mutable view of the guarded value.
    ///
    /// # Safety
    ///
    /// `f` must not call back into this same `Exclusive`. The mutex results
    /// are only checked under the "extra_assertions" feature, and a Win32
    /// mutex is recursive besides, so a re-entrant caller gets a second
    /// mutable view of the value instead of deadlocking, and that aliasing
    /// is UB.
    #[inline]
    pub(crate) unsafe fn with_lock<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let lock = self.lock.get();
        if (*lock).is_null() {
            *lock = CreateMutexW(ptr::null_mut(), FALSE, ptr::null());
            extra_assert!(!(*lock).is_null(), "creating the host mutex must succeed");
        }

        let waited = WaitForSingleObject(*lock, INFINITE);
        extra_assert_eq!(waited, WAIT_OBJECT_0, "acquiring the host mutex must succeed");

        let result = f(&mut *self.inner.get());

        let released = ReleaseMutex(*lock);
        extra_assert!(released != 0, "releasing the host mutex must succeed");

        result
    }
}
