//! Sleep locks: mutexes meant to be held across blocking operations (disk
//! I/O) where spinning would waste the CPU.
//!
//! This kernel has no process scheduler of its own, so "sleeping" here is a
//! spin loop that yields the hart between attempts rather than parking a
//! process; the type stays distinct from [`SpinLock`](crate::spinlock::SpinLock)
//! because callers reason about them differently — a sleep lock's
//! critical section may legitimately run for the duration of a disk
//! transfer, a spin lock's must not.
use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use mutex_api::Mutex as MutexApi;

/// A lock intended to be held across long (blocking) operations.
pub struct SleepLock<T> {
    locked: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, yielding between attempts while it is held.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        while self.locked.swap(1, Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
        SleepLockGuard { lock: self }
    }
}

impl<T> MutexApi for SleepLock<T> {
    type Data = T;
    type Guard<'a>
        = SleepLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Self::lock(self)
    }
}

/// An RAII guard that releases its [`SleepLock`] on drop.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(0, Ordering::Release);
    }
}
