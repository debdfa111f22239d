//! Mutual-exclusion spin locks.
//!
//! A spin lock busy-waits instead of sleeping, for critical sections short
//! enough that parking a thread would cost more than spinning.
use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use mutex_api::Mutex as MutexApi;

/// A lock guarding a `T`, acquired by spinning.
#[repr(C)]
pub struct SpinLock<T> {
    locked: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // `Ordering::Acquire` ensures loads/stores in the critical section
        // happen strictly after the lock is observed free.
        while self.locked.swap(1, Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Returns `true` if the lock is currently held by someone.
    ///
    /// Racy by nature; useful only for assertions, not synchronization.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
    }
}

impl<T> MutexApi for SpinLock<T> {
    type Data = T;
    type Guard<'a>
        = SpinLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        Self::lock(self)
    }
}

/// An RAII guard that releases its [`SpinLock`] on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // `Ordering::Release` ensures the critical section's stores are
        // visible to the next acquirer before the lock is seen free.
        self.lock.locked.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn lock_excludes_concurrent_mutation() {
        let lock = Arc::new(SpinLock::new(0_u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn is_locked_reflects_guard_lifetime() {
        let lock = SpinLock::new(());
        assert!(!lock.is_locked());
        let guard = lock.lock();
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }
}
