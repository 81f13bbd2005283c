//! Minimal spinning mutual-exclusion primitives.
//!
//! The teacher kernel's own `libs::spinlock` module was not retrieved into
//! the reference pack, but its call sites are everywhere (`SpinLock::new`,
//! `.lock()`, `.try_lock()`, `.is_locked()`, `SpinLockGuard`), and the legacy
//! `exception::softirq` module additionally calls a bare `RawSpinlock` with
//! manual `lock()`/`unlock()`/`try_lock()`/`is_locked()`. This crate
//! reconstructs both shapes from those call sites: `SpinLock<T>` for the
//! common typed/RAII case, `RawSpinlock` for the untyped manual case.
//!
//! Deliberately IRQ-unaware: whether a caller must also disable hardware
//! interrupts around a critical section is a policy decision that depends on
//! the `Hal` implementation, so that composition lives in the main crate
//! (`src/libs/spinlock.rs`) rather than here.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinning mutex guarding a `T`.
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempt to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// True if some caller currently holds the lock.
    ///
    /// Racy by construction (the lock may be released the instant after this
    /// returns) — intended for diagnostics and assertions, not for
    /// synchronization decisions.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// Caller must guarantee it actually holds the lock (i.e. acquired it via
    /// `lock`/`try_lock` and has not yet dropped the guard). Exists for the
    /// handful of call sites that need to unlock across a non-lexical scope
    /// (mirroring the teacher's legacy `modify_lock.unlock()` pattern).
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// An untyped spinlock with manual `lock()`/`unlock()`, for call sites that
/// cannot hold a Rust-scoped guard across the region they protect (e.g. a
/// lock taken in one branch and released in another).
#[derive(Debug, Default)]
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub const INIT: RawSpinlock = RawSpinlock {
        locked: AtomicBool::new(false),
    };

    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion_basic() {
        let lock = SpinLock::new(0usize);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn raw_spinlock_round_trip() {
        let raw = RawSpinlock::new();
        assert!(!raw.is_locked());
        raw.lock();
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        raw.unlock();
        assert!(!raw.is_locked());
    }

    #[test]
    fn contended_across_threads() {
        extern crate std;
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(SpinLock::new(0usize));
        let mut handles = std::vec::Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }
}
