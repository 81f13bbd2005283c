//! IRQ-safe spinlock: `pipeline_sync::SpinLock` plus a matching hw-IRQ
//! save/restore, composed here (rather than in `pipeline_sync`) because it
//! needs a concrete [`Hal`](crate::hal::Hal) to talk to hardware.
//!
//! Grounded on the teacher's `libs::spinlock` call-site shape:
//! `SpinLock::new`, `.lock()`, `.lock_irqsave()`, `SpinLockGuard`.

use alloc::sync::Arc;

use pipeline_sync::{SpinLock as RawLock, SpinLockGuard as RawGuard};

use crate::hal::{Hal, HwFlags};

/// A spinlock that also disables hardware IRQs for the lifetime of the
/// guard, for data shared across ISR and non-ISR context on the same CPU.
pub struct SpinLock<T: ?Sized> {
    hal: Arc<dyn Hal>,
    inner: RawLock<T>,
}

impl<T> SpinLock<T> {
    pub fn new(hal: Arc<dyn Hal>, data: T) -> Self {
        Self {
            hal,
            inner: RawLock::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock without touching the hw IF flag. Callers that are
    /// already guaranteed hw-IRQs-off (e.g. inside `handle_irq`) should use
    /// this to avoid redundant save/restore.
    pub fn lock(&self) -> RawGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquire the lock and disable hw IRQs; both are restored when the
    /// returned guard is dropped.
    pub fn lock_irqsave(&self) -> SpinLockIrqGuard<'_, T> {
        let flags = unsafe { self.hal.local_irq_save_hw() };
        SpinLockIrqGuard {
            hal: &self.hal,
            flags,
            guard: Some(self.inner.lock()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard returned by [`SpinLock::lock_irqsave`]: releases the spinlock, then
/// restores the hardware IF flag, in that order, on drop.
pub struct SpinLockIrqGuard<'a, T: ?Sized> {
    hal: &'a Arc<dyn Hal>,
    flags: HwFlags,
    // `Option` so `Drop` can release the spinlock before restoring the hw
    // IF flag; field-order drop would do it the other way around.
    guard: Option<RawGuard<'a, T>>,
}

impl<'a, T: ?Sized> core::ops::Deref for SpinLockIrqGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T: ?Sized> core::ops::DerefMut for SpinLockIrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T: ?Sized> Drop for SpinLockIrqGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        unsafe { self.hal.local_irq_restore_hw(self.flags) };
    }
}
