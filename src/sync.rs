//! Locking primitives.
//!
//! [`SpinLock`] is a ticket lock: fetch-add a ticket, spin until served,
//! release by bumping `now_serving`. A bare-metal version would follow
//! the store with an inline `sev` to wake cores parked in `wfe`; on a
//! host target there is nothing to wake, so the guard's drop is just
//! the store.
//!
//! [`IrqSpinLock`] is the IRQ-save flavor from §5: it additionally saves
//! and masks the calling CPU's interrupt state for the critical
//! section's duration via the architecture hook. Only this flavor may
//! be taken from an interrupt handler; the plain [`SpinLock`] only
//! disables preemption.
//!
//! Mutexes that may block are plain [`std::sync::Mutex`], legal only in
//! orphan-VCPU (thread) context per §5, never across a suspension point
//! while a spinlock is held.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::ops::{Deref, DerefMut};

use crate::arch::ArchOps;

pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ticket: u32,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self, ticket }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock
            .now_serving
            .store(self.ticket + 1, Ordering::Release);
    }
}

/// IRQ-save spinlock: disables and restores the calling CPU's interrupt
/// state around the critical section via the architecture hook, so it
/// is sound to take from an interrupt handler (§5).
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

pub struct IrqSpinLockGuard<'a, T> {
    inner: SpinLockGuard<'a, T>,
    saved_flags: u64,
    arch: &'a dyn ArchOps,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinLock::new(data),
        }
    }

    pub fn lock<'a>(&'a self, arch: &'a dyn ArchOps) -> IrqSpinLockGuard<'a, T> {
        let saved_flags = arch.irq_save();
        IrqSpinLockGuard {
            inner: self.inner.lock(),
            saved_flags,
            arch,
        }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

// `self.inner` is itself a `SpinLockGuard<T>`, which derefs to `T`; the
// impls above rely on that auto-deref to satisfy `&T`/`&mut T`.

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.arch.irq_restore(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spinlock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
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
