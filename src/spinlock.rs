//! Mutual-exclusion locks layered on top of the raw spinlock primitive.
//!
//! §1 lists "the raw spinlock primitive (`acquire`, `release`, `holding`)"
//! as an external collaborator the core uses but does not implement; here
//! that primitive is the `spin` crate's busy-waiting `Mutex`. What the core
//! *does* own is the `push_off`/`pop_off` interrupt-nesting discipline
//! around it (every acquire pushes, every release pops) and the
//! `SpinlockProtected` wrapper used for `wait_lock`-guarded fields such as
//! `Proc::parent`.

use std::ops::{Deref, DerefMut};

use crate::cpu::{pop_off, push_off};

/// A lock that always pushes/pops the interrupt-disable nesting count around
/// its critical section, matching every acquire/release in the spec.
pub struct Spinlock<T> {
    name: &'static str,
    inner: spin::Mutex<T>,
}

pub struct SpinlockGuard<'a, T> {
    name: &'static str,
    inner: spin::MutexGuard<'a, T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(data),
        }
    }

    /// Acquires the lock, spinning until it is free. Disables interrupts on
    /// the calling CPU for as long as the returned guard is alive.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        push_off();
        let inner = self.inner.lock();
        SpinlockGuard {
            name: self.name,
            inner,
        }
    }

    /// Whether the lock is currently held by anyone. Used only for the
    /// panic-on-reentrance check a real `acquire()` performs; never used to
    /// make a scheduling decision, since that would be racy.
    pub fn holding(&self) -> bool {
        self.inner.is_locked()
    }

    /// Non-blocking acquire. Used by `procdump` (C7), which must never
    /// contend on a lock a wedged system might be holding forever.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        push_off();
        match self.inner.try_lock() {
            Some(inner) => Some(SpinlockGuard {
                name: self.name,
                inner,
            }),
            None => {
                pop_off();
                None
            }
        }
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.name;
        pop_off();
    }
}

/// A value that may only be read or written while holding some other,
/// caller-supplied spinlock — used for `Proc::parent`, which §3 requires be
/// "read/written only while holding `wait_lock`".
pub struct SpinlockProtected<T> {
    data: std::cell::UnsafeCell<T>,
}

// SAFETY: access is only permitted through `get`/`get_mut`, which require
// proof (a `SpinlockGuard` borrow) that the protecting lock is held.
unsafe impl<T: Send> Sync for SpinlockProtected<T> {}

impl<T> SpinlockProtected<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: std::cell::UnsafeCell::new(data),
        }
    }

    /// Reads the value. The `_guard` parameter proves the protecting lock
    /// (e.g. `wait_lock`) is held by the caller.
    pub fn get<L>(&self, _guard: &SpinlockGuard<'_, L>) -> &T {
        unsafe { &*self.data.get() }
    }

    pub fn get_mut<L>(&self, _guard: &mut SpinlockGuard<'_, L>) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}
