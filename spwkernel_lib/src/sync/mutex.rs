//! Mutual exclusion.
//!
//! Hosted builds delegate to `parking_lot`. Kernel builds spin with
//! interrupts disabled, so a lock may be shared with an interrupt
//! handler on the same core.

#[cfg(not(feature = "std"))]
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(not(feature = "std"))]
use crate::interrupt::InterruptGuard;

#[cfg(feature = "std")]
pub struct Mutex<T> {
    mutex: parking_lot::Mutex<T>,
}

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

#[cfg(feature = "std")]
impl<T> Mutex<T> {
    pub const fn new(v: T) -> Self {
        Self {
            mutex: parking_lot::Mutex::new(v),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock()
    }
}

#[cfg(not(feature = "std"))]
pub struct Mutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

#[cfg(not(feature = "std"))]
unsafe impl<T: Send> Send for Mutex<T> {}

#[cfg(not(feature = "std"))]
unsafe impl<T: Send> Sync for Mutex<T> {}

#[cfg(not(feature = "std"))]
impl<T> Mutex<T> {
    pub const fn new(v: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(v),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let _int_guard = InterruptGuard::new();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        MutexGuard {
            mutex: self,
            _int_guard,
        }
    }
}

#[cfg(not(feature = "std"))]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _int_guard: InterruptGuard,
}

#[cfg(not(feature = "std"))]
impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

#[cfg(not(feature = "std"))]
impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(not(feature = "std"))]
impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let m = Mutex::new(0u32);

        {
            let mut guard = m.lock();
            *guard += 1;
        }

        assert_eq!(*m.lock(), 1);
    }
}
