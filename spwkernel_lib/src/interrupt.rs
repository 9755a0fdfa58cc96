//! Disable interrupts.

#[cfg(not(feature = "std"))]
use core::sync::atomic::{AtomicPtr, Ordering};

/// Platform hooks for interrupt masking. The kernel registers these once
/// at boot; until then the guard is a no-op.
pub struct InterruptOps {
    pub get_flag: fn() -> usize,
    pub disable: fn(),
    pub set_flag: fn(usize),
}

#[cfg(not(feature = "std"))]
static INTERRUPT_OPS: AtomicPtr<InterruptOps> = AtomicPtr::new(core::ptr::null_mut());

#[cfg(not(feature = "std"))]
pub fn register_interrupt_ops(ops: &'static InterruptOps) {
    INTERRUPT_OPS.store(ops as *const InterruptOps as *mut InterruptOps, Ordering::Release);
}

/// Save, disable, restore interrupt flag(s).
///
/// Locks taken in interrupt context hold one of these for their whole
/// critical section so that the interrupt handler cannot preempt a lock
/// holder on the same core.
pub struct InterruptGuard {
    #[cfg(not(feature = "std"))]
    flag: Option<usize>,
}

impl InterruptGuard {
    #[cfg(not(feature = "std"))]
    pub fn new() -> Self {
        let ops = INTERRUPT_OPS.load(Ordering::Acquire);
        if ops.is_null() {
            Self { flag: None }
        } else {
            let ops = unsafe { &*ops };
            let flag = (ops.get_flag)();
            (ops.disable)();
            Self { flag: Some(flag) }
        }
    }

    #[cfg(feature = "std")]
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "std"))]
impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(flag) = self.flag {
            let ops = INTERRUPT_OPS.load(Ordering::Acquire);
            if !ops.is_null() {
                (unsafe { &*ops }.set_flag)(flag);
            }
        }
    }
}
