//! Uptime source, used for bounded-timeout waits.

#[cfg(not(feature = "std"))]
use core::sync::atomic::{AtomicPtr, Ordering};

/// Platform hook returning microseconds since boot.
pub struct DelayOps {
    pub uptime: fn() -> u64,
}

#[cfg(not(feature = "std"))]
static DELAY_OPS: AtomicPtr<DelayOps> = AtomicPtr::new(core::ptr::null_mut());

#[cfg(not(feature = "std"))]
pub fn register_delay_ops(ops: &'static DelayOps) {
    DELAY_OPS.store(ops as *const DelayOps as *mut DelayOps, Ordering::Release);
}

/// Uptime in microseconds. Zero until the platform registers its timer.
#[cfg(not(feature = "std"))]
pub fn uptime() -> u64 {
    let ops = DELAY_OPS.load(Ordering::Acquire);
    if ops.is_null() {
        0
    } else {
        (unsafe { &*ops }.uptime)()
    }
}

/// Uptime in microseconds.
#[cfg(feature = "std")]
pub fn uptime() -> u64 {
    use std::time::Instant;

    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
