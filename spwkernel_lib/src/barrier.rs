//! Memory barriers for device drivers.
//!
//! Descriptor tables are shared with hardware; the enable-bit handshake
//! requires that buffer addresses are visible before the control word is
//! written (producer side), and that the control word is read before the
//! status it guards (consumer side).

use core::sync::atomic::{fence, Ordering};

pub const BUS_SPACE_BARRIER_READ: u32 = 0x01;
pub const BUS_SPACE_BARRIER_WRITE: u32 = 0x02;

/// All stores before the barrier complete before any stores after it.
#[inline(always)]
pub fn membar_producer() {
    fence(Ordering::Release);
}

/// All loads before the barrier complete before any loads after it.
#[inline(always)]
pub fn membar_consumer() {
    fence(Ordering::Acquire);
}

/// Full memory synchronization barrier.
#[inline(always)]
pub fn membar_sync() {
    fence(Ordering::SeqCst);
}

/// Ordering of MMIO operations.
#[inline(always)]
pub fn bus_space_barrier(_flags: u32) {
    fence(Ordering::SeqCst);
}
