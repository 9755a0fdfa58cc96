//! Binary semaphore for blocking waits.
//!
//! A taker blocks until a giver posts, the semaphore is flushed, or a
//! timeout expires. Posts do not accumulate past one.

use core::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemErr {
    /// The timeout expired before a post.
    Timeout,
    /// The semaphore was flushed while waiting.
    Flushed,
}

#[cfg(feature = "std")]
pub struct BinSemaphore {
    state: parking_lot::Mutex<State>,
    condvar: parking_lot::Condvar,
}

#[cfg(feature = "std")]
#[derive(Default)]
struct State {
    available: bool,
    flushed: bool,
}

#[cfg(feature = "std")]
impl BinSemaphore {
    pub const fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(State {
                available: false,
                flushed: false,
            }),
            condvar: parking_lot::Condvar::new(),
        }
    }

    /// Block until a post or a flush. `timeout` of `None` waits forever.
    pub fn take(&self, timeout: Option<Duration>) -> Result<(), SemErr> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.flushed {
                state.flushed = false;
                return Err(SemErr::Flushed);
            }

            if state.available {
                state.available = false;
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        if state.flushed {
                            state.flushed = false;
                            return Err(SemErr::Flushed);
                        }
                        if state.available {
                            state.available = false;
                            return Ok(());
                        }
                        return Err(SemErr::Timeout);
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }

    /// Post the semaphore. A second post before a take is absorbed.
    pub fn give(&self) {
        let mut state = self.state.lock();
        state.available = true;
        self.condvar.notify_one();
    }

    /// Wake the waiter with `SemErr::Flushed`.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.flushed = true;
        self.condvar.notify_all();
    }
}

#[cfg(not(feature = "std"))]
pub struct BinSemaphore {
    state: core::sync::atomic::AtomicU32,
}

#[cfg(not(feature = "std"))]
impl BinSemaphore {
    const EMPTY: u32 = 0;
    const AVAILABLE: u32 = 1;
    const FLUSHED: u32 = 2;

    pub const fn new() -> Self {
        Self {
            state: core::sync::atomic::AtomicU32::new(Self::EMPTY),
        }
    }

    pub fn take(&self, timeout: Option<Duration>) -> Result<(), SemErr> {
        use core::sync::atomic::Ordering;

        let start = crate::delay::uptime();
        let timeout_us = timeout.map(|t| t.as_micros() as u64);

        loop {
            match self.state.swap(Self::EMPTY, Ordering::Acquire) {
                Self::AVAILABLE => return Ok(()),
                Self::FLUSHED => return Err(SemErr::Flushed),
                _ => (),
            }

            if let Some(timeout_us) = timeout_us {
                if crate::delay::uptime().wrapping_sub(start) >= timeout_us {
                    return Err(SemErr::Timeout);
                }
            }

            core::hint::spin_loop();
        }
    }

    pub fn give(&self) {
        use core::sync::atomic::Ordering;
        let _ = self.state.compare_exchange(
            Self::EMPTY,
            Self::AVAILABLE,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    pub fn flush(&self) {
        use core::sync::atomic::Ordering;
        self.state.store(Self::FLUSHED, Ordering::Release);
    }
}

impl Default for BinSemaphore {
    fn default() -> Self {
        Self::new()
    }
}
