//! Synchronization primitives.

pub mod msgq;
pub mod mutex;
pub mod semaphore;
