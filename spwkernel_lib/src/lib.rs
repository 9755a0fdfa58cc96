#![cfg_attr(not(feature = "std"), no_std)]

pub mod addr;
pub mod barrier;
pub mod delay;
pub mod dma_pool;
pub mod interrupt;
pub mod paging;
pub mod sync;

extern crate alloc;

#[cfg(feature = "std")]
pub const IS_STD: bool = true;

#[cfg(not(feature = "std"))]
pub const IS_STD: bool = false;
