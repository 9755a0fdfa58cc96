//! Memory pool for DMA.
//!
//! Descriptor tables and packet buffers must live in physically
//! contiguous memory that the device can address. `DMAPool<T>` owns one
//! such allocation and exposes both its virtual and physical addresses.

use core::{alloc::Layout, ptr::NonNull};

use crate::{
    addr::{Addr, PhyAddr, VirtAddr},
    paging::{self, PAGESIZE},
};

#[cfg(not(feature = "std"))]
use crate::sync::mutex::Mutex;

#[cfg(not(feature = "std"))]
use rlsf::Tlsf;

#[cfg(not(feature = "std"))]
const FLLEN: usize = 28; // The maximum block size is (32 << 28) - 1 = 8_589_934_591 (nearly 8GiB)
#[cfg(not(feature = "std"))]
const SLLEN: usize = 64; // The worst-case internal fragmentation is ((32 << 28) / 64 - 2) = 134_217_726 (nearly 128MiB)
#[cfg(not(feature = "std"))]
type FLBitmap = u32; // must be longer than FLLEN
#[cfg(not(feature = "std"))]
type SLBitmap = u64; // must be longer than SLLEN

#[cfg(not(feature = "std"))]
type TLSFAlloc = Tlsf<'static, FLBitmap, SLBitmap, FLLEN, SLLEN>;

#[cfg(not(feature = "std"))]
static CONTINUOUS_MEMORY_POOL: Mutex<TLSFAlloc> = Mutex::new(TLSFAlloc::new());

#[derive(Debug)]
pub struct DMAPool<T> {
    virt_addr: VirtAddr,
    phy_addr: PhyAddr,
    size: usize,
    ptr: NonNull<T>,
}

unsafe impl<T: Send> Send for DMAPool<T> {}
unsafe impl<T: Sync> Sync for DMAPool<T> {}

/// Hand a region of physically contiguous memory to the pool allocator.
///
/// # Safety
///
/// `start` must be a valid address.
#[cfg(not(feature = "std"))]
pub unsafe fn init_dma_pool(start: VirtAddr, size: usize) {
    let pool = core::slice::from_raw_parts_mut(start.as_usize() as *mut u8, size);

    let Some(pool) = NonNull::new(pool) else {
        return;
    };

    let mut guard = CONTINUOUS_MEMORY_POOL.lock();
    guard.insert_free_block_ptr(pool);
}

impl<T> DMAPool<T> {
    #[cfg(not(feature = "std"))]
    pub fn new(pages: usize) -> Option<Self> {
        assert!(core::mem::size_of::<T>() <= pages * PAGESIZE);

        let size = pages * PAGESIZE;
        let layout = Layout::from_size_align(size, PAGESIZE).ok()?;

        let pool = {
            let mut allocator = CONTINUOUS_MEMORY_POOL.lock();
            allocator.allocate(layout)?
        };

        let virt_addr = VirtAddr::new(pool.as_ptr() as usize);
        let phy_addr = paging::vm_to_phy(virt_addr)?;
        let ptr = NonNull::new(pool.as_ptr() as *mut T)?;

        Some(Self {
            virt_addr,
            phy_addr,
            size,
            ptr,
        })
    }

    /// Hosted builds allocate from the process heap with an identity
    /// physical mapping.
    #[cfg(feature = "std")]
    pub fn new(pages: usize) -> Option<Self> {
        assert!(core::mem::size_of::<T>() <= pages * PAGESIZE);

        let size = pages * PAGESIZE;
        let layout = Layout::from_size_align(size, PAGESIZE).ok()?;

        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut T)?;

        let virt_addr = VirtAddr::new(raw as usize);
        let phy_addr = paging::vm_to_phy(virt_addr)?;

        Some(Self {
            virt_addr,
            phy_addr,
            size,
            ptr,
        })
    }

    #[inline(always)]
    pub fn get_virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    #[inline(always)]
    pub fn get_phy_addr(&self) -> PhyAddr {
        self.phy_addr
    }

    #[inline(always)]
    pub fn get_size(&self) -> usize {
        self.size
    }
}

impl<T> AsMut<T> for DMAPool<T> {
    fn as_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> AsRef<T> for DMAPool<T> {
    fn as_ref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for DMAPool<T> {
    #[cfg(not(feature = "std"))]
    fn drop(&mut self) {
        let ptr = self.virt_addr.as_mut_ptr::<u8>();
        let mut allocator = CONTINUOUS_MEMORY_POOL.lock();
        unsafe {
            allocator.deallocate(NonNull::new_unchecked(ptr), PAGESIZE);
        }
    }

    #[cfg(feature = "std")]
    fn drop(&mut self) {
        let ptr = self.virt_addr.as_mut_ptr::<u8>();
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, PAGESIZE);
            alloc::alloc::dealloc(ptr, layout);
        }
    }
}
