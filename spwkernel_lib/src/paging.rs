//! Address translation for DMA buffers.
//!
//! Descriptor tables hold bus addresses; the driver allocates in virtual
//! space and translates before handing pointers to the device.

use crate::addr::{PhyAddr, VirtAddr};

#[cfg(not(feature = "std"))]
use crate::addr::Addr;

pub const PAGESIZE: usize = 4 * 1024;

/// Translation hooks registered by the platform.
#[cfg(not(feature = "std"))]
pub struct MapperOps {
    pub vm_to_phy: fn(VirtAddr) -> Option<PhyAddr>,
}

#[cfg(not(feature = "std"))]
static MAPPER_OPS: core::sync::atomic::AtomicPtr<MapperOps> =
    core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

#[cfg(not(feature = "std"))]
pub fn register_mapper_ops(ops: &'static MapperOps) {
    MAPPER_OPS.store(
        ops as *const MapperOps as *mut MapperOps,
        core::sync::atomic::Ordering::Release,
    );
}

/// Return the physical address of `vm_addr`.
#[cfg(not(feature = "std"))]
pub fn vm_to_phy(vm_addr: VirtAddr) -> Option<PhyAddr> {
    let ops = MAPPER_OPS.load(core::sync::atomic::Ordering::Acquire);
    if ops.is_null() {
        // Identity mapping until the platform registers a page table.
        Some(PhyAddr::new(vm_addr.as_usize()))
    } else {
        (unsafe { &*ops }.vm_to_phy)(vm_addr)
    }
}

/// Return the physical address of `vm_addr`.
///
/// Hosted builds run with an identity mapping.
#[cfg(feature = "std")]
pub fn vm_to_phy(vm_addr: VirtAddr) -> Option<PhyAddr> {
    use crate::addr::Addr;
    Some(PhyAddr::new(vm_addr.as_usize()))
}
