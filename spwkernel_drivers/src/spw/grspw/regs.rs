//! GRSPW2 register and descriptor layout.

use spwkernel_lib::{
    addr::{Addr, VirtAddr},
    barrier::{membar_consumer, membar_producer},
};

// Register offsets.
pub const GRSPW_CTRL: usize = 0x00;
pub const GRSPW_STATUS: usize = 0x04;
pub const GRSPW_NODEADDR: usize = 0x08;
pub const GRSPW_CLKDIV: usize = 0x0c;
pub const GRSPW_DESTKEY: usize = 0x10;
pub const GRSPW_TIME: usize = 0x14;

// One register bank per DMA channel, 0x20 bytes each.
pub const GRSPW_DMA_BASE: usize = 0x20;
pub const GRSPW_DMA_SIZE: usize = 0x20;
pub const GRSPW_DMA_CTRL: usize = 0x00;
pub const GRSPW_DMA_RXMAX: usize = 0x04;
pub const GRSPW_DMA_TXDESC: usize = 0x08;
pub const GRSPW_DMA_RXDESC: usize = 0x0c;
pub const GRSPW_DMA_ADDR: usize = 0x10;

pub const fn dma_reg(chan: usize, reg: usize) -> usize {
    GRSPW_DMA_BASE + chan * GRSPW_DMA_SIZE + reg
}

// Control register.
pub const GRSPW_CTRL_RA: u32 = 1 << 31;
pub const GRSPW_CTRL_RX: u32 = 1 << 30;
pub const GRSPW_CTRL_RC: u32 = 1 << 29;
pub const GRSPW_CTRL_NCH_BIT: u32 = 27;
pub const GRSPW_CTRL_NCH: u32 = 0x3 << GRSPW_CTRL_NCH_BIT;
pub const GRSPW_CTRL_PO: u32 = 1 << 26;
pub const GRSPW_CTRL_PS: u32 = 1 << 21;
pub const GRSPW_CTRL_RS: u32 = 1 << 6;
pub const GRSPW_CTRL_TI: u32 = 1 << 4;
pub const GRSPW_CTRL_IE: u32 = 1 << 3;
pub const GRSPW_CTRL_AS: u32 = 1 << 2;
pub const GRSPW_CTRL_LS: u32 = 1 << 1;
pub const GRSPW_CTRL_LD: u32 = 1 << 0;

// Status register. The error bits are write-one-to-clear.
pub const GRSPW_STS_LS_BIT: u32 = 21;
pub const GRSPW_STS_LS: u32 = 0x7 << GRSPW_STS_LS_BIT;
pub const GRSPW_STS_EE: u32 = 1 << 8;
pub const GRSPW_STS_IA: u32 = 1 << 7;
pub const GRSPW_STS_WE: u32 = 1 << 6;
pub const GRSPW_STS_PE: u32 = 1 << 4;
pub const GRSPW_STS_DE: u32 = 1 << 3;
pub const GRSPW_STS_ER: u32 = 1 << 2;
pub const GRSPW_STS_CE: u32 = 1 << 1;
pub const GRSPW_STS_TO: u32 = 1 << 0;

pub const GRSPW_STS_ERROR: u32 = GRSPW_STS_EE
    | GRSPW_STS_IA
    | GRSPW_STS_WE
    | GRSPW_STS_PE
    | GRSPW_STS_DE
    | GRSPW_STS_ER
    | GRSPW_STS_CE;

// DMA channel control/status register.
pub const GRSPW_DMACTRL_LE: u32 = 1 << 16;
pub const GRSPW_DMACTRL_SP: u32 = 1 << 15;
pub const GRSPW_DMACTRL_SA: u32 = 1 << 14;
pub const GRSPW_DMACTRL_EN: u32 = 1 << 13;
pub const GRSPW_DMACTRL_NS: u32 = 1 << 12;
pub const GRSPW_DMACTRL_RD: u32 = 1 << 11;
pub const GRSPW_DMACTRL_RX: u32 = 1 << 10;
pub const GRSPW_DMACTRL_AT: u32 = 1 << 9;
pub const GRSPW_DMACTRL_RA: u32 = 1 << 8;
pub const GRSPW_DMACTRL_TA: u32 = 1 << 7;
pub const GRSPW_DMACTRL_PR: u32 = 1 << 6;
pub const GRSPW_DMACTRL_PS: u32 = 1 << 5;
pub const GRSPW_DMACTRL_AI: u32 = 1 << 4;
pub const GRSPW_DMACTRL_RI: u32 = 1 << 3;
pub const GRSPW_DMACTRL_TI: u32 = 1 << 2;
pub const GRSPW_DMACTRL_RE: u32 = 1 << 1;
pub const GRSPW_DMACTRL_TE: u32 = 1 << 0;

pub const GRSPW_DMA_STATUS_ERROR: u32 = GRSPW_DMACTRL_RA | GRSPW_DMACTRL_TA;

// Write-one-to-clear bits that a read-modify-write of DMACTRL must mask
// out so an unrelated update does not acknowledge pending status.
pub const GRSPW_DMACTRL_W1C: u32 =
    GRSPW_DMACTRL_PR | GRSPW_DMACTRL_PS | GRSPW_DMACTRL_AI | GRSPW_DMA_STATUS_ERROR;

// RX descriptor control word.
pub const GRSPW_RXBD_LEN_MASK: u32 = 0x01ff_ffff;
pub const GRSPW_RXBD_EN: u32 = 1 << 25;
pub const GRSPW_RXBD_WR: u32 = 1 << 26;
pub const GRSPW_RXBD_IE: u32 = 1 << 27;
pub const GRSPW_RXBD_EP: u32 = 1 << 28;
pub const GRSPW_RXBD_HC: u32 = 1 << 29;
pub const GRSPW_RXBD_DC: u32 = 1 << 30;
pub const GRSPW_RXBD_TR: u32 = 1 << 31;

// TX descriptor control word.
pub const GRSPW_TXBD_HLEN_MASK: u32 = 0x0000_00ff;
pub const GRSPW_TXBD_NCL_BIT: u32 = 8;
pub const GRSPW_TXBD_NCL_MASK: u32 = 0xf << GRSPW_TXBD_NCL_BIT;
pub const GRSPW_TXBD_EN: u32 = 1 << 12;
pub const GRSPW_TXBD_WR: u32 = 1 << 13;
pub const GRSPW_TXBD_IE: u32 = 1 << 14;
pub const GRSPW_TXBD_LE: u32 = 1 << 15;
pub const GRSPW_TXBD_HC: u32 = 1 << 16;
pub const GRSPW_TXBD_DC: u32 = 1 << 17;

/// RX buffer descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RxBd {
    pub ctrl: u32,
    pub addr: u32,
}

/// TX buffer descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TxBd {
    pub ctrl: u32,
    pub haddr: u32,
    pub dlen: u32,
    pub daddr: u32,
}

pub const RX_RING_SIZE: usize = 128;
pub const TX_RING_SIZE: usize = 64;

/// Descriptor tables for one channel. The controller requires 0x400-byte
/// alignment for each table base.
#[repr(C, align(1024))]
pub struct BdTables {
    pub rx: [RxBd; RX_RING_SIZE],
    pub tx: [TxBd; TX_RING_SIZE],
}

/// Read a descriptor word the hardware may have written.
#[inline(always)]
pub fn bd_read(ptr: *const u32) -> u32 {
    let v = unsafe { core::ptr::read_volatile(ptr) };
    membar_consumer();
    v
}

/// Publish a descriptor word to the hardware. The barrier orders the
/// buffer address stores before the control word that enables the slot.
#[inline(always)]
pub fn bd_write(ptr: *mut u32, val: u32) {
    membar_producer();
    unsafe { core::ptr::write_volatile(ptr, val) };
}

/// Volatile accessor for one core's register block.
#[derive(Debug)]
pub struct RegAccess {
    base: VirtAddr,
}

unsafe impl Send for RegAccess {}

impl RegAccess {
    /// # Safety
    ///
    /// `base` must point to a mapped GRSPW register block.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    #[inline(always)]
    pub fn read(&self, offset: usize) -> u32 {
        let ptr = (self.base + offset).as_ptr::<u32>();
        let v = unsafe { core::ptr::read_volatile(ptr) };
        membar_consumer();
        v
    }

    #[inline(always)]
    pub fn write(&self, offset: usize, val: u32) {
        membar_producer();
        let ptr = (self.base + offset).as_mut_ptr::<u32>();
        unsafe { core::ptr::write_volatile(ptr, val) };
    }
}
