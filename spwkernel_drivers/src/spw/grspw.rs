//! GRSPW2 SpaceWire core device.
//!
//! One `Grspw` owns the shared control/status registers, up to four
//! DMA channels, and the interrupt entry point. The ISR never touches
//! queues; it acknowledges status, masks the channel interrupt
//! sources, and posts one compact message to the worker.

pub mod dma;
pub mod pkt;
pub mod regs;
pub mod ring;
pub mod work;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use spwkernel_lib::{addr::VirtAddr, sync::mutex::Mutex};

use self::dma::{DmaChan, DmaErr};
use self::regs::*;
use self::work::{WorkMsg, WorkQueue};

pub const MAX_DMA_CHANS: usize = 4;

bitflags! {
    /// Link error events that bring the link down when they occur.
    /// Values match the status register error bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkOpts: u32 {
        const DIS_ON_CE = GRSPW_STS_CE;
        const DIS_ON_ER = GRSPW_STS_ER;
        const DIS_ON_DE = GRSPW_STS_DE;
        const DIS_ON_PE = GRSPW_STS_PE;
        const DIS_ON_WE = GRSPW_STS_WE;
        const DIS_ON_EE = GRSPW_STS_EE;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    ErrorReset = 0,
    ErrorWait = 1,
    Ready = 2,
    Started = 3,
    Connecting = 4,
    Run = 5,
}

impl LinkState {
    fn from_sts(sts: u32) -> Self {
        match (sts & GRSPW_STS_LS) >> GRSPW_STS_LS_BIT {
            0 => LinkState::ErrorReset,
            1 => LinkState::ErrorWait,
            2 => LinkState::Ready,
            3 => LinkState::Started,
            4 => LinkState::Connecting,
            _ => LinkState::Run,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoreStats {
    pub irq_cnt: u64,
    pub err_credit: u64,
    pub err_escape: u64,
    pub err_disconnect: u64,
    pub err_parity: u64,
    pub err_wsync: u64,
    pub err_addr: u64,
    pub err_eeop: u64,
}

struct CoreState {
    link_opts: LinkOpts,
    stats: CoreStats,
}

pub struct Grspw {
    index: AtomicUsize,
    nchans: usize,
    regs: Arc<Mutex<RegAccess>>,
    chans: Vec<Arc<DmaChan>>,
    core: Mutex<CoreState>,
    work_q: Arc<WorkQueue>,
}

impl Grspw {
    /// Bring up a core at `base` with `nchans` DMA channels. The ISR
    /// posts work messages to `work_q`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped GRSPW register block.
    pub unsafe fn new(
        base: VirtAddr,
        nchans: usize,
        work_q: Arc<WorkQueue>,
    ) -> Result<Arc<Self>, DmaErr> {
        assert!(nchans >= 1 && nchans <= MAX_DMA_CHANS);

        let regs = Arc::new(Mutex::new(RegAccess::new(base)));

        let mut chans = Vec::with_capacity(nchans);
        for i in 0..nchans {
            chans.push(DmaChan::new(i, regs.clone())?);
        }

        let dev = Arc::new(Self {
            index: AtomicUsize::new(usize::MAX),
            nchans,
            regs,
            chans,
            core: Mutex::new(CoreState {
                link_opts: LinkOpts::empty(),
                stats: CoreStats::default(),
            }),
            work_q,
        });

        dev.hw_reset();
        Ok(dev)
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    /// Registry index; work messages carry it.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn num_channels(&self) -> usize {
        self.nchans
    }

    pub fn dma(&self, chan: usize) -> &Arc<DmaChan> {
        &self.chans[chan]
    }

    /// Soft reset the core and start the link with the global
    /// interrupt enable set.
    fn hw_reset(&self) {
        let regs = self.regs.lock();
        regs.write(GRSPW_CTRL, GRSPW_CTRL_RS);

        let sts = regs.read(GRSPW_STATUS);
        regs.write(GRSPW_STATUS, sts);

        regs.write(GRSPW_CTRL, GRSPW_CTRL_LS | GRSPW_CTRL_IE);
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_sts(self.regs.lock().read(GRSPW_STATUS))
    }

    /// Select which link errors bring the link down.
    pub fn link_ctrl(&self, opts: LinkOpts) {
        self.core.lock().link_opts = opts;
    }

    /// Restart the link after an error shutdown.
    pub fn link_start(&self) {
        let regs = self.regs.lock();
        let ctrl = regs.read(GRSPW_CTRL) & !GRSPW_CTRL_LD;
        regs.write(GRSPW_CTRL, ctrl | GRSPW_CTRL_LS | GRSPW_CTRL_IE);
    }

    pub fn link_disable(&self) {
        let regs = self.regs.lock();
        let ctrl = regs.read(GRSPW_CTRL) & !(GRSPW_CTRL_LS | GRSPW_CTRL_IE);
        regs.write(GRSPW_CTRL, ctrl | GRSPW_CTRL_LD);
    }

    pub fn core_stats(&self) -> CoreStats {
        self.core.lock().stats
    }

    pub fn clear_core_stats(&self) {
        self.core.lock().stats = CoreStats::default();
    }

    /// Stop every channel, then take the hardware down. Invoked by the
    /// worker for a shutdown message.
    pub fn shutdown(&self) {
        for chan in &self.chans {
            chan.stop();
        }
        self.link_disable();
    }

    /// Interrupt service routine. Records link errors, acknowledges
    /// per-channel status, masks the channel interrupt sources, and
    /// posts one work message. Never blocks.
    pub fn interrupt(&self) {
        let mut msg = WorkMsg::new(self.index());
        let mut handled = false;

        {
            let mut core = self.core.lock();
            let regs = self.regs.lock();

            let stat = regs.read(GRSPW_STATUS);
            let errs = stat & GRSPW_STS_ERROR;
            if errs != 0 {
                handled = true;

                if errs & GRSPW_STS_CE != 0 {
                    core.stats.err_credit += 1;
                }
                if errs & GRSPW_STS_ER != 0 {
                    core.stats.err_escape += 1;
                }
                if errs & GRSPW_STS_DE != 0 {
                    core.stats.err_disconnect += 1;
                }
                if errs & GRSPW_STS_PE != 0 {
                    core.stats.err_parity += 1;
                }
                if errs & GRSPW_STS_WE != 0 {
                    core.stats.err_wsync += 1;
                }
                if errs & GRSPW_STS_IA != 0 {
                    core.stats.err_addr += 1;
                }
                if errs & GRSPW_STS_EE != 0 {
                    core.stats.err_eeop += 1;
                }

                if errs & core.link_opts.bits() != 0
                    && regs.read(GRSPW_CTRL) & GRSPW_CTRL_IE != 0
                {
                    // Take the link down and stay silent until a client
                    // restarts it explicitly.
                    let ctrl = regs.read(GRSPW_CTRL);
                    regs.write(
                        GRSPW_CTRL,
                        GRSPW_CTRL_LD | (ctrl & !(GRSPW_CTRL_IE | GRSPW_CTRL_LS)),
                    );
                    msg.set_shutdown();
                }

                regs.write(GRSPW_STATUS, errs);
            }

            for i in 0..self.nchans {
                let r = dma_reg(i, GRSPW_DMA_CTRL);
                let dma_stat = regs.read(r);

                // PR/PS count only while the matching enable is on.
                let irqs = (((dma_stat << 3) & (GRSPW_DMACTRL_PR | GRSPW_DMACTRL_PS))
                    | GRSPW_DMA_STATUS_ERROR)
                    & dma_stat;
                if irqs == 0 {
                    continue;
                }
                handled = true;

                // Writing the observed value back acknowledges the
                // status bits; dropping RI/TI masks the channel until
                // the worker re-arms it.
                regs.write(r, dma_stat & !(GRSPW_DMACTRL_RI | GRSPW_DMACTRL_TI));

                if irqs & GRSPW_DMA_STATUS_ERROR != 0 {
                    msg.set_err(i);
                } else {
                    if irqs & GRSPW_DMACTRL_PR != 0 {
                        msg.set_rx(i);
                    }
                    if irqs & GRSPW_DMACTRL_PS != 0 {
                        msg.set_tx(i);
                    }
                }
            }

            if handled {
                core.stats.irq_cnt += 1;
            }
        }

        if msg.has_work() && self.work_q.try_send(msg).is_err() {
            // Status already acknowledged; the condition that raised it
            // persists at the controller and re-raises the interrupt,
            // so the work is delayed rather than lost.
            log::warn!(
                "grspw{}: work queue full, dropping message 0x{:x}",
                self.index(),
                msg.raw()
            );
        }
    }
}
