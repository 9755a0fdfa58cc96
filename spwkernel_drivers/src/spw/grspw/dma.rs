//! One GRSPW DMA channel: packet queues, rings, blocking waits.
//!
//! All queue and ring state lives behind a single per-channel lock.
//! The core register lock is only ever taken while the channel lock is
//! already held (or alone, from the interrupt handler), never the other
//! way around.

use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use core::time::Duration;

use bitflags::bitflags;
use spwkernel_lib::{
    addr::Addr,
    delay,
    dma_pool::DMAPool,
    sync::{
        mutex::Mutex,
        semaphore::{BinSemaphore, SemErr},
    },
};

use super::{
    pkt::{Packet, PktPool, PktQueue},
    regs::*,
    ring::{IrqCoalesce, RxRing, TxRing},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaErr {
    /// Operation requires a started channel.
    Stopped,
    /// Operation requires a stopped channel.
    Started,
    InvalidConfig,
    /// DMA-capable memory could not be allocated.
    DmaAlloc,
}

impl fmt::Display for DmaErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaErr::Stopped => write!(f, "channel is stopped"),
            DmaErr::Started => write!(f, "channel is started"),
            DmaErr::InvalidConfig => write!(f, "invalid configuration"),
            DmaErr::DmaAlloc => write!(f, "DMA memory allocation failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitErr {
    Timeout,
    /// The channel was stopped while waiting, or before the wait began.
    Stopped,
    /// Another thread is already waiting on this channel and direction.
    Busy,
}

impl fmt::Display for WaitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitErr::Timeout => write!(f, "wait timed out"),
            WaitErr::Stopped => write!(f, "channel is stopped"),
            WaitErr::Busy => write!(f, "another thread is already waiting"),
        }
    }
}

/// Combinator for the two wait thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOp {
    And,
    Or,
}

bitflags! {
    /// Options for `tx_send`/`rx_prepare`/`tx_reclaim`/`rx_recv`,
    /// selecting which of the implicit harvest/schedule steps to skip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferOpts: u32 {
        const NO_HARVEST = 0x1;
        const NO_SCHEDULE = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    /// Maximum RX packet length in bytes. Must be a nonzero multiple
    /// of four.
    pub rx_max_len: u32,
    /// Request an RX completion interrupt every N packets; 0 disables
    /// coalescing-driven interrupts.
    pub rx_irq_en_cnt: u32,
    /// Same for TX.
    pub tx_irq_en_cnt: u32,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            rx_max_len: 4096,
            rx_irq_en_cnt: 0,
            tx_irq_en_cnt: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    pub irq_cnt: u64,
    pub rx_work_cnt: u64,
    pub tx_work_cnt: u64,
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub rx_err_trunk: u64,
    pub rx_err_endpkt: u64,
    pub tx_err_link: u64,
}

/// Queue depths for one direction, taken atomically under the channel
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: usize,
    pub scheduled: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Copy)]
struct WaitDesc {
    waiting: bool,
    max_outstanding: usize,
    op: WaitOp,
    min_completed: usize,
}

impl WaitDesc {
    const fn idle() -> Self {
        Self {
            waiting: false,
            max_outstanding: 0,
            op: WaitOp::And,
            min_completed: 0,
        }
    }

    fn eval(&self, outstanding: usize, completed: usize) -> bool {
        let under = outstanding <= self.max_outstanding;
        let over = completed >= self.min_completed;
        match self.op {
            WaitOp::And => under && over,
            WaitOp::Or => under || over,
        }
    }
}

struct ChanInner {
    started: bool,
    cfg: DmaConfig,

    pool: PktPool,

    rx_ring: RxRing,
    tx_ring: TxRing,

    ready: PktQueue,
    rx_sched: PktQueue,
    recv: PktQueue,

    send: PktQueue,
    tx_sched: PktQueue,
    sent: PktQueue,

    rx_coal: IrqCoalesce,
    tx_coal: IrqCoalesce,

    rx_wait: WaitDesc,
    tx_wait: WaitDesc,

    /// Bumped by every stop; a waiter registered under an older value
    /// knows its registration is gone.
    stop_gen: u64,

    stats: DmaStats,

    rx_table_phy: u32,
    tx_table_phy: u32,
    _bd_mem: DMAPool<BdTables>,
}

pub struct DmaChan {
    idx: usize,
    regs: Arc<Mutex<RegAccess>>,
    inner: Mutex<ChanInner>,
    rx_sem: BinSemaphore,
    tx_sem: BinSemaphore,
}

impl DmaChan {
    pub(crate) fn new(idx: usize, regs: Arc<Mutex<RegAccess>>) -> Result<Arc<Self>, DmaErr> {
        Self::with_ring_capacity(idx, regs, RX_RING_SIZE, TX_RING_SIZE)
    }

    pub(crate) fn with_ring_capacity(
        idx: usize,
        regs: Arc<Mutex<RegAccess>>,
        rx_cap: usize,
        tx_cap: usize,
    ) -> Result<Arc<Self>, DmaErr> {
        let mut bd_mem = DMAPool::<BdTables>::new(1).ok_or(DmaErr::DmaAlloc)?;
        let phy = bd_mem.get_phy_addr().as_usize();
        let rx_table_phy = (phy + core::mem::offset_of!(BdTables, rx)) as u32;
        let tx_table_phy = (phy + core::mem::offset_of!(BdTables, tx)) as u32;

        let tables = bd_mem.as_mut();
        let rx_ring = unsafe { RxRing::new(tables.rx.as_mut_ptr(), rx_cap) };
        let tx_ring = unsafe { TxRing::new(tables.tx.as_mut_ptr(), tx_cap) };

        let cfg = DmaConfig::default();

        Ok(Arc::new(Self {
            idx,
            regs,
            inner: Mutex::new(ChanInner {
                started: false,
                cfg,
                pool: PktPool::new(),
                rx_ring,
                tx_ring,
                ready: PktQueue::new(),
                rx_sched: PktQueue::new(),
                recv: PktQueue::new(),
                send: PktQueue::new(),
                tx_sched: PktQueue::new(),
                sent: PktQueue::new(),
                rx_coal: IrqCoalesce::new(cfg.rx_irq_en_cnt),
                tx_coal: IrqCoalesce::new(cfg.tx_irq_en_cnt),
                rx_wait: WaitDesc::idle(),
                tx_wait: WaitDesc::idle(),
                stop_gen: 0,
                stats: DmaStats::default(),
                rx_table_phy,
                tx_table_phy,
                _bd_mem: bd_mem,
            }),
            rx_sem: BinSemaphore::new(),
            tx_sem: BinSemaphore::new(),
        }))
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn configure(&self, cfg: DmaConfig) -> Result<(), DmaErr> {
        if cfg.rx_max_len == 0 || cfg.rx_max_len % 4 != 0 {
            return Err(DmaErr::InvalidConfig);
        }

        let mut inner = self.inner.lock();
        if inner.started {
            return Err(DmaErr::Started);
        }
        inner.cfg = cfg;
        Ok(())
    }

    pub fn config(&self) -> DmaConfig {
        self.inner.lock().cfg
    }

    pub fn stats(&self) -> DmaStats {
        self.inner.lock().stats
    }

    pub fn clear_stats(&self) {
        self.inner.lock().stats = DmaStats::default();
    }

    /// Start the channel: reset all software state, program the
    /// descriptor table bases, and enable the channel with interrupt
    /// sources armed per the coalescing configuration. Idempotent.
    pub fn start(&self) -> Result<(), DmaErr> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.started {
            return Ok(());
        }

        inner.ready.reset(&mut inner.pool);
        inner.rx_sched.reset(&mut inner.pool);
        inner.recv.reset(&mut inner.pool);
        inner.send.reset(&mut inner.pool);
        inner.tx_sched.reset(&mut inner.pool);
        inner.sent.reset(&mut inner.pool);

        inner.rx_ring.reset();
        inner.tx_ring.reset();

        inner.rx_coal = IrqCoalesce::new(inner.cfg.rx_irq_en_cnt);
        inner.tx_coal = IrqCoalesce::new(inner.cfg.tx_irq_en_cnt);
        inner.rx_wait = WaitDesc::idle();
        inner.tx_wait = WaitDesc::idle();

        {
            let regs = self.regs.lock();

            // Acknowledge any status left from a previous run.
            regs.write(dma_reg(self.idx, GRSPW_DMA_CTRL), GRSPW_DMACTRL_W1C);

            regs.write(dma_reg(self.idx, GRSPW_DMA_RXMAX), inner.cfg.rx_max_len);
            regs.write(dma_reg(self.idx, GRSPW_DMA_TXDESC), inner.tx_table_phy);
            regs.write(dma_reg(self.idx, GRSPW_DMA_RXDESC), inner.rx_table_phy);

            let mut ctrl = GRSPW_DMACTRL_RE;
            if inner.cfg.rx_irq_en_cnt != 0 {
                ctrl |= GRSPW_DMACTRL_RI;
            }
            if inner.cfg.tx_irq_en_cnt != 0 {
                ctrl |= GRSPW_DMACTRL_TI;
            }
            regs.write(dma_reg(self.idx, GRSPW_DMA_CTRL), ctrl);
        }

        inner.started = true;
        Ok(())
    }

    /// Stop the channel. Hardware DMA is disabled, a final harvest runs,
    /// and every packet still scheduled or pending is moved to its
    /// completion queue so the client can reclaim all of them. A blocked
    /// waiter is woken with `WaitErr::Stopped`. Idempotent.
    pub fn stop(&self) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.started {
                return;
            }
            inner.started = false;

            {
                let regs = self.regs.lock();
                let r = dma_reg(self.idx, GRSPW_DMA_CTRL);
                let keep = regs.read(r)
                    & (GRSPW_DMACTRL_LE
                        | GRSPW_DMACTRL_EN
                        | GRSPW_DMACTRL_SP
                        | GRSPW_DMACTRL_SA
                        | GRSPW_DMACTRL_NS);
                regs.write(r, keep | GRSPW_DMACTRL_AT);
            }

            // Pick up anything hardware finished before the stop.
            inner
                .tx_ring
                .harvest(&mut inner.pool, &mut inner.tx_sched, &mut inner.sent, &mut inner.stats);
            inner
                .rx_ring
                .harvest(&mut inner.pool, &mut inner.rx_sched, &mut inner.recv, &mut inner.stats);

            // Everything else surfaces on the completion queues without
            // a done marker; the client reads the outcome per packet.
            let mut tx_sched = core::mem::take(&mut inner.tx_sched);
            inner.sent.append(&mut inner.pool, &mut tx_sched);
            let mut send = core::mem::take(&mut inner.send);
            inner.sent.append(&mut inner.pool, &mut send);

            let mut rx_sched = core::mem::take(&mut inner.rx_sched);
            inner.recv.append(&mut inner.pool, &mut rx_sched);
            let mut ready = core::mem::take(&mut inner.ready);
            inner.recv.append(&mut inner.pool, &mut ready);

            inner.rx_ring.reset();
            inner.tx_ring.reset();

            inner.rx_wait.waiting = false;
            inner.tx_wait.waiting = false;
            inner.stop_gen = inner.stop_gen.wrapping_add(1);
        }

        self.rx_sem.flush();
        self.tx_sem.flush();
    }

    /// Queue packets for transmission. Unless skipped, completed
    /// descriptors are harvested first and free slots are filled from
    /// the send queue afterwards.
    pub fn tx_send(
        &self,
        opts: XferOpts,
        pkts: impl IntoIterator<Item = Packet>,
    ) -> Result<(), DmaErr> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.started {
            return Err(DmaErr::Stopped);
        }

        if !opts.contains(XferOpts::NO_HARVEST) {
            inner
                .tx_ring
                .harvest(&mut inner.pool, &mut inner.tx_sched, &mut inner.sent, &mut inner.stats);
        }

        for pkt in pkts {
            let id = inner.pool.alloc(pkt);
            inner.send.push_back(&mut inner.pool, id);
        }

        if !opts.contains(XferOpts::NO_SCHEDULE) {
            let n = inner.tx_ring.schedule(
                &mut inner.pool,
                &mut inner.send,
                &mut inner.tx_sched,
                &mut inner.tx_coal,
            );
            if n > 0 {
                self.kick_tx();
            }
        }

        Ok(())
    }

    /// Take up to `max` transmitted packets off the sent queue, oldest
    /// first. Works on a stopped channel, where it only drains.
    pub fn tx_reclaim(&self, opts: XferOpts, max: Option<usize>) -> Vec<Packet> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.started && !opts.contains(XferOpts::NO_HARVEST) {
            inner
                .tx_ring
                .harvest(&mut inner.pool, &mut inner.tx_sched, &mut inner.sent, &mut inner.stats);
        }

        let limit = max.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(id) = inner.sent.pop_front(&mut inner.pool) else {
                break;
            };
            out.push(inner.pool.free(id));
        }

        if inner.started && !opts.contains(XferOpts::NO_SCHEDULE) {
            let n = inner.tx_ring.schedule(
                &mut inner.pool,
                &mut inner.send,
                &mut inner.tx_sched,
                &mut inner.tx_coal,
            );
            if n > 0 {
                self.kick_tx();
            }
        }

        out
    }

    /// Hand receive buffers to the channel. Unless skipped, completed
    /// descriptors are harvested first and free slots are filled from
    /// the ready queue afterwards.
    pub fn rx_prepare(
        &self,
        opts: XferOpts,
        pkts: impl IntoIterator<Item = Packet>,
    ) -> Result<(), DmaErr> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.started {
            return Err(DmaErr::Stopped);
        }

        if !opts.contains(XferOpts::NO_HARVEST) {
            inner
                .rx_ring
                .harvest(&mut inner.pool, &mut inner.rx_sched, &mut inner.recv, &mut inner.stats);
        }

        for pkt in pkts {
            let id = inner.pool.alloc(pkt);
            inner.ready.push_back(&mut inner.pool, id);
        }

        if !opts.contains(XferOpts::NO_SCHEDULE) {
            let n = inner.rx_ring.schedule(
                &mut inner.pool,
                &mut inner.ready,
                &mut inner.rx_sched,
                &mut inner.rx_coal,
            );
            if n > 0 {
                self.kick_rx();
            }
        }

        Ok(())
    }

    /// Take up to `max` received packets off the recv queue, oldest
    /// first. Works on a stopped channel, where it only drains.
    pub fn rx_recv(&self, opts: XferOpts, max: Option<usize>) -> Vec<Packet> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.started && !opts.contains(XferOpts::NO_HARVEST) {
            inner
                .rx_ring
                .harvest(&mut inner.pool, &mut inner.rx_sched, &mut inner.recv, &mut inner.stats);
        }

        let limit = max.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(id) = inner.recv.pop_front(&mut inner.pool) else {
                break;
            };
            out.push(inner.pool.free(id));
        }

        if inner.started && !opts.contains(XferOpts::NO_SCHEDULE) {
            let n = inner.rx_ring.schedule(
                &mut inner.pool,
                &mut inner.ready,
                &mut inner.rx_sched,
                &mut inner.rx_coal,
            );
            if n > 0 {
                self.kick_rx();
            }
        }

        out
    }

    pub fn tx_count(&self) -> QueueDepths {
        let inner = self.inner.lock();
        QueueDepths {
            pending: inner.send.count(),
            scheduled: inner.tx_sched.count(),
            completed: inner.sent.count(),
        }
    }

    pub fn rx_count(&self) -> QueueDepths {
        let inner = self.inner.lock();
        QueueDepths {
            pending: inner.ready.count(),
            scheduled: inner.rx_sched.count(),
            completed: inner.recv.count(),
        }
    }

    /// Block until `(send + scheduled <= max_outstanding) op
    /// (sent >= min_completed)`, a timeout, or a stop. At most one
    /// thread may wait per direction; a second gets `WaitErr::Busy`.
    pub fn tx_wait(
        &self,
        max_outstanding: usize,
        op: WaitOp,
        min_completed: usize,
        timeout: Option<Duration>,
    ) -> Result<(), WaitErr> {
        let deadline = timeout.map(|t| delay::uptime() + t.as_micros() as u64);

        let gen = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if !inner.started {
                return Err(WaitErr::Stopped);
            }
            if inner.tx_wait.waiting {
                return Err(WaitErr::Busy);
            }
            inner.tx_wait = WaitDesc {
                waiting: true,
                max_outstanding,
                op,
                min_completed,
            };

            let outstanding = inner.send.count() + inner.tx_sched.count();
            if inner.tx_wait.eval(outstanding, inner.sent.count()) {
                inner.tx_wait.waiting = false;
                return Ok(());
            }

            self.force_irq(GRSPW_DMACTRL_TI);
            inner.stop_gen
        };

        loop {
            match self.tx_sem.take(remaining(deadline)) {
                // A flush under an unchanged generation is stale; the
                // condition check below decides whether to keep waiting.
                Ok(()) | Err(SemErr::Flushed) => (),
                Err(SemErr::Timeout) => {
                    let mut inner = self.inner.lock();
                    if inner.stop_gen != gen {
                        return Err(WaitErr::Stopped);
                    }
                    inner.tx_wait.waiting = false;
                    return Err(WaitErr::Timeout);
                }
            }

            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            // A stop unregistered this wait; the channel may even have
            // restarted since, so the started flag alone proves nothing.
            if inner.stop_gen != gen {
                return Err(WaitErr::Stopped);
            }

            let outstanding = inner.send.count() + inner.tx_sched.count();
            if inner.tx_wait.eval(outstanding, inner.sent.count()) {
                inner.tx_wait.waiting = false;
                return Ok(());
            }

            self.force_irq(GRSPW_DMACTRL_TI);
        }
    }

    /// RX counterpart of [`tx_wait`](Self::tx_wait): blocks until
    /// `(ready + scheduled <= max_outstanding) op (recv >= min_completed)`.
    pub fn rx_wait(
        &self,
        max_outstanding: usize,
        op: WaitOp,
        min_completed: usize,
        timeout: Option<Duration>,
    ) -> Result<(), WaitErr> {
        let deadline = timeout.map(|t| delay::uptime() + t.as_micros() as u64);

        let gen = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if !inner.started {
                return Err(WaitErr::Stopped);
            }
            if inner.rx_wait.waiting {
                return Err(WaitErr::Busy);
            }
            inner.rx_wait = WaitDesc {
                waiting: true,
                max_outstanding,
                op,
                min_completed,
            };

            let outstanding = inner.ready.count() + inner.rx_sched.count();
            if inner.rx_wait.eval(outstanding, inner.recv.count()) {
                inner.rx_wait.waiting = false;
                return Ok(());
            }

            self.force_irq(GRSPW_DMACTRL_RI);
            inner.stop_gen
        };

        loop {
            match self.rx_sem.take(remaining(deadline)) {
                // A flush under an unchanged generation is stale; the
                // condition check below decides whether to keep waiting.
                Ok(()) | Err(SemErr::Flushed) => (),
                Err(SemErr::Timeout) => {
                    let mut inner = self.inner.lock();
                    if inner.stop_gen != gen {
                        return Err(WaitErr::Stopped);
                    }
                    inner.rx_wait.waiting = false;
                    return Err(WaitErr::Timeout);
                }
            }

            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            // A stop unregistered this wait; the channel may even have
            // restarted since, so the started flag alone proves nothing.
            if inner.stop_gen != gen {
                return Err(WaitErr::Stopped);
            }

            let outstanding = inner.ready.count() + inner.rx_sched.count();
            if inner.rx_wait.eval(outstanding, inner.recv.count()) {
                inner.rx_wait.waiting = false;
                return Ok(());
            }

            self.force_irq(GRSPW_DMACTRL_RI);
        }
    }

    /// Deferred interrupt work for this channel, called from the worker.
    /// A DMA error stops the whole channel; otherwise the signaled
    /// directions are harvested, refilled, and any satisfied waiter is
    /// released.
    pub fn dma_work(&self, rx: bool, tx: bool, err: bool) {
        if err {
            log::warn!("grspw dma{}: DMA error, stopping channel", self.idx);
            self.stop();
            return;
        }

        let mut rx_wake = false;
        let mut tx_wake = false;

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.started {
                return;
            }

            inner.stats.irq_cnt += 1;

            // Re-arm the interrupt sources the ISR masked off.
            {
                let regs = self.regs.lock();
                let r = dma_reg(self.idx, GRSPW_DMA_CTRL);
                let mut ctrl =
                    regs.read(r) & !(GRSPW_DMACTRL_W1C | GRSPW_DMACTRL_RI | GRSPW_DMACTRL_TI);
                if inner.cfg.rx_irq_en_cnt != 0 || inner.rx_wait.waiting {
                    ctrl |= GRSPW_DMACTRL_RI;
                }
                if inner.cfg.tx_irq_en_cnt != 0 || inner.tx_wait.waiting {
                    ctrl |= GRSPW_DMACTRL_TI;
                }
                regs.write(r, ctrl);
            }

            if tx {
                inner.stats.tx_work_cnt += 1;
                inner.tx_ring.harvest(
                    &mut inner.pool,
                    &mut inner.tx_sched,
                    &mut inner.sent,
                    &mut inner.stats,
                );
                let n = inner.tx_ring.schedule(
                    &mut inner.pool,
                    &mut inner.send,
                    &mut inner.tx_sched,
                    &mut inner.tx_coal,
                );
                if n > 0 {
                    self.kick_tx();
                }

                if inner.tx_wait.waiting {
                    let outstanding = inner.send.count() + inner.tx_sched.count();
                    tx_wake = inner.tx_wait.eval(outstanding, inner.sent.count());
                }
            }

            if rx {
                inner.stats.rx_work_cnt += 1;
                inner.rx_ring.harvest(
                    &mut inner.pool,
                    &mut inner.rx_sched,
                    &mut inner.recv,
                    &mut inner.stats,
                );
                let n = inner.rx_ring.schedule(
                    &mut inner.pool,
                    &mut inner.ready,
                    &mut inner.rx_sched,
                    &mut inner.rx_coal,
                );
                if n > 0 {
                    self.kick_rx();
                }

                if inner.rx_wait.waiting {
                    let outstanding = inner.ready.count() + inner.rx_sched.count();
                    rx_wake = inner.rx_wait.eval(outstanding, inner.recv.count());
                }
            }
        }

        if rx_wake {
            self.rx_sem.give();
        }
        if tx_wake {
            self.tx_sem.give();
        }
    }

    /// Tell the transmitter new descriptors are enabled.
    fn kick_tx(&self) {
        let regs = self.regs.lock();
        let r = dma_reg(self.idx, GRSPW_DMA_CTRL);
        let ctrl = regs.read(r) & !GRSPW_DMACTRL_W1C;
        regs.write(r, ctrl | GRSPW_DMACTRL_TE);
    }

    /// Tell the receiver new descriptors are enabled.
    fn kick_rx(&self) {
        let regs = self.regs.lock();
        let r = dma_reg(self.idx, GRSPW_DMA_CTRL);
        let ctrl = regs.read(r) & !GRSPW_DMACTRL_W1C;
        regs.write(r, ctrl | GRSPW_DMACTRL_RE | GRSPW_DMACTRL_RD);
    }

    /// Keep an interrupt source enabled while a waiter depends on it.
    fn force_irq(&self, irq_bit: u32) {
        let regs = self.regs.lock();
        let r = dma_reg(self.idx, GRSPW_DMA_CTRL);
        let ctrl = regs.read(r) & !GRSPW_DMACTRL_W1C;
        regs.write(r, ctrl | irq_bit);
    }
}

fn remaining(deadline: Option<u64>) -> Option<Duration> {
    deadline.map(|d| {
        let now = delay::uptime();
        Duration::from_micros(d.saturating_sub(now))
    })
}

#[cfg(test)]
mod tests {
    use super::super::pkt::PktFlags;
    use super::*;
    use spwkernel_lib::addr::VirtAddr;

    fn fake_regs() -> (Arc<Mutex<RegAccess>>, DMAPool<[u32; 64]>) {
        let regs_mem = DMAPool::<[u32; 64]>::new(1).unwrap();
        let access = unsafe { RegAccess::new(regs_mem.get_virt_addr()) };
        (Arc::new(Mutex::new(access)), regs_mem)
    }

    fn chan4() -> (Arc<DmaChan>, DMAPool<[u32; 64]>) {
        let (regs, regs_mem) = fake_regs();
        let chan = DmaChan::with_ring_capacity(0, regs, 4, 4).unwrap();
        (chan, regs_mem)
    }

    fn pkt(n: usize) -> Packet {
        Packet::new(VirtAddr::new(0x1000 * (n + 1)), 64)
    }

    fn submit_tx(chan: &DmaChan, n: usize) {
        chan.tx_send(XferOpts::empty(), (0..n).map(pkt)).unwrap();
    }

    fn complete_tx(chan: &DmaChan, n: usize) {
        chan.inner.lock().tx_ring.hw_complete(n);
    }

    fn complete_rx(chan: &DmaChan, n: usize, len: u32) {
        chan.inner.lock().rx_ring.hw_complete(n, len);
    }

    #[test]
    fn submit_requires_started_channel() {
        let (chan, _regs) = chan4();
        assert_eq!(
            chan.tx_send(XferOpts::empty(), [pkt(0)]),
            Err(DmaErr::Stopped)
        );
        assert_eq!(
            chan.rx_prepare(XferOpts::empty(), [pkt(0)]),
            Err(DmaErr::Stopped)
        );
    }

    #[test]
    fn start_is_idempotent() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        chan.start().unwrap();
        assert!(chan.is_started());
        chan.stop();
        chan.stop();
        assert!(!chan.is_started());
    }

    #[test]
    fn configure_rejected_while_started() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        assert_eq!(chan.configure(DmaConfig::default()), Err(DmaErr::Started));
        chan.stop();
        chan.configure(DmaConfig {
            rx_max_len: 2048,
            rx_irq_en_cnt: 4,
            tx_irq_en_cnt: 2,
        })
        .unwrap();
        assert_eq!(chan.config().rx_max_len, 2048);
    }

    #[test]
    fn configure_validates_rx_max_len() {
        let (chan, _regs) = chan4();
        let bad = DmaConfig {
            rx_max_len: 6,
            ..Default::default()
        };
        assert_eq!(chan.configure(bad), Err(DmaErr::InvalidConfig));
    }

    #[test]
    fn queue_conservation_across_operations() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        let held = |chan: &DmaChan| {
            let c = chan.tx_count();
            c.pending + c.scheduled + c.completed
        };

        submit_tx(&chan, 6);
        assert_eq!(held(&chan), 6);

        complete_tx(&chan, 2);
        chan.dma_work(false, true, false);
        assert_eq!(held(&chan), 6);

        let got = chan.tx_reclaim(XferOpts::empty(), Some(3));
        assert_eq!(got.len(), 3);
        assert_eq!(held(&chan), 3);

        chan.stop();
        assert_eq!(held(&chan), 3);

        let rest = chan.tx_reclaim(XferOpts::empty(), None);
        assert_eq!(rest.len(), 3);
        assert_eq!(held(&chan), 0);
    }

    #[test]
    fn fifo_preserved_through_ring() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        submit_tx(&chan, 6);
        complete_tx(&chan, 4);
        chan.dma_work(false, true, false);
        complete_tx(&chan, 2);
        chan.dma_work(false, true, false);

        let got = chan.tx_reclaim(XferOpts::empty(), None);
        let addrs: Vec<usize> = got.iter().map(|p| p.data.as_usize()).collect();
        let expect: Vec<usize> = (0..6).map(|n| 0x1000 * (n + 1)).collect();
        assert_eq!(addrs, expect);
        assert!(got.iter().all(|p| p.flags.contains(PktFlags::TX_DONE)));
    }

    #[test]
    fn scheduling_is_bounded_by_ring_capacity() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        submit_tx(&chan, 10);
        let c = chan.tx_count();
        assert_eq!(c.scheduled, 4);
        assert_eq!(c.pending, 6);
    }

    #[test]
    fn stop_drains_everything() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        // 4 scheduled, 2 pending; hardware completes 2 before the stop.
        submit_tx(&chan, 6);
        complete_tx(&chan, 2);

        chan.stop();

        let got = chan.tx_reclaim(XferOpts::empty(), None);
        assert_eq!(got.len(), 6);

        let done: Vec<bool> = got
            .iter()
            .map(|p| p.flags.contains(PktFlags::TX_DONE))
            .collect();
        assert_eq!(done, [true, true, false, false, false, false]);
    }

    #[test]
    fn end_to_end_capacity_four() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        submit_tx(&chan, 6);
        let c = chan.tx_count();
        assert_eq!((c.pending, c.scheduled, c.completed), (2, 4, 0));

        complete_tx(&chan, 2);
        chan.dma_work(false, true, false);

        // Two sent, and the two pending packets moved into the freed
        // slots.
        let c = chan.tx_count();
        assert_eq!((c.pending, c.scheduled, c.completed), (0, 4, 2));

        let got = chan.tx_reclaim(XferOpts::empty(), Some(2));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.as_usize(), 0x1000);
        assert_eq!(got[1].data.as_usize(), 0x2000);
        assert!(got.iter().all(|p| p.flags.contains(PktFlags::TX_DONE)));
    }

    #[test]
    fn rx_roundtrip_records_length() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        chan.rx_prepare(XferOpts::empty(), (0..3).map(pkt)).unwrap();
        let c = chan.rx_count();
        assert_eq!((c.pending, c.scheduled), (0, 3));

        complete_rx(&chan, 2, 42);
        chan.dma_work(true, false, false);

        let got = chan.rx_recv(XferOpts::empty(), None);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|p| p.flags.contains(PktFlags::RX_DONE)));
        assert!(got.iter().all(|p| p.dlen == 42));
    }

    #[test]
    fn skip_options_are_honored() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        chan.tx_send(XferOpts::NO_SCHEDULE, (0..2).map(pkt)).unwrap();
        let c = chan.tx_count();
        assert_eq!((c.pending, c.scheduled), (2, 0));

        // An empty send with scheduling allowed drives the queue into
        // the ring.
        chan.tx_send(XferOpts::empty(), []).unwrap();
        let c = chan.tx_count();
        assert_eq!((c.pending, c.scheduled), (0, 2));

        complete_tx(&chan, 2);
        let got = chan.tx_reclaim(XferOpts::NO_HARVEST, None);
        assert!(got.is_empty());
        let got = chan.tx_reclaim(XferOpts::empty(), None);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn wait_or_returns_immediately_when_satisfied() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        submit_tx(&chan, 2);
        // Outstanding (2) is within the bound, OR makes that enough.
        chan.tx_wait(10, WaitOp::Or, 100, Some(Duration::from_millis(50)))
            .unwrap();
    }

    #[test]
    fn wait_and_blocks_until_both_hold() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        submit_tx(&chan, 2);

        let chan2 = chan.clone();
        let waiter = std::thread::spawn(move || {
            chan2.tx_wait(0, WaitOp::And, 2, Some(Duration::from_secs(5)))
        });

        std::thread::sleep(Duration::from_millis(50));
        complete_tx(&chan, 2);
        chan.dma_work(false, true, false);

        assert_eq!(waiter.join().unwrap(), Ok(()));
        let c = chan.tx_count();
        assert_eq!((c.pending + c.scheduled, c.completed), (0, 2));
    }

    #[test]
    fn wait_times_out() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        submit_tx(&chan, 1);

        let res = chan.tx_wait(0, WaitOp::And, 1, Some(Duration::from_millis(30)));
        assert_eq!(res, Err(WaitErr::Timeout));

        // The wait slot is free again afterwards.
        let res = chan.tx_wait(10, WaitOp::Or, 0, Some(Duration::from_millis(30)));
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn second_waiter_is_rejected() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        submit_tx(&chan, 1);

        let chan2 = chan.clone();
        let waiter = std::thread::spawn(move || {
            chan2.tx_wait(0, WaitOp::And, 100, Some(Duration::from_secs(5)))
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            chan.tx_wait(0, WaitOp::And, 100, Some(Duration::from_millis(10))),
            Err(WaitErr::Busy)
        );

        chan.stop();
        assert_eq!(waiter.join().unwrap(), Err(WaitErr::Stopped));
    }

    #[test]
    fn restart_does_not_satisfy_interrupted_waiter() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        submit_tx(&chan, 1);

        let chan2 = chan.clone();
        let waiter = std::thread::spawn(move || {
            chan2.tx_wait(0, WaitOp::And, 5, Some(Duration::from_secs(5)))
        });

        // Stop then immediately restart. The restart clears all queues,
        // which must not read as "condition met" to the old waiter.
        std::thread::sleep(Duration::from_millis(50));
        chan.stop();
        chan.start().unwrap();

        assert_eq!(waiter.join().unwrap(), Err(WaitErr::Stopped));

        // The restarted channel accepts a fresh waiter.
        assert_eq!(chan.tx_wait(10, WaitOp::Or, 0, None), Ok(()));
    }

    #[test]
    fn stop_flushes_rx_waiter() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        let chan2 = chan.clone();
        let waiter = std::thread::spawn(move || {
            chan2.rx_wait(0, WaitOp::And, 1, Some(Duration::from_secs(5)))
        });

        std::thread::sleep(Duration::from_millis(50));
        chan.stop();

        assert_eq!(waiter.join().unwrap(), Err(WaitErr::Stopped));
    }

    #[test]
    fn wait_on_stopped_channel_fails_fast() {
        let (chan, _regs) = chan4();
        assert_eq!(
            chan.tx_wait(0, WaitOp::Or, 0, None),
            Err(WaitErr::Stopped)
        );
    }

    #[test]
    fn dma_error_work_stops_channel() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();
        submit_tx(&chan, 3);

        chan.dma_work(false, false, true);

        assert!(!chan.is_started());
        let got = chan.tx_reclaim(XferOpts::empty(), None);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|p| !p.flags.contains(PktFlags::TX_DONE)));
    }

    #[test]
    fn stats_count_packets() {
        let (chan, _regs) = chan4();
        chan.start().unwrap();

        submit_tx(&chan, 2);
        complete_tx(&chan, 2);
        chan.dma_work(false, true, false);

        let stats = chan.stats();
        assert_eq!(stats.tx_pkts, 2);
        assert_eq!(stats.tx_work_cnt, 1);

        chan.clear_stats();
        assert_eq!(chan.stats(), DmaStats::default());
    }
}
