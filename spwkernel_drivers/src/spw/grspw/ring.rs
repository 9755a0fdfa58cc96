//! Descriptor ring scheduling and harvesting.
//!
//! Each ring pairs the hardware descriptor table with a software ring
//! that remembers which packet sits in which slot. The descriptor
//! enable bit is the ownership handshake: software fills a free slot
//! and sets the bit, hardware clears it on completion.

use alloc::vec;
use alloc::vec::Vec;

use spwkernel_lib::{addr::Addr, paging};

use super::{
    dma::DmaStats,
    pkt::{PktFlags, PktPool, PktQueue},
    regs::*,
};

/// Interrupt-coalescing countdown. One step per scheduled packet; a hit
/// requests a completion interrupt on that descriptor and reloads.
#[derive(Debug)]
pub struct IrqCoalesce {
    curr: i32,
    reload: i32,
}

impl IrqCoalesce {
    /// Reload used when IRQ generation is disabled; large enough to
    /// never reach zero in practice.
    pub const DISABLED_RELOAD: i32 = 0x3fff_ffff;

    pub fn new(cfg_cnt: u32) -> Self {
        let reload = if cfg_cnt == 0 {
            Self::DISABLED_RELOAD
        } else {
            cfg_cnt as i32
        };

        Self {
            curr: reload,
            reload,
        }
    }

    pub fn step(&mut self) -> bool {
        self.curr -= 1;
        if self.curr <= 0 {
            self.curr = self.reload;
            true
        } else {
            false
        }
    }
}

fn dma_addr(pkt_addr: spwkernel_lib::addr::VirtAddr) -> u32 {
    match paging::vm_to_phy(pkt_addr) {
        Some(phy) => phy.as_usize() as u32,
        None => pkt_addr.as_usize() as u32,
    }
}

pub struct RxRing {
    bds: *mut RxBd,
    cap: usize,
    head: usize,
    tail: usize,
    slots: Vec<Option<super::pkt::PktId>>,
}

unsafe impl Send for RxRing {}

impl RxRing {
    /// # Safety
    ///
    /// `bds` must point to at least `cap` descriptors in DMA-visible
    /// memory, valid for the lifetime of the ring.
    pub unsafe fn new(bds: *mut RxBd, cap: usize) -> Self {
        assert!(cap >= 2 && cap <= RX_RING_SIZE);

        Self {
            bds,
            cap,
            head: 0,
            tail: 0,
            slots: vec![None; cap],
        }
    }

    fn bd(&self, i: usize) -> *mut RxBd {
        unsafe { self.bds.add(i) }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Attach ready packets to free slots and enable them for the
    /// receiver. Stops at the first occupied slot. Returns the number
    /// scheduled; the caller kicks the RE/RD bits when it is nonzero.
    pub fn schedule(
        &mut self,
        pool: &mut PktPool,
        ready: &mut PktQueue,
        sched: &mut PktQueue,
        coal: &mut IrqCoalesce,
    ) -> usize {
        let mut scheduled = PktQueue::new();
        let mut cnt = 0;

        while !ready.is_empty() {
            if self.slots[self.head].is_some() {
                break;
            }

            let id = match ready.pop_front(pool) {
                Some(id) => id,
                None => break,
            };

            let pkt = pool.get_mut(id);
            let addr = if pkt.flags.contains(PktFlags::TRANSLATE_DATA) {
                pkt.flags.remove(PktFlags::TRANSLATE_DATA);
                dma_addr(pkt.data)
            } else {
                pkt.data.as_usize() as u32
            };

            let mut ctrl = GRSPW_RXBD_EN;
            if self.head == self.cap - 1 {
                ctrl |= GRSPW_RXBD_WR;
            }
            // The countdown advances for every packet, including ones
            // that request their own interrupt.
            let coal_hit = coal.step();
            if coal_hit || pkt.flags.contains(PktFlags::RX_IE) {
                ctrl |= GRSPW_RXBD_IE;
            }

            let bd = self.bd(self.head);
            unsafe {
                core::ptr::write_volatile(core::ptr::addr_of_mut!((*bd).addr), addr);
            }
            bd_write(unsafe { core::ptr::addr_of_mut!((*bd).ctrl) }, ctrl);

            self.slots[self.head] = Some(id);
            self.head = (self.head + 1) % self.cap;
            scheduled.push_back(pool, id);
            cnt += 1;
        }

        sched.append(pool, &mut scheduled);
        cnt
    }

    /// Move completed packets from the scheduled queue to `recv`,
    /// recording length and outcome bits. An empty tail slot means the
    /// ring is drained.
    pub fn harvest(
        &mut self,
        pool: &mut PktPool,
        sched: &mut PktQueue,
        recv: &mut PktQueue,
        stats: &mut DmaStats,
    ) -> usize {
        let mut done = PktQueue::new();
        let mut cnt = 0;

        while let Some(id) = self.slots[self.tail] {
            let bd = self.bd(self.tail);
            let ctrl = bd_read(unsafe { core::ptr::addr_of!((*bd).ctrl) });
            if ctrl & GRSPW_RXBD_EN != 0 {
                break;
            }

            let pkt = pool.get_mut(id);
            pkt.dlen = (ctrl & GRSPW_RXBD_LEN_MASK) as usize;
            pkt.flags.insert(PktFlags::RX_DONE);
            if ctrl & GRSPW_RXBD_EP != 0 {
                pkt.flags.insert(PktFlags::RX_EEOP);
                stats.rx_err_endpkt += 1;
            }
            if ctrl & GRSPW_RXBD_HC != 0 {
                pkt.flags.insert(PktFlags::RX_HCRC_ERR);
            }
            if ctrl & GRSPW_RXBD_DC != 0 {
                pkt.flags.insert(PktFlags::RX_DCRC_ERR);
            }
            if ctrl & GRSPW_RXBD_TR != 0 {
                pkt.flags.insert(PktFlags::RX_TRUNCATED);
                stats.rx_err_trunk += 1;
            }
            stats.rx_pkts += 1;

            let popped = sched.pop_front(pool);
            debug_assert_eq!(popped, Some(id));
            done.push_back(pool, id);

            self.slots[self.tail] = None;
            self.tail = (self.tail + 1) % self.cap;
            cnt += 1;
        }

        recv.append(pool, &mut done);
        cnt
    }

    /// Clear cursors, slot attachments, and descriptor control words.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;

        for i in 0..self.cap {
            let bd = self.bd(i);
            bd_write(unsafe { core::ptr::addr_of_mut!((*bd).ctrl) }, 0);
        }
    }
}

pub struct TxRing {
    bds: *mut TxBd,
    cap: usize,
    head: usize,
    tail: usize,
    slots: Vec<Option<super::pkt::PktId>>,
}

unsafe impl Send for TxRing {}

impl TxRing {
    /// # Safety
    ///
    /// `bds` must point to at least `cap` descriptors in DMA-visible
    /// memory, valid for the lifetime of the ring.
    pub unsafe fn new(bds: *mut TxBd, cap: usize) -> Self {
        assert!(cap >= 2 && cap <= TX_RING_SIZE);

        Self {
            bds,
            cap,
            head: 0,
            tail: 0,
            slots: vec![None; cap],
        }
    }

    fn bd(&self, i: usize) -> *mut TxBd {
        unsafe { self.bds.add(i) }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Attach send-queue packets to free slots and enable them for the
    /// transmitter. Returns the number scheduled; the caller kicks the
    /// TE bit when it is nonzero.
    pub fn schedule(
        &mut self,
        pool: &mut PktPool,
        send: &mut PktQueue,
        sched: &mut PktQueue,
        coal: &mut IrqCoalesce,
    ) -> usize {
        let mut scheduled = PktQueue::new();
        let mut cnt = 0;

        while !send.is_empty() {
            if self.slots[self.head].is_some() {
                break;
            }

            let id = match send.pop_front(pool) {
                Some(id) => id,
                None => break,
            };

            let pkt = pool.get_mut(id);

            let daddr = if pkt.flags.contains(PktFlags::TRANSLATE_DATA) {
                pkt.flags.remove(PktFlags::TRANSLATE_DATA);
                dma_addr(pkt.data)
            } else {
                pkt.data.as_usize() as u32
            };

            let mut ctrl = GRSPW_TXBD_EN;
            if self.head == self.cap - 1 {
                ctrl |= GRSPW_TXBD_WR;
            }
            // The countdown advances for every packet, including ones
            // that request their own interrupt.
            let coal_hit = coal.step();
            if coal_hit || pkt.flags.contains(PktFlags::TX_IE) {
                ctrl |= GRSPW_TXBD_IE;
            }
            if pkt.flags.contains(PktFlags::TX_HCRC) {
                ctrl |= GRSPW_TXBD_HC;
            }
            if pkt.flags.contains(PktFlags::TX_DCRC) {
                ctrl |= GRSPW_TXBD_DC;
            }

            let bd = self.bd(self.head);

            if pkt.hlen > 0 && !pkt.hdr.is_null() {
                let haddr = if pkt.flags.contains(PktFlags::TRANSLATE_HDR) {
                    pkt.flags.remove(PktFlags::TRANSLATE_HDR);
                    dma_addr(pkt.hdr)
                } else {
                    pkt.hdr.as_usize() as u32
                };
                ctrl |= pkt.hlen as u32 & GRSPW_TXBD_HLEN_MASK;
                ctrl |= (pkt.flags.tx_nocrc_len() << GRSPW_TXBD_NCL_BIT) & GRSPW_TXBD_NCL_MASK;
                unsafe {
                    core::ptr::write_volatile(core::ptr::addr_of_mut!((*bd).haddr), haddr);
                }
            }

            unsafe {
                core::ptr::write_volatile(core::ptr::addr_of_mut!((*bd).dlen), pkt.dlen as u32);
                core::ptr::write_volatile(core::ptr::addr_of_mut!((*bd).daddr), daddr);
            }
            bd_write(unsafe { core::ptr::addr_of_mut!((*bd).ctrl) }, ctrl);

            self.slots[self.head] = Some(id);
            self.head = (self.head + 1) % self.cap;
            scheduled.push_back(pool, id);
            cnt += 1;
        }

        sched.append(pool, &mut scheduled);
        cnt
    }

    /// Move transmitted packets from the scheduled queue to `sent`.
    pub fn harvest(
        &mut self,
        pool: &mut PktPool,
        sched: &mut PktQueue,
        sent: &mut PktQueue,
        stats: &mut DmaStats,
    ) -> usize {
        let mut done = PktQueue::new();
        let mut cnt = 0;

        while let Some(id) = self.slots[self.tail] {
            let bd = self.bd(self.tail);
            let ctrl = bd_read(unsafe { core::ptr::addr_of!((*bd).ctrl) });
            if ctrl & GRSPW_TXBD_EN != 0 {
                break;
            }

            let pkt = pool.get_mut(id);
            pkt.flags.insert(PktFlags::TX_DONE);
            if ctrl & GRSPW_TXBD_LE != 0 {
                pkt.flags.insert(PktFlags::TX_LINKERR);
                stats.tx_err_link += 1;
            }
            stats.tx_pkts += 1;

            let popped = sched.pop_front(pool);
            debug_assert_eq!(popped, Some(id));
            done.push_back(pool, id);

            self.slots[self.tail] = None;
            self.tail = (self.tail + 1) % self.cap;
            cnt += 1;
        }

        sent.append(pool, &mut done);
        cnt
    }

    /// Clear cursors, slot attachments, and descriptor control words.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;

        for i in 0..self.cap {
            let bd = self.bd(i);
            bd_write(unsafe { core::ptr::addr_of_mut!((*bd).ctrl) }, 0);
        }
    }
}

#[cfg(test)]
impl RxRing {
    /// Simulate the receiver completing the `n` oldest enabled
    /// descriptors with `len` received bytes.
    pub(crate) fn hw_complete(&mut self, n: usize, len: u32) {
        let mut i = self.tail;
        for _ in 0..n {
            if self.slots[i].is_none() {
                break;
            }
            let bd = self.bd(i);
            unsafe {
                let ctrl = core::ptr::read_volatile(core::ptr::addr_of!((*bd).ctrl));
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*bd).ctrl),
                    (ctrl & !GRSPW_RXBD_EN & !GRSPW_RXBD_LEN_MASK) | len,
                );
            }
            i = (i + 1) % self.cap;
        }
    }
}

#[cfg(test)]
impl TxRing {
    /// Simulate the transmitter completing the `n` oldest enabled
    /// descriptors.
    pub(crate) fn hw_complete(&mut self, n: usize) {
        let mut i = self.tail;
        for _ in 0..n {
            if self.slots[i].is_none() {
                break;
            }
            let bd = self.bd(i);
            unsafe {
                let ctrl = core::ptr::read_volatile(core::ptr::addr_of!((*bd).ctrl));
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*bd).ctrl),
                    ctrl & !GRSPW_TXBD_EN,
                );
            }
            i = (i + 1) % self.cap;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::pkt::Packet;
    use super::*;
    use spwkernel_lib::addr::VirtAddr;
    use spwkernel_lib::dma_pool::DMAPool;

    struct Fixture {
        _mem: DMAPool<BdTables>,
        rx: RxRing,
        tx: TxRing,
        pool: PktPool,
        stats: DmaStats,
    }

    fn fixture(rx_cap: usize, tx_cap: usize) -> Fixture {
        let mut mem = DMAPool::<BdTables>::new(1).unwrap();
        let tables = mem.as_mut();
        let rx = unsafe { RxRing::new(tables.rx.as_mut_ptr(), rx_cap) };
        let tx = unsafe { TxRing::new(tables.tx.as_mut_ptr(), tx_cap) };

        Fixture {
            _mem: mem,
            rx,
            tx,
            pool: PktPool::new(),
            stats: DmaStats::default(),
        }
    }

    fn queue_of(pool: &mut PktPool, q: &mut PktQueue, n: usize) {
        for i in 0..n {
            let id = pool.alloc(Packet::new(VirtAddr::new(0x10000 + i * 0x100), 64));
            q.push_back(pool, id);
        }
    }

    #[test]
    fn rx_schedule_encodes_control_word() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        queue_of(&mut f.pool, &mut ready, 4);
        let n = f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);
        assert_eq!(n, 4);

        let bd0 = unsafe { core::ptr::read_volatile(f.rx.bd(0)) };
        assert_eq!(bd0.ctrl, GRSPW_RXBD_EN);
        assert_eq!(bd0.addr, 0x10000);

        // Last slot carries the wrap bit.
        let bd3 = unsafe { core::ptr::read_volatile(f.rx.bd(3)) };
        assert_eq!(bd3.ctrl, GRSPW_RXBD_EN | GRSPW_RXBD_WR);
    }

    #[test]
    fn tx_schedule_encodes_header_and_crc() {
        let mut f = fixture(4, 4);
        let mut send = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        let mut pkt = Packet::new(VirtAddr::new(0x20000), 100);
        pkt.hdr = VirtAddr::new(0x30000);
        pkt.hlen = 8;
        pkt.flags = PktFlags::TX_HCRC | PktFlags::TX_DCRC | PktFlags::from_bits_retain(0x2);
        let id = f.pool.alloc(pkt);
        send.push_back(&mut f.pool, id);

        assert_eq!(f.tx.schedule(&mut f.pool, &mut send, &mut sched, &mut coal), 1);

        let bd = unsafe { core::ptr::read_volatile(f.tx.bd(0)) };
        assert_eq!(
            bd.ctrl,
            GRSPW_TXBD_EN | GRSPW_TXBD_HC | GRSPW_TXBD_DC | 8 | (0x2 << GRSPW_TXBD_NCL_BIT)
        );
        assert_eq!(bd.haddr, 0x30000);
        assert_eq!(bd.daddr, 0x20000);
        assert_eq!(bd.dlen, 100);
    }

    #[test]
    fn schedule_is_bounded_by_capacity() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        queue_of(&mut f.pool, &mut ready, 6);
        let n = f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);
        assert_eq!(n, 4);
        assert_eq!(ready.count(), 2);
        assert_eq!(sched.count(), 4);

        // No free slot, nothing more goes in.
        let n = f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);
        assert_eq!(n, 0);
    }

    #[test]
    fn harvest_stops_at_enabled_descriptor() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut recv = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        queue_of(&mut f.pool, &mut ready, 4);
        f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);

        // Hardware completes the first two descriptors.
        for i in 0..2 {
            let bd = f.rx.bd(i);
            unsafe {
                let ctrl = core::ptr::read_volatile(core::ptr::addr_of!((*bd).ctrl));
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*bd).ctrl),
                    (ctrl & !GRSPW_RXBD_EN & !GRSPW_RXBD_LEN_MASK) | 42,
                );
            }
        }

        let n = f.rx.harvest(&mut f.pool, &mut sched, &mut recv, &mut f.stats);
        assert_eq!(n, 2);
        assert_eq!(sched.count(), 2);
        assert_eq!(recv.count(), 2);
        assert_eq!(f.stats.rx_pkts, 2);

        let id = recv.pop_front(&mut f.pool).unwrap();
        let pkt = f.pool.get(id);
        assert!(pkt.flags.contains(PktFlags::RX_DONE));
        assert_eq!(pkt.dlen, 42);

        // Nothing further completed.
        let n = f.rx.harvest(&mut f.pool, &mut sched, &mut recv, &mut f.stats);
        assert_eq!(n, 0);
    }

    #[test]
    fn harvest_records_rx_errors() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut recv = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        queue_of(&mut f.pool, &mut ready, 1);
        f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);

        let bd = f.rx.bd(0);
        unsafe {
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*bd).ctrl),
                GRSPW_RXBD_TR | GRSPW_RXBD_DC | 10,
            );
        }

        f.rx.harvest(&mut f.pool, &mut sched, &mut recv, &mut f.stats);

        let id = recv.pop_front(&mut f.pool).unwrap();
        let flags = f.pool.get(id).flags;
        assert!(flags.contains(PktFlags::RX_TRUNCATED));
        assert!(flags.contains(PktFlags::RX_DCRC_ERR));
        assert_eq!(f.stats.rx_err_trunk, 1);
    }

    #[test]
    fn tx_harvest_marks_link_error() {
        let mut f = fixture(4, 4);
        let mut send = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut sent = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        queue_of(&mut f.pool, &mut send, 1);
        f.tx.schedule(&mut f.pool, &mut send, &mut sched, &mut coal);

        let bd = f.tx.bd(0);
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*bd).ctrl), GRSPW_TXBD_LE);
        }

        assert_eq!(f.tx.harvest(&mut f.pool, &mut sched, &mut sent, &mut f.stats), 1);

        let id = sent.pop_front(&mut f.pool).unwrap();
        let flags = f.pool.get(id).flags;
        assert!(flags.contains(PktFlags::TX_DONE));
        assert!(flags.contains(PktFlags::TX_LINKERR));
        assert_eq!(f.stats.tx_err_link, 1);
    }

    #[test]
    fn coalescing_requests_irq_every_nth_packet() {
        let mut f = fixture(8, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(3);

        queue_of(&mut f.pool, &mut ready, 6);
        f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);

        let ie: Vec<bool> = (0..6)
            .map(|i| unsafe {
                core::ptr::read_volatile(core::ptr::addr_of!((*f.rx.bd(i)).ctrl))
                    & GRSPW_RXBD_IE
                    != 0
            })
            .collect();
        assert_eq!(ie, [false, false, true, false, false, true]);
    }

    #[test]
    fn explicit_irq_flag_still_advances_coalescing() {
        let mut f = fixture(8, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(3);

        // Packet 0 requests its own interrupt; the countdown must count
        // it anyway, so the cadence stays every third packet.
        for i in 0..6 {
            let mut pkt = Packet::new(VirtAddr::new(0x10000 + i * 0x100), 64);
            if i == 0 {
                pkt.flags = PktFlags::RX_IE;
            }
            let id = f.pool.alloc(pkt);
            ready.push_back(&mut f.pool, id);
        }

        f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);

        let ie: Vec<bool> = (0..6)
            .map(|i| unsafe {
                core::ptr::read_volatile(core::ptr::addr_of!((*f.rx.bd(i)).ctrl))
                    & GRSPW_RXBD_IE
                    != 0
            })
            .collect();
        assert_eq!(ie, [true, false, true, false, false, true]);
    }

    #[test]
    fn per_packet_irq_flag_forces_ie() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        let mut pkt = Packet::new(VirtAddr::new(0x1000), 64);
        pkt.flags = PktFlags::RX_IE;
        let id = f.pool.alloc(pkt);
        ready.push_back(&mut f.pool, id);

        f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);

        let ctrl = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*f.rx.bd(0)).ctrl)) };
        assert!(ctrl & GRSPW_RXBD_IE != 0);
    }

    #[test]
    fn ring_wraps_and_keeps_fifo() {
        let mut f = fixture(4, 4);
        let mut ready = PktQueue::new();
        let mut sched = PktQueue::new();
        let mut recv = PktQueue::new();
        let mut coal = IrqCoalesce::new(0);

        // Two full passes over a capacity-4 ring.
        let mut expect = Vec::new();
        for round in 0..2 {
            queue_of(&mut f.pool, &mut ready, 4);
            f.rx.schedule(&mut f.pool, &mut ready, &mut sched, &mut coal);
            for i in 0..4 {
                let bd = f.rx.bd(i);
                unsafe {
                    core::ptr::write_volatile(
                        core::ptr::addr_of_mut!((*bd).ctrl),
                        (round * 4 + i) as u32,
                    );
                }
            }
            f.rx.harvest(&mut f.pool, &mut sched, &mut recv, &mut f.stats);
            for i in 0..4 {
                expect.push((round * 4 + i) as usize);
            }
        }

        let mut got = Vec::new();
        while let Some(id) = recv.pop_front(&mut f.pool) {
            got.push(f.pool.get(id).dlen);
        }
        assert_eq!(got, expect);
    }
}
