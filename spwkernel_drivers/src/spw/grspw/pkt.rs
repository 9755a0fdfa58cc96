//! Packets, the packet arena, and the linked packet queues.
//!
//! A packet handle lives in exactly one queue or one descriptor slot at
//! a time. The queues link arena slots by index, so append, head
//! removal, and whole-list splice are all O(1) without raw pointers.

use alloc::vec::Vec;

use bitflags::bitflags;
use spwkernel_lib::addr::VirtAddr;

bitflags! {
    /// Per-packet request and outcome bits.
    ///
    /// The low nibble carries the number of leading header bytes
    /// excluded from the TX header CRC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PktFlags: u32 {
        /// TX: number of header bytes not covered by the header CRC.
        const TX_NOCRC_MASK = 0x000f;
        /// RX: request a completion interrupt for this packet.
        const RX_IE = 0x0010;
        /// TX: request a completion interrupt for this packet.
        const TX_IE = 0x0040;
        /// TX: append a header CRC.
        const TX_HCRC = 0x0100;
        /// TX: append a data CRC.
        const TX_DCRC = 0x0200;
        /// RX outcome: packet ended with early EOP.
        const RX_EEOP = 0x0100;
        /// RX outcome: header CRC error.
        const RX_HCRC_ERR = 0x0200;
        /// RX outcome: data CRC error.
        const RX_DCRC_ERR = 0x0400;
        /// RX outcome: packet truncated to the maximum length.
        const RX_TRUNCATED = 0x0800;
        /// Data buffer address needs virtual-to-DMA translation.
        const TRANSLATE_DATA = 0x1000;
        /// Header buffer address needs virtual-to-DMA translation.
        const TRANSLATE_HDR = 0x2000;
        /// TX outcome: the packet was transmitted.
        const TX_DONE = 0x4000;
        /// TX outcome: a link error occurred during transmission.
        const TX_LINKERR = 0x8000;
        /// RX outcome: the packet was received.
        const RX_DONE = 0x8000;
    }
}

impl PktFlags {
    pub fn tx_nocrc_len(&self) -> u32 {
        self.bits() & Self::TX_NOCRC_MASK.bits()
    }
}

/// One SpaceWire frame owned by a client.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    /// Payload buffer.
    pub data: VirtAddr,
    /// Payload length in bytes. Written back by RX harvest.
    pub dlen: usize,
    /// Optional header buffer, null if absent. TX only.
    pub hdr: VirtAddr,
    /// Header length in bytes.
    pub hlen: usize,
    pub flags: PktFlags,
}

impl Packet {
    pub fn new(data: VirtAddr, dlen: usize) -> Self {
        Self {
            data,
            dlen,
            hdr: VirtAddr::new(0),
            hlen: 0,
            flags: PktFlags::empty(),
        }
    }
}

/// Stable handle into the packet arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktId(u32);

struct Slot {
    pkt: Packet,
    next: Option<PktId>,
    /// Linked into a queue right now. Guards against double insertion.
    linked: bool,
    allocated: bool,
}

/// Arena of packet slots. Grows on demand; freed slots are recycled
/// through an internal free list.
pub struct PktPool {
    slots: Vec<Slot>,
    free: Option<PktId>,
}

impl PktPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
        }
    }

    pub fn alloc(&mut self, pkt: Packet) -> PktId {
        if let Some(id) = self.free {
            let slot = &mut self.slots[id.0 as usize];
            self.free = slot.next;
            slot.pkt = pkt;
            slot.next = None;
            slot.linked = false;
            slot.allocated = true;
            id
        } else {
            let id = PktId(self.slots.len() as u32);
            self.slots.push(Slot {
                pkt,
                next: None,
                linked: false,
                allocated: true,
            });
            id
        }
    }

    /// Release the slot and return the packet it held.
    pub fn free(&mut self, id: PktId) -> Packet {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.allocated);
        debug_assert!(!slot.linked);
        slot.allocated = false;
        slot.next = self.free;
        self.free = Some(id);
        slot.pkt
    }

    pub fn get(&self, id: PktId) -> &Packet {
        debug_assert!(self.slots[id.0 as usize].allocated);
        &self.slots[id.0 as usize].pkt
    }

    pub fn get_mut(&mut self, id: PktId) -> &mut Packet {
        debug_assert!(self.slots[id.0 as usize].allocated);
        &mut self.slots[id.0 as usize].pkt
    }

    fn next_of(&self, id: PktId) -> Option<PktId> {
        self.slots[id.0 as usize].next
    }
}

impl Default for PktPool {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of packet handles linked through the arena.
#[derive(Debug)]
pub struct PktQueue {
    head: Option<PktId>,
    tail: Option<PktId>,
    count: usize,
}

impl PktQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push_back(&mut self, pool: &mut PktPool, id: PktId) {
        let slot = &mut pool.slots[id.0 as usize];
        debug_assert!(slot.allocated);
        debug_assert!(!slot.linked);
        slot.next = None;
        slot.linked = true;

        match self.tail {
            Some(tail) => pool.slots[tail.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
    }

    pub fn pop_front(&mut self, pool: &mut PktPool) -> Option<PktId> {
        let id = self.head?;
        let slot = &mut pool.slots[id.0 as usize];
        debug_assert!(slot.linked);

        self.head = slot.next;
        if self.head.is_none() {
            self.tail = None;
        }
        slot.next = None;
        slot.linked = false;
        self.count -= 1;
        Some(id)
    }

    /// Move every packet of `other` onto the tail of `self`, preserving
    /// order. O(1).
    pub fn append(&mut self, pool: &mut PktPool, other: &mut PktQueue) {
        let Some(other_head) = other.head else {
            return;
        };

        match self.tail {
            Some(tail) => pool.slots[tail.0 as usize].next = Some(other_head),
            None => self.head = Some(other_head),
        }
        self.tail = other.tail;
        self.count += other.count;

        other.head = None;
        other.tail = None;
        other.count = 0;
    }

    /// Drop every reference without freeing slots. Used when a channel
    /// restarts; the client is expected to have reclaimed beforehand.
    pub fn reset(&mut self, pool: &mut PktPool) {
        while self.pop_front(pool).is_some() {}
    }

    pub fn iter<'a>(&'a self, pool: &'a PktPool) -> PktIter<'a> {
        PktIter {
            pool,
            pos: self.head,
        }
    }
}

impl Default for PktQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PktIter<'a> {
    pool: &'a PktPool,
    pos: Option<PktId>,
}

impl Iterator for PktIter<'_> {
    type Item = PktId;

    fn next(&mut self) -> Option<PktId> {
        let id = self.pos?;
        self.pos = self.pool.next_of(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(n: usize) -> Packet {
        Packet::new(VirtAddr::new(0x1000 * (n + 1)), n)
    }

    #[test]
    fn fifo_order() {
        let mut pool = PktPool::new();
        let mut q = PktQueue::new();

        let ids: Vec<_> = (0..5).map(|n| pool.alloc(pkt(n))).collect();
        for id in &ids {
            q.push_back(&mut pool, *id);
        }

        assert_eq!(q.count(), 5);
        for id in &ids {
            assert_eq!(q.pop_front(&mut pool), Some(*id));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn append_preserves_order() {
        let mut pool = PktPool::new();
        let mut a = PktQueue::new();
        let mut b = PktQueue::new();

        let ids: Vec<_> = (0..6).map(|n| pool.alloc(pkt(n))).collect();
        for id in &ids[..3] {
            a.push_back(&mut pool, *id);
        }
        for id in &ids[3..] {
            b.push_back(&mut pool, *id);
        }

        a.append(&mut pool, &mut b);
        assert_eq!(a.count(), 6);
        assert!(b.is_empty());

        let order: Vec<_> = a.iter(&pool).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn append_onto_empty() {
        let mut pool = PktPool::new();
        let mut a = PktQueue::new();
        let mut b = PktQueue::new();

        let id = pool.alloc(pkt(0));
        b.push_back(&mut pool, id);
        a.append(&mut pool, &mut b);

        assert_eq!(a.pop_front(&mut pool), Some(id));
    }

    #[test]
    fn slots_are_recycled() {
        let mut pool = PktPool::new();

        let a = pool.alloc(pkt(0));
        pool.free(a);
        let b = pool.alloc(pkt(1));
        assert_eq!(a, b);
        assert_eq!(pool.get(b).dlen, 1);
    }

    #[test]
    #[should_panic]
    fn double_insert_is_caught() {
        let mut pool = PktPool::new();
        let mut a = PktQueue::new();
        let mut b = PktQueue::new();

        let id = pool.alloc(pkt(0));
        a.push_back(&mut pool, id);
        b.push_back(&mut pool, id);
    }
}
