//! Interrupt-to-worker handoff.
//!
//! The ISR condenses everything the worker needs into one `u32`:
//! device index in bits [23:16], per-channel error flags in bits
//! [11:8], and per-channel RX/TX completion flags in bits [7:0], two
//! bits per channel. Bit 12 requests a full device shutdown and bit 13
//! terminates the worker.

use spwkernel_lib::sync::msgq::MsgQueue;

#[cfg(feature = "std")]
use alloc::sync::Arc;

const WORK_DMA_MASK: u32 = 0x00ff;
const WORK_ERR_MASK: u32 = 0x0f00;
const WORK_ERR_BIT: u32 = 8;
const WORK_SHUTDOWN: u32 = 0x1000;
const WORK_QUIT: u32 = 0x2000;
const WORK_CORE_BIT: u32 = 16;
const WORK_CORE_MASK: u32 = 0x00ff_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkMsg(u32);

impl WorkMsg {
    pub fn new(device: usize) -> Self {
        Self(((device as u32) << WORK_CORE_BIT) & WORK_CORE_MASK)
    }

    /// Message that makes the worker exit its loop.
    pub fn quit() -> Self {
        Self(WORK_QUIT)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn device(&self) -> usize {
        ((self.0 & WORK_CORE_MASK) >> WORK_CORE_BIT) as usize
    }

    pub fn set_rx(&mut self, chan: usize) {
        self.0 |= 1 << (chan * 2);
    }

    pub fn set_tx(&mut self, chan: usize) {
        self.0 |= 1 << (chan * 2 + 1);
    }

    pub fn set_err(&mut self, chan: usize) {
        self.0 |= 1 << (WORK_ERR_BIT as usize + chan);
    }

    pub fn set_shutdown(&mut self) {
        self.0 |= WORK_SHUTDOWN;
    }

    pub fn rx(&self, chan: usize) -> bool {
        self.0 & (1 << (chan * 2)) != 0
    }

    pub fn tx(&self, chan: usize) -> bool {
        self.0 & (1 << (chan * 2 + 1)) != 0
    }

    pub fn err(&self, chan: usize) -> bool {
        self.0 & (1 << (WORK_ERR_BIT as usize + chan)) != 0
    }

    pub fn shutdown(&self) -> bool {
        self.0 & WORK_SHUTDOWN != 0
    }

    pub fn is_quit(&self) -> bool {
        self.0 & WORK_QUIT != 0
    }

    /// True if the message asks the worker to do anything at all.
    pub fn has_work(&self) -> bool {
        self.0 & (WORK_DMA_MASK | WORK_ERR_MASK | WORK_SHUTDOWN) != 0
    }
}

pub type WorkQueue = MsgQueue<WorkMsg>;

/// Handle one work message. Returns false when the worker should exit.
pub fn process(msg: WorkMsg) -> bool {
    if msg.is_quit() {
        return false;
    }

    let Some(dev) = crate::spw::device(msg.device()) else {
        log::warn!("grspw work: no device with index {}", msg.device());
        return true;
    };

    if msg.shutdown() {
        dev.shutdown();
        return true;
    }

    for i in 0..dev.num_channels() {
        let rx = msg.rx(i);
        let tx = msg.tx(i);
        let err = msg.err(i);
        if rx || tx || err {
            dev.dma(i).dma_work(rx, tx, err);
        }
    }

    true
}

/// Single consumer of the work queue; runs until a quit message.
pub fn work_loop(queue: &WorkQueue) {
    loop {
        let msg = queue.recv();
        if !process(msg) {
            break;
        }
    }
}

#[cfg(feature = "std")]
pub fn spawn_worker(queue: Arc<WorkQueue>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || work_loop(&queue))
}
