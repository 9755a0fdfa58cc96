//! Bounded message queue.
//!
//! Senders never block; a full queue rejects the message and hands it
//! back. The receiver blocks, which suits an interrupt handler posting
//! work to a worker thread.

use alloc::vec::Vec;

use crate::sync::mutex::Mutex;

/// Ring buffer backing the queue.
struct RingQ<T> {
    queue: Vec<Option<T>>,
    size: usize,
    head: usize,
    tail: usize,
}

impl<T> RingQ<T> {
    fn new(queue_size: usize) -> Self {
        let mut queue = Vec::new();
        queue.resize_with(queue_size, || None);

        Self {
            queue,
            size: 0,
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, data: T) -> Result<(), T> {
        if self.queue.len() == self.size {
            return Err(data);
        }

        self.queue[self.tail] = Some(data);
        self.tail += 1;
        if self.tail == self.queue.len() {
            self.tail = 0;
        }

        self.size += 1;

        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.size == 0 {
            None
        } else {
            let result = self.queue[self.head].take();

            self.head += 1;
            if self.head == self.queue.len() {
                self.head = 0;
            }

            self.size -= 1;

            result
        }
    }
}

pub struct MsgQueue<T> {
    ringq: Mutex<RingQ<T>>,

    #[cfg(feature = "std")]
    condvar: parking_lot::Condvar,
}

#[cfg(feature = "std")]
impl<T> MsgQueue<T> {
    pub fn new(queue_size: usize) -> Self {
        Self {
            ringq: Mutex::new(RingQ::new(queue_size)),
            condvar: parking_lot::Condvar::new(),
        }
    }

    /// Enqueue without blocking. A full queue returns the message.
    pub fn try_send(&self, data: T) -> Result<(), T> {
        let result = {
            let mut ringq = self.ringq.lock();
            ringq.push(data)
        };

        if result.is_ok() {
            self.condvar.notify_one();
        }

        result
    }

    /// Dequeue without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.ringq.lock().pop()
    }

    /// Block until a message arrives.
    pub fn recv(&self) -> T {
        let mut ringq = self.ringq.lock();

        loop {
            if let Some(data) = ringq.pop() {
                return data;
            }

            self.condvar.wait(&mut ringq);
        }
    }
}

#[cfg(not(feature = "std"))]
impl<T> MsgQueue<T> {
    pub fn new(queue_size: usize) -> Self {
        Self {
            ringq: Mutex::new(RingQ::new(queue_size)),
        }
    }

    /// Enqueue without blocking. A full queue returns the message.
    pub fn try_send(&self, data: T) -> Result<(), T> {
        self.ringq.lock().push(data)
    }

    /// Dequeue without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.ringq.lock().pop()
    }

    /// Spin until a message arrives.
    pub fn recv(&self) -> T {
        loop {
            if let Some(data) = self.try_recv() {
                return data;
            }

            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = MsgQueue::new(8);

        for i in 0..8u32 {
            q.try_send(i).unwrap();
        }

        for i in 0..8u32 {
            assert_eq!(q.try_recv(), Some(i));
        }

        assert_eq!(q.try_recv(), None);
    }

    #[test]
    fn full_queue_returns_message() {
        let q = MsgQueue::new(2);

        q.try_send(1u32).unwrap();
        q.try_send(2u32).unwrap();
        assert_eq!(q.try_send(3u32), Err(3));

        assert_eq!(q.try_recv(), Some(1));
        q.try_send(3u32).unwrap();
    }

    #[test]
    fn recv_blocks_until_send() {
        use std::sync::Arc;

        let q = Arc::new(MsgQueue::new(4));
        let q2 = q.clone();

        let handle = std::thread::spawn(move || q2.recv());

        std::thread::sleep(core::time::Duration::from_millis(20));
        q.try_send(42u32).unwrap();

        assert_eq!(handle.join().unwrap(), 42);
    }
}
