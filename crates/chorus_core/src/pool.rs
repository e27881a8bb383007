//! Bounded apply work queue, one per peer.
//!
//! Single producer (the receiver loop), single consumer (the executor
//! thread). The queue is bounded in bytes so a flood of large transactions
//! exerts backpressure on the receiver instead of exhausting memory.
//! Counters are plain atomics so observers can poll progress without
//! touching the queue lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct PoolInner {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    closed: bool,
}

pub struct BgwPool {
    capacity_bytes: usize,
    inner: Mutex<PoolInner>,
    not_empty: Condvar,
    not_full: Condvar,
    pending: AtomicUsize,
    active: AtomicUsize,
}

impl BgwPool {
    pub fn new(capacity_bytes: usize) -> Arc<BgwPool> {
        Arc::new(BgwPool {
            capacity_bytes,
            inner: Mutex::new(PoolInner {
                queue: VecDeque::new(),
                queued_bytes: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        })
    }

    /// Enqueue one job, blocking while the queue is over capacity. A single
    /// oversized job is admitted alone rather than rejected.
    pub fn submit(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.closed
            && inner.queued_bytes + payload.len() > self.capacity_bytes
            && !inner.queue.is_empty()
        {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return;
        }
        inner.queued_bytes += payload.len();
        inner.queue.push_back(payload);
        self.pending.fetch_add(1, Ordering::Release);
        self.not_empty.notify_one();
    }

    /// Take the next job; `None` means the pool is closed and drained.
    /// The job counts as active until `finish` is called.
    pub fn take(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(payload) = inner.queue.pop_front() {
                inner.queued_bytes -= payload.len();
                self.pending.fetch_sub(1, Ordering::Release);
                self.active.fetch_add(1, Ordering::Release);
                self.not_full.notify_one();
                return Some(payload);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn finish(&self) {
        self.active.fetch_sub(1, Ordering::Release);
    }

    /// Queued plus running jobs.
    pub fn tasks_outstanding(&self) -> usize {
        self.pending.load(Ordering::Acquire) + self.active.load(Ordering::Acquire)
    }

    pub fn all_finished(&self) -> bool {
        self.tasks_outstanding() == 0
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
