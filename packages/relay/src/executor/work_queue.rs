// packages/relay/src/executor/work_queue.rs
//! Bounded MPMC work queue
//!
//! A lock-free `ArrayQueue` with async waiting on both ends: producers wait
//! while the queue is full, workers wait while it is empty. Closing the queue
//! wakes everyone; producers are refused and workers drain what is left.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct WorkQueue<T> {
    /// Underlying bounded queue
    queue: ArrayQueue<T>,

    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,

    /// Push counter
    push_count: AtomicU64,

    /// Pop counter
    pop_count: AtomicU64,

    /// Pushes refused because the queue was closed or full
    reject_count: AtomicU64,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            reject_count: AtomicU64::new(0),
        }
    }

    /// Enqueue, waiting for room. A closed queue hands the item back.
    pub async fn push(&self, mut item: T) -> Result<(), T> {
        loop {
            let room = self.not_full.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            if self.is_closed() {
                self.reject_count.fetch_add(1, Ordering::Relaxed);
                return Err(item);
            }
            match self.queue.push(item) {
                Ok(()) => {
                    self.push_count.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                Err(back) => item = back,
            }

            room.await;
        }
    }

    /// Dequeue, waiting for work. `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let work = self.not_empty.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }

            work.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        self.not_full.notify_one();
        Some(item)
    }

    /// Refuse further pushes and wake all waiters
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            reject_count: self.reject_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub reject_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}
