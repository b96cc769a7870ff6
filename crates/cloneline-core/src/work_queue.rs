//! Bounded FIFO work queue shared by all threads of one pipeline stage
//!
//! Producers block when the queue is at capacity (recording themselves as
//! stalled) and consumers block when it is empty (recording themselves as
//! idle). Live counters are readable at any time without blocking either
//! side — they back the periodic stage-health report.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Default per-stage queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Live counters for one stage, all relaxed atomics.
#[derive(Debug, Default)]
pub struct StageStats {
    pub threads: AtomicUsize,
    pub idle: AtomicUsize,
    pub stalled: AtomicUsize,
    pub processed: AtomicUsize,
    pub recoverable_errors: AtomicUsize,
    pub fatal_errors: AtomicUsize,
}

/// Point-in-time copy of [`StageStats`], eventually consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub threads: usize,
    pub idle: usize,
    pub stalled: usize,
    pub processed: usize,
    pub recoverable_errors: usize,
    pub fatal_errors: usize,
}

impl StageStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            threads: self.threads.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner<J> {
    items: VecDeque<J>,
    closed: bool,
}

/// Typed, size-limited FIFO queue with backpressure.
///
/// `schedule` blocks while the queue holds `capacity` items; `take_next`
/// blocks while it is empty. Ordering is strict FIFO. A job, once accepted,
/// is never dropped. `close` lets consumers drain and exit once producers
/// are done; a long-running deployment simply never calls it.
pub struct BoundedWorkQueue<J> {
    label: String,
    capacity: usize,
    inner: Mutex<Inner<J>>,
    not_empty: Condvar,
    not_full: Condvar,
    stats: Arc<StageStats>,
}

impl<J> BoundedWorkQueue<J> {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            label: label.into(),
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stats: Arc::new(StageStats::default()),
        }
    }

    pub fn with_default_capacity(label: impl Into<String>) -> Self {
        Self::new(label, DEFAULT_QUEUE_CAPACITY)
    }

    /// Append a job, blocking while the queue is at capacity.
    ///
    /// Returns the job back if the queue was closed before it could be
    /// accepted.
    pub fn schedule(&self, job: J) -> Result<(), J> {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.capacity && !inner.closed {
            self.stats.stalled.fetch_add(1, Ordering::Relaxed);
            log::trace!("{}: producer stalled (queue full)", self.label);
            inner = self.not_full.wait(inner).unwrap();
            self.stats.stalled.fetch_sub(1, Ordering::Relaxed);
        }
        if inner.closed {
            return Err(job);
        }
        inner.items.push_back(job);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the oldest job, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub fn take_next(&self) -> Option<J> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = inner.items.pop_front() {
                // A slot just freed: hand it to one stalled producer.
                self.not_full.notify_one();
                return Some(job);
            }
            if inner.closed {
                return None;
            }
            self.stats.idle.fetch_add(1, Ordering::Relaxed);
            inner = self.not_empty.wait(inner).unwrap();
            self.stats.idle.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Close the queue: no new jobs are accepted, consumers drain what is
    /// left and then observe `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    /// Shareable handle for the stage-health reporter.
    pub fn stats_handle(&self) -> (String, Arc<StageStats>) {
        (self.label.clone(), Arc::clone(&self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = BoundedWorkQueue::new("test", 10);
        q.schedule(1).unwrap();
        q.schedule(2).unwrap();
        q.schedule(3).unwrap();
        assert_eq!(q.take_next(), Some(1));
        assert_eq!(q.take_next(), Some(2));
        assert_eq!(q.take_next(), Some(3));
    }

    #[test]
    fn close_drains_then_none() {
        let q = BoundedWorkQueue::new("test", 10);
        q.schedule(7).unwrap();
        q.close();
        assert_eq!(q.schedule(8), Err(8));
        assert_eq!(q.take_next(), Some(7));
        assert_eq!(q.take_next(), None);
    }

    #[test]
    fn consumer_blocks_until_producer() {
        let q = Arc::new(BoundedWorkQueue::new("test", 4));
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.take_next());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(q.stats().snapshot().idle, 1);
        q.schedule(42).unwrap();
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    /// Capacity 2, three jobs from two producers: the overflow `schedule`
    /// must block until a consumer takes at least one job, and no job is
    /// ever delivered twice.
    #[test]
    fn producers_stall_at_capacity() {
        let q = Arc::new(BoundedWorkQueue::new("test", 2));
        q.schedule(0).unwrap();
        q.schedule(1).unwrap();

        let blocked = Arc::new(AtomicBool::new(true));
        let producers: Vec<_> = [2, 3]
            .into_iter()
            .map(|job| {
                let q = Arc::clone(&q);
                let blocked = Arc::clone(&blocked);
                std::thread::spawn(move || {
                    q.schedule(job).unwrap();
                    blocked.store(false, Ordering::SeqCst);
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        // Still at capacity: neither extra producer got through.
        assert!(blocked.load(Ordering::SeqCst));
        assert_eq!(q.stats().snapshot().stalled, 2);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(q.take_next().unwrap());
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(q.stats().snapshot().stalled, 0);
    }

    #[test]
    fn take_wakes_exactly_while_draining() {
        let q = Arc::new(BoundedWorkQueue::new("test", 1));
        q.schedule(1).unwrap();
        let q2 = Arc::clone(&q);
        let producer = std::thread::spawn(move || q2.schedule(2).unwrap());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.take_next(), Some(1));
        producer.join().unwrap();
        assert_eq!(q.take_next(), Some(2));
    }
}
