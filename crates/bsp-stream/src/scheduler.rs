//! Pending-sample queue with lossy backpressure and single-flight flushing

use bsp_core::{ChannelSample, SEQUENCE_MODULUS};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Result of one enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueOutcome {
    /// Samples discarded from the front to make room
    pub dropped: usize,
    /// This enqueue moved the scheduler from idle to flush-pending
    pub scheduled: bool,
}

#[derive(Debug)]
struct PendingQueue {
    samples: VecDeque<ChannelSample>,
    next_sequence: u32,
}

/// Batching scheduler shared by producers and the flush driver
#[derive(Debug)]
pub struct Scheduler {
    queue: Mutex<PendingQueue>,
    capacity: usize,
    drop_count: usize,
    flush_scheduled: AtomicBool,
    flushing: AtomicBool,
    dropped_total: AtomicU64,
}

/// Clears the in-flight flag when a flush ends, including by unwinding
pub struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(capacity: usize, drop_fraction: f64) -> Self {
        let capacity = capacity.max(1);
        let drop_count = ((capacity as f64 * drop_fraction).round() as usize).clamp(1, capacity);
        Self {
            queue: Mutex::new(PendingQueue {
                samples: VecDeque::with_capacity(capacity.min(8192)),
                next_sequence: 0,
            }),
            capacity,
            drop_count,
            flush_scheduled: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().samples.len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.load(Ordering::Acquire)
    }

    /// Append a sample, stamping its sequence id.
    ///
    /// Never blocks on a consumer and never rejects; past capacity the oldest
    /// samples are discarded.
    pub fn enqueue(&self, mut sample: ChannelSample) -> EnqueueOutcome {
        let mut dropped = 0;
        let scheduled = {
            let mut queue = self.queue.lock();
            sample.sequence_id = Some(queue.next_sequence);
            queue.next_sequence = (queue.next_sequence + 1) % SEQUENCE_MODULUS;
            queue.samples.push_back(sample);

            if queue.samples.len() > self.capacity {
                dropped = self.drop_count.min(queue.samples.len());
                queue.samples.drain(..dropped);
            }
            !self.flush_scheduled.swap(true, Ordering::AcqRel)
        };

        if dropped > 0 {
            self.dropped_total.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(dropped, capacity = self.capacity, "pending queue overflow; dropped oldest samples");
        }

        EnqueueOutcome { dropped, scheduled }
    }

    /// Claim the single flush slot; `None` while another flush is running
    pub fn begin_flush(&self) -> Option<FlushGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard { flag: &self.flushing })
    }

    /// Take every pending sample in order and clear the scheduled flag
    pub fn take_pending(&self) -> Vec<ChannelSample> {
        let mut queue = self.queue.lock();
        self.flush_scheduled.store(false, Ordering::Release);
        queue.samples.drain(..).collect()
    }

    /// Discard pending samples without delivering them
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        self.flush_scheduled.store(false, Ordering::Release);
        let count = queue.samples.len();
        queue.samples.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f64) -> ChannelSample {
        ChannelSample::new(vec![v])
    }

    #[test]
    fn test_sequence_ids_and_scheduling() {
        let scheduler = Scheduler::new(10, 0.2);
        assert!(scheduler.enqueue(sample(1.0)).scheduled);
        assert!(!scheduler.enqueue(sample(2.0)).scheduled);
        assert!(scheduler.is_flush_scheduled());

        let taken = scheduler.take_pending();
        assert_eq!(taken.iter().map(|s| s.sequence_id).collect::<Vec<_>>(), vec![Some(0), Some(1)]);
        assert!(!scheduler.is_flush_scheduled());
        assert!(scheduler.enqueue(sample(3.0)).scheduled);
    }

    #[test]
    fn test_overflow_drops_oldest_fraction() {
        let scheduler = Scheduler::new(10, 0.2);
        for i in 0..10 {
            assert_eq!(scheduler.enqueue(sample(i as f64)).dropped, 0);
        }
        let outcome = scheduler.enqueue(sample(10.0));
        assert_eq!(outcome.dropped, 2);
        assert_eq!(scheduler.pending(), 9);
        assert_eq!(scheduler.dropped_total(), 2);

        let values: Vec<f64> = scheduler.take_pending().iter().map(|s| s.channels[0]).collect();
        assert_eq!(values, (2..=10).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequence_wraps() {
        let scheduler = Scheduler::new(4, 0.5);
        scheduler.queue.lock().next_sequence = SEQUENCE_MODULUS - 1;
        scheduler.enqueue(sample(0.0));
        scheduler.enqueue(sample(0.0));
        let ids: Vec<_> = scheduler.take_pending().iter().map(|s| s.sequence_id).collect();
        assert_eq!(ids, vec![Some(SEQUENCE_MODULUS - 1), Some(0)]);
    }

    #[test]
    fn test_single_flight() {
        let scheduler = Scheduler::new(4, 0.5);
        let guard = scheduler.begin_flush();
        assert!(guard.is_some());
        assert!(scheduler.begin_flush().is_none());
        drop(guard);
        assert!(scheduler.begin_flush().is_some());
    }

    #[test]
    fn test_concurrent_producers_keep_every_sample() {
        use std::sync::Arc;
        let scheduler = Arc::new(Scheduler::new(100_000, 0.2));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let scheduler = Arc::clone(&scheduler);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        scheduler.enqueue(sample((t * 1000 + i) as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let taken = scheduler.take_pending();
        assert_eq!(taken.len(), 4000);
        for (i, s) in taken.iter().enumerate() {
            assert_eq!(s.sequence_id, Some(i as u32));
        }
    }
}
