//! Bounded Metric Event Queue
//!
//! Multi-producer buffer between request-serving threads and the metrics
//! consumer. Producers never block: when the queue is full the newest event
//! is dropped and counted.

use crate::event::MetricEvent;
use flume::{Receiver, RecvTimeoutError, Selector, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle through which request handling records metric events.
pub trait MetricsSink: Send + Sync {
    /// Records an event without blocking. Returns false if it was dropped.
    fn record(&self, event: MetricEvent) -> bool;
}

/// Queue statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub accepted: u64,
    pub dropped: u64,
}

/// Bounded FIFO of metric events.
#[derive(Debug)]
pub struct MetricEventQueue {
    tx: Sender<MetricEvent>,
    rx: Receiver<MetricEvent>,
    capacity: usize,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl MetricEventQueue {
    /// Creates a queue holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offers an event. Returns false if the queue was full.
    pub fn offer(&self, event: MetricEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Log the first drop and then every thousandth
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        capacity = self.capacity,
                        dropped,
                        metric = %event.name,
                        "Metric event queue full, dropping events"
                    );
                }
                false
            }
            // Unreachable while `self.rx` is alive
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Removes and returns everything currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<MetricEvent> {
        self.rx.drain().collect()
    }

    /// Waits up to `max_wait` for the first event, then takes whatever else
    /// is queued, up to `max_batch` events in total.
    pub fn recv_batch(&self, max_wait: Duration, max_batch: usize) -> Vec<MetricEvent> {
        match self.rx.recv_timeout(max_wait) {
            Ok(first) => self.fill_batch(first, max_batch),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    /// Like [`recv_batch`](Self::recv_batch), but returns an empty batch as
    /// soon as `stop` receives a message or is disconnected.
    pub fn recv_batch_or_stop(
        &self,
        stop: &Receiver<()>,
        max_wait: Duration,
        max_batch: usize,
    ) -> Vec<MetricEvent> {
        let first = Selector::new()
            .recv(&self.rx, |event| event.ok())
            .recv(stop, |_| None)
            .wait_timeout(max_wait)
            .ok()
            .flatten();
        match first {
            Some(first) => self.fill_batch(first, max_batch),
            None => Vec::new(),
        }
    }

    fn fill_batch(&self, first: MetricEvent, max_batch: usize) -> Vec<MetricEvent> {
        let mut batch = Vec::with_capacity(max_batch.clamp(1, self.capacity));
        batch.push(first);
        while batch.len() < max_batch {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    /// Drains in batches until the queue is empty or `deadline` passes.
    pub fn drain_until<F>(&self, deadline: Instant, max_batch: usize, mut sink: F) -> usize
    where
        F: FnMut(Vec<MetricEvent>),
    {
        let mut total = 0;
        while Instant::now() < deadline {
            let batch: Vec<_> = self.rx.try_iter().take(max_batch.max(1)).collect();
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            sink(batch);
        }
        let left = self.rx.len();
        if left > 0 {
            debug!(left, "Final metrics flush ran out of time");
        }
        total
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.rx.len(),
            capacity: self.capacity,
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for MetricEventQueue {
    fn record(&self, event: MetricEvent) -> bool {
        self.offer(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn event(i: i64) -> MetricEvent {
        MetricEvent::at(i, "test")
    }

    #[test]
    fn test_fifo_order() {
        let queue = MetricEventQueue::new(10);
        for i in 0..5 {
            assert!(queue.offer(event(i)));
        }
        let drained: Vec<i64> = queue.drain().iter().map(|e| e.timestamp_millis).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offers_never_block_when_full() {
        let queue = MetricEventQueue::new(100);
        let started = Instant::now();
        let accepted = (0..10_000).filter(|i| queue.offer(event(*i))).count();
        let elapsed = started.elapsed();

        assert_eq!(accepted, 100);
        assert_eq!(queue.dropped_count(), 9_900);
        assert_eq!(queue.len(), 100);
        assert!(elapsed < Duration::from_secs(1), "offers took {elapsed:?}");

        // Oldest events are kept
        let drained = queue.drain();
        assert_eq!(drained.first().map(|e| e.timestamp_millis), Some(0));
        assert_eq!(drained.last().map(|e| e.timestamp_millis), Some(99));
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(MetricEventQueue::new(1000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..500 {
                        queue.record(event(p * 1000 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.accepted + stats.dropped, 2000);
        assert_eq!(stats.accepted, 1000);
        assert_eq!(stats.len, 1000);
    }

    #[test]
    fn test_recv_batch() {
        let queue = MetricEventQueue::new(10);
        assert!(queue
            .recv_batch(Duration::from_millis(10), 4)
            .is_empty());

        for i in 0..6 {
            queue.offer(event(i));
        }
        assert_eq!(queue.recv_batch(Duration::from_millis(10), 4).len(), 4);
        assert_eq!(queue.recv_batch(Duration::from_millis(10), 4).len(), 2);
    }

    #[test]
    fn test_recv_batch_or_stop() {
        let queue = MetricEventQueue::new(10);
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        queue.offer(event(1));
        queue.offer(event(2));
        assert_eq!(
            queue.recv_batch_or_stop(&stop_rx, Duration::from_secs(5), 4).len(),
            2
        );

        drop(stop_tx);
        let started = Instant::now();
        assert!(queue
            .recv_batch_or_stop(&stop_rx, Duration::from_secs(5), 4)
            .is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_drain_until() {
        let queue = MetricEventQueue::new(10);
        for i in 0..7 {
            queue.offer(event(i));
        }
        let mut batches = Vec::new();
        let total = queue.drain_until(Instant::now() + Duration::from_secs(1), 3, |batch| {
            batches.push(batch.len())
        });
        assert_eq!(total, 7);
        assert_eq!(batches, vec![3, 3, 1]);
    }
}
