//! Metrics Retention Store
//!
//! Owns the metric event queue and a [`MetricsStore`] backend. A consumer
//! thread drains the queue into the backend in batches; an independent
//! eviction thread periodically removes records older than the retention
//! window. Request threads only ever touch the queue.

use crate::event::{now_millis, MetricEvent};
use crate::queue::{MetricEventQueue, MetricsSink, QueueStats};
use crate::store::{open_store, MetricsStore, StoreError};
use aurora_core::config::MetricsConfig;
use aurora_core::AuroraError;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Events written to the backend per append call
const MAX_BATCH: usize = 256;

/// Retention store statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub queue: QueueStats,
    pub stored: usize,
    pub written: u64,
    pub evicted: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    evicted: AtomicU64,
    write_failures: AtomicU64,
}

struct Workers {
    /// Dropping the sender wakes and stops both threads
    stop: Sender<()>,
    consumer: JoinHandle<()>,
    evictor: Option<JoinHandle<()>>,
}

/// Asynchronous metrics pipeline: bounded queue, consumer, retention sweep.
pub struct MetricsRetentionStore {
    config: MetricsConfig,
    queue: Arc<MetricEventQueue>,
    store: Arc<dyn MetricsStore>,
    counters: Arc<Counters>,
    workers: Mutex<Option<Workers>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MetricsRetentionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRetentionStore")
            .field("store", &self.store.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl MetricsRetentionStore {
    /// Creates the pipeline around an existing backend. Threads are not
    /// started until [`MetricsRetentionStore::start`].
    pub fn new(config: MetricsConfig, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            queue: Arc::new(MetricEventQueue::new(config.queue_capacity)),
            config,
            store,
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Opens the backend named in `config` and wraps it.
    pub fn from_config(config: MetricsConfig) -> Result<Self, AuroraError> {
        config.validate()?;
        let store = open_store(&config.store).map_err(|e| {
            AuroraError::internal(format!("failed to open metrics store: {e}"))
        })?;
        Ok(Self::new(config, store))
    }

    /// Starts the consumer and (when retention is enabled) eviction threads.
    /// Calling it again while running is a no-op.
    pub fn start(&self) -> Result<(), AuroraError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AuroraError::internal("metrics store already closed"));
        }
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let consumer = {
            let queue = Arc::clone(&self.queue);
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            let stop = stop_rx.clone();
            let flush_interval = self.config.flush_interval;
            thread::Builder::new()
                .name("metrics-consumer".to_owned())
                .spawn(move || {
                    run_consumer(&queue, store.as_ref(), &counters, &stop, flush_interval)
                })?
        };

        let evictor = match self.config.retention() {
            Some(window) => {
                let store = Arc::clone(&self.store);
                let counters = Arc::clone(&self.counters);
                let interval = self.config.eviction_interval;
                Some(
                    thread::Builder::new()
                        .name("metrics-evictor".to_owned())
                        .spawn(move || {
                            run_evictor(store.as_ref(), &counters, &stop_rx, window, interval)
                        })?,
                )
            }
            None => None,
        };

        info!(
            store = self.store.name(),
            queue_capacity = self.queue.capacity(),
            retain_days = self.config.retain_days,
            "Metrics pipeline started"
        );

        *workers = Some(Workers {
            stop: stop_tx,
            consumer,
            evictor,
        });
        Ok(())
    }

    /// The handle request handling records through.
    pub fn sink(&self) -> Arc<dyn MetricsSink> {
        Arc::clone(&self.queue) as Arc<dyn MetricsSink>
    }

    pub fn queue(&self) -> &Arc<MetricEventQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    /// Records an event; never blocks.
    pub fn record(&self, event: MetricEvent) -> bool {
        self.queue.offer(event)
    }

    /// Removes records older than the retention window measured from
    /// `now_millis`. Returns 0 when retention is disabled.
    pub fn evict_expired_at(&self, now_millis: i64) -> Result<usize, StoreError> {
        match self.config.retention() {
            Some(window) => {
                let removed = evict(self.store.as_ref(), now_millis, window)?;
                self.counters
                    .evicted
                    .fetch_add(removed as u64, Ordering::Relaxed);
                Ok(removed)
            }
            None => Ok(0),
        }
    }

    /// Writes everything currently queued to the backend.
    pub fn flush(&self) -> usize {
        let deadline = Instant::now() + self.config.close_timeout;
        self.queue.drain_until(deadline, MAX_BATCH, |batch| {
            write_batch(self.store.as_ref(), &self.counters, &batch)
        })
    }

    /// Stops both threads, flushes what is still queued within the close
    /// timeout and closes the backend. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(workers) = self.workers.lock().take() {
            drop(workers.stop);
            if workers.consumer.join().is_err() {
                error!("Metrics consumer thread panicked");
            }
            if let Some(evictor) = workers.evictor {
                if evictor.join().is_err() {
                    error!("Metrics eviction thread panicked");
                }
            }
        }

        let flushed = self.flush();
        if let Err(e) = self.store.close() {
            warn!(store = self.store.name(), error = %e, "Failed to close metrics store");
        }

        let stats = self.stats();
        info!(
            flushed,
            written = stats.written,
            dropped = stats.queue.dropped,
            "Metrics pipeline closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RetentionStats {
        RetentionStats {
            queue: self.queue.stats(),
            stored: self.store.len(),
            written: self.counters.written.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MetricsRetentionStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Err(TryRecvError::Disconnected))
}

fn run_consumer(
    queue: &MetricEventQueue,
    store: &dyn MetricsStore,
    counters: &Counters,
    stop: &Receiver<()>,
    flush_interval: Duration,
) {
    debug!(store = store.name(), "Metrics consumer started");
    while !stop_requested(stop) {
        let batch = queue.recv_batch_or_stop(stop, flush_interval, MAX_BATCH);
        if !batch.is_empty() {
            write_batch(store, counters, &batch);
        }
    }
    debug!("Metrics consumer stopped");
}

fn run_evictor(
    store: &dyn MetricsStore,
    counters: &Counters,
    stop: &Receiver<()>,
    window: Duration,
    interval: Duration,
) {
    debug!(interval_ms = interval.as_millis() as u64, "Metrics eviction started");
    loop {
        match evict(store, now_millis(), window) {
            Ok(0) => {}
            Ok(removed) => {
                counters.evicted.fetch_add(removed as u64, Ordering::Relaxed);
                info!(removed, remaining = store.len(), "Expired metric records evicted");
            }
            Err(e) => warn!(error = %e, "Metric retention sweep failed"),
        }

        // Sleeps for `interval` unless close() drops the sender first
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    debug!("Metrics eviction stopped");
}

fn evict(store: &dyn MetricsStore, now_millis: i64, window: Duration) -> Result<usize, StoreError> {
    let window_millis = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    store.evict_before(now_millis.saturating_sub(window_millis))
}

fn write_batch(store: &dyn MetricsStore, counters: &Counters, batch: &[MetricEvent]) {
    match store.append(batch) {
        Ok(()) => {
            counters
                .written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                store = store.name(),
                events = batch.len(),
                error = %e,
                "Failed to persist metric events"
            );
        }
    }
}
