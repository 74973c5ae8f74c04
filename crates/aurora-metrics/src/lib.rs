//! Aurora Metrics
//!
//! The asynchronous metrics pipeline and per-server metrics registry:
//!
//! - [`MetricEvent`]: one recorded observation
//! - [`MetricEventQueue`]: bounded, non-blocking producer/consumer buffer
//! - [`MetricsStore`]: persistence backends (none, memory ring buffer,
//!   JSON-lines file)
//! - [`MetricsRetentionStore`]: consumer and retention threads tying the two
//!   together
//! - [`ServerMetrics`]: request metrics exported as JSON and Prometheus text

pub mod event;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod store;

pub use event::{now_millis, MetricEvent};
pub use queue::{MetricEventQueue, MetricsSink, QueueStats};
pub use registry::{MetricsSnapshot, RouteSnapshot, ServerMetrics};
pub use retention::{MetricsRetentionStore, RetentionStats};
pub use store::{
    open_store, FileMetricsStore, MemoryMetricsStore, MetricsStore, NoopMetricsStore, StoreError,
};
