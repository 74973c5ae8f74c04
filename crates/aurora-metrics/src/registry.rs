//! Server Metrics Registry
//!
//! Per-server request metrics exposed at `/metrics` (JSON) and
//! `/prometheus/metrics` (Prometheus text). The Prometheus recorder is owned
//! by the registry and used through `metrics::with_local_recorder`, so two
//! servers in one process never share counters.

use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram buckets for request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Reads the current value of a gauge at export time.
pub type GaugeFn = Box<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Default)]
struct RouteStats {
    count: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Per-route figures in the JSON dump
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSnapshot {
    pub count: u64,
    /// Responses with a 5xx status
    pub errors: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// JSON registry dump
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub gauges: BTreeMap<String, f64>,
    pub routes: BTreeMap<String, RouteSnapshot>,
}

/// Metrics registry of one server instance
pub struct ServerMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    routes: DashMap<String, RouteStats>,
    gauges: DashMap<&'static str, GaugeFn>,
    started_at: Instant,
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("routes", &self.routes.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

impl ServerMetrics {
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!("http_requests_total", "Total HTTP requests served");
            describe_histogram!(
                "http_request_duration_seconds",
                "HTTP request latency in seconds"
            );
            describe_gauge!("server_uptime_seconds", "Seconds since the server started");
        });

        Ok(Self {
            recorder,
            handle,
            routes: DashMap::new(),
            gauges: DashMap::new(),
            started_at: Instant::now(),
        })
    }

    /// Registers a gauge sampled on every export. Re-registering a name
    /// replaces the previous reader.
    pub fn register_gauge<F>(&self, name: &'static str, help: &'static str, read: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        metrics::with_local_recorder(&self.recorder, || describe_gauge!(name, help));
        self.gauges.insert(name, Box::new(read));
    }

    /// Records one completed request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        {
            let stats = self.routes.entry(format!("{method} {route}")).or_default();
            stats.count.fetch_add(1, Ordering::Relaxed);
            if status >= 500 {
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            stats.total_micros.fetch_add(micros, Ordering::Relaxed);
            stats.max_micros.fetch_max(micros, Ordering::Relaxed);
        }

        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                "http_requests_total",
                "route" => route.to_owned(),
                "method" => method.to_owned(),
                "status" => status.to_string()
            )
            .increment(1);
            histogram!(
                "http_request_duration_seconds",
                "route" => route.to_owned(),
                "method" => method.to_owned()
            )
            .record(elapsed.as_secs_f64());
        });
    }

    /// Total requests recorded for `method route`.
    pub fn request_count(&self, method: &str, route: &str) -> u64 {
        self.routes
            .get(&format!("{method} {route}"))
            .map(|stats| stats.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn sample_gauges(&self) -> BTreeMap<String, f64> {
        self.gauges
            .iter()
            .map(|entry| ((*entry.key()).to_owned(), (entry.value())()))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self
            .routes
            .iter()
            .map(|entry| {
                let stats = entry.value();
                let count = stats.count.load(Ordering::Relaxed);
                let total = stats.total_micros.load(Ordering::Relaxed);
                let mean_ms = if count > 0 {
                    total as f64 / count as f64 / 1000.0
                } else {
                    0.0
                };
                (
                    entry.key().clone(),
                    RouteSnapshot {
                        count,
                        errors: stats.errors.load(Ordering::Relaxed),
                        mean_ms,
                        max_ms: stats.max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.uptime().as_secs_f64(),
            gauges: self.sample_gauges(),
            routes,
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn render_prometheus(&self) -> String {
        let gauges = self.sample_gauges();
        let uptime = self.uptime().as_secs_f64();
        metrics::with_local_recorder(&self.recorder, || {
            gauge!("server_uptime_seconds").set(uptime);
            for (name, value) in gauges {
                gauge!(name).set(value);
            }
        });
        self.handle.run_upkeep();
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_request("/iceberg/v1/config", "GET", 200, Duration::from_millis(4));
        metrics.record_request("/iceberg/v1/config", "GET", 500, Duration::from_millis(8));

        assert_eq!(metrics.request_count("GET", "/iceberg/v1/config"), 2);
        let snapshot = metrics.snapshot();
        let route = &snapshot.routes["GET /iceberg/v1/config"];
        assert_eq!(route.count, 2);
        assert_eq!(route.errors, 1);
        assert!((route.mean_ms - 6.0).abs() < 0.01);
        assert!((route.max_ms - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_gauges_sampled_on_export() {
        let metrics = ServerMetrics::new().unwrap();
        let value = Arc::new(AtomicU64::new(3));
        let reader = Arc::clone(&value);
        metrics.register_gauge("thread_pool_threads", "Live worker threads", move || {
            reader.load(Ordering::Relaxed) as f64
        });

        assert_eq!(metrics.snapshot().gauges["thread_pool_threads"], 3.0);
        value.store(5, Ordering::Relaxed);
        let text = metrics.render_prometheus();
        assert!(text.contains("thread_pool_threads 5"), "{text}");
    }

    #[test]
    fn test_prometheus_text() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_request("/metrics", "GET", 200, Duration::from_millis(1));
        let text = metrics.render_prometheus();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("route=\"/metrics\""));
        assert!(text.contains("http_request_duration_seconds_bucket"));
        assert!(text.contains("server_uptime_seconds"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = ServerMetrics::new().unwrap();
        let second = ServerMetrics::new().unwrap();
        first.record_request("/a", "GET", 200, Duration::from_millis(1));
        assert!(!second.render_prometheus().contains("route=\"/a\""));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.record_request("/x", "POST", 201, Duration::from_millis(2));
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["routes"]["POST /x"]["count"], 1);
        assert!(json["uptime_seconds"].is_number());
    }
}
