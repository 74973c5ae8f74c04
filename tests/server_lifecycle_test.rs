//! End-to-end lifecycle tests against a real listening socket.

mod common;

use aurora_core::{AuroraError, ServerState};
use aurora_metrics::MetricsStore;
use aurora_server::types::{CreateTableRequest, TableIdentifier, TableMetadata};
use aurora_server::{CatalogBackend, CatalogError, MemoryCatalog, ServerBuilder};
use common::{base_properties, config, get, http_request};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_lifecycle_states() {
    let server = ServerBuilder::new(config(base_properties()))
        .with_name("it-lifecycle")
        .build()
        .unwrap();
    let lifecycle = Arc::clone(server.lifecycle());
    assert_eq!(lifecycle.state(), ServerState::Uninitialized);
    assert!(lifecycle.local_addr().is_none());

    let addr = server.start().unwrap();
    assert_eq!(lifecycle.state(), ServerState::Running);
    assert_eq!(lifecycle.local_addr(), Some(addr));

    let response = get(addr, "/iceberg/v1/config").unwrap();
    assert_eq!(response.status, 200);

    server.stop();
    assert_eq!(lifecycle.state(), ServerState::Stopped);
    assert!(lifecycle.local_addr().is_none());
    assert!(server.metrics().is_closed());

    // second stop is a no-op
    server.stop();
    assert_eq!(lifecycle.state(), ServerState::Stopped);

    let err = server.start().unwrap_err();
    assert!(matches!(err, AuroraError::InvalidStateTransition { .. }), "{err}");

    // the listener is gone
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_blank_keystore_rejected_before_bind() {
    // holding the HTTPS port proves no bind is attempted
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let props = base_properties()
        .with("enable.https", "true")
        .with("https.port", port.to_string())
        .with("keystore.path", "")
        .with("keystore.password", "changeit")
        .with("keystore.manager.password", "changeit");

    let err = ServerBuilder::new(config(props)).build().err().unwrap();
    match err {
        AuroraError::Config(e) => assert_eq!(e.field(), Some("keystore.path")),
        other => panic!("expected configuration error, got {other}"),
    }
}

#[test]
fn test_address_in_use_keeps_server_initialized() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let props = base_properties().with("http.port", port.to_string());
    let server = ServerBuilder::new(config(props)).build().unwrap();

    let err = server.start().unwrap_err();
    assert!(matches!(err, AuroraError::AddressInUse { .. }), "{err}");
    assert!(err.is_transient());
    assert_eq!(server.lifecycle().state(), ServerState::Initialized);

    server.stop();
    assert_eq!(server.lifecycle().state(), ServerState::Stopped);
    assert!(server.metrics().is_closed());
}

#[test]
fn test_stop_before_start_is_noop() {
    let server = ServerBuilder::new(config(base_properties())).build().unwrap();
    server.stop();
    assert_eq!(server.lifecycle().state(), ServerState::Uninitialized);
}

#[test]
fn test_concurrent_requests_with_small_pool() {
    let props = base_properties()
        .with("max.threads", "4")
        .with("thread.pool.work.queue.size", "8")
        .with("thread.pool.admission.timeout", "10000");
    let server = ServerBuilder::new(config(props)).build().unwrap();
    let addr = server.start().unwrap();

    let clients: Vec<_> = (0..50)
        .map(|_| thread::spawn(move || get(addr, "/iceberg/v1/config").map(|r| r.status)))
        .collect();
    let statuses: Vec<u16> = clients
        .into_iter()
        .map(|client| client.join().unwrap().unwrap())
        .collect();
    assert_eq!(statuses.len(), 50);
    assert!(statuses.iter().all(|status| *status == 200), "{statuses:?}");

    let metrics = get(addr, "/metrics").unwrap().json();
    assert_eq!(metrics["routes"]["GET /iceberg/v1/config"]["count"], 50);
    assert!(metrics["gauges"]["thread_pool_threads"].as_f64().unwrap() <= 4.0);

    server.stop();
}

/// Catalog whose listing blocks its worker thread for `delay`.
struct SlowCatalog {
    inner: MemoryCatalog,
    delay: Duration,
    entered: AtomicBool,
}

impl CatalogBackend for SlowCatalog {
    fn name(&self) -> &str {
        "slow"
    }

    fn list_tables(&self, namespace: &[String]) -> Result<Vec<TableIdentifier>, CatalogError> {
        self.entered.store(true, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.list_tables(namespace)
    }

    fn create_table(
        &self,
        namespace: &[String],
        request: CreateTableRequest,
    ) -> Result<(TableIdentifier, TableMetadata), CatalogError> {
        self.inner.create_table(namespace, request)
    }

    fn load_table(&self, id: &TableIdentifier) -> Result<TableMetadata, CatalogError> {
        self.inner.load_table(id)
    }

    fn rename_table(
        &self,
        source: &TableIdentifier,
        destination: &TableIdentifier,
    ) -> Result<(), CatalogError> {
        self.inner.rename_table(source, destination)
    }

    fn drop_table(&self, id: &TableIdentifier, purge: bool) -> Result<bool, CatalogError> {
        self.inner.drop_table(id, purge)
    }
}

#[test]
fn test_stop_is_bounded_with_request_in_flight() {
    let catalog = Arc::new(SlowCatalog {
        inner: MemoryCatalog::new(),
        delay: Duration::from_secs(3),
        entered: AtomicBool::new(false),
    });
    let props = base_properties().with("idle.timeout", "60000");
    let server = ServerBuilder::new(config(props))
        .with_catalog(catalog.clone())
        .build()
        .unwrap();
    let addr = server.start().unwrap();

    // connections that never send a request pin their workers too
    let idle: Vec<TcpStream> = (0..2).map(|_| TcpStream::connect(addr).unwrap()).collect();
    let client = thread::spawn(move || get(addr, "/iceberg/v1/namespaces/db/tables"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !catalog.entered.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(catalog.entered.load(Ordering::SeqCst), "request never reached the catalog");

    let started = Instant::now();
    server.lifecycle().stop_within(Duration::from_millis(500));
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    assert_eq!(server.lifecycle().state(), ServerState::Stopped);

    drop(idle);
    let _ = client.join();
}

#[test]
fn test_start_retries_after_address_in_use() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let props = base_properties().with("http.port", port.to_string());
    let server = ServerBuilder::new(config(props)).build().unwrap();

    let err = server.start().unwrap_err();
    assert!(matches!(err, AuroraError::AddressInUse { .. }), "{err}");
    assert_eq!(server.lifecycle().state(), ServerState::Initialized);

    drop(taken);
    let addr = server.start().unwrap();
    assert_eq!(addr.port(), port);
    assert_eq!(server.lifecycle().state(), ServerState::Running);
    assert_eq!(get(addr, "/iceberg/v1/config").unwrap().status, 200);

    server.stop();
}

#[test]
fn test_join_returns_after_stop() {
    let server = Arc::new(ServerBuilder::new(config(base_properties())).build().unwrap());
    server.start().unwrap();

    let joiner = {
        let lifecycle = Arc::clone(server.lifecycle());
        thread::spawn(move || lifecycle.join())
    };
    thread::sleep(Duration::from_millis(50));
    server.stop();
    joiner.join().unwrap();
}

#[test]
fn test_catalog_and_metrics_endpoints() {
    let props = base_properties()
        .with("custom.filters", "request-id,security-headers")
        .with("catalog.defaults.warehouse", "memory://wh");
    let server = ServerBuilder::new(config(props)).build().unwrap();
    let addr = server.start().unwrap();

    let config = get(addr, "/iceberg/v1/config").unwrap();
    assert_eq!(config.json()["defaults"]["warehouse"], "memory://wh");
    assert!(config.header("x-request-id").is_some());
    assert_eq!(config.header("x-content-type-options"), Some("nosniff"));

    let created = http_request(
        addr,
        "POST",
        "/iceberg/v1/namespaces/db/tables",
        Some(r#"{"name":"orders"}"#),
    )
    .unwrap();
    assert_eq!(created.status, 200, "{}", created.body);
    assert_eq!(created.json()["identifier"]["name"], "orders");

    let listed = get(addr, "/iceberg/v1/namespaces/db/tables").unwrap();
    assert_eq!(listed.json()["identifiers"].as_array().unwrap().len(), 1);

    let missing = get(addr, "/iceberg/v1/namespaces/db/tables/nope").unwrap();
    assert_eq!(missing.status, 404);
    assert!(missing.header("content-type").unwrap().starts_with("application/json"));

    let reported = http_request(
        addr,
        "POST",
        "/iceberg/v1/namespaces/db/tables/orders/metrics",
        Some(r#"{"report-type":"scan-report","snapshot-id":7,"metrics":{"total-files":3}}"#),
    )
    .unwrap();
    assert_eq!(reported.status, 204);

    let prometheus = get(addr, "/prometheus/metrics").unwrap();
    assert_eq!(prometheus.status, 200);
    assert!(prometheus.body.contains("thread_pool_threads"));

    server.stop();

    // close drains the queue into the store
    let events = server.metrics().store().snapshot().unwrap();
    let report = events
        .iter()
        .find(|event| event.name == "iceberg.report.scan-report")
        .expect("report event stored");
    assert_eq!(report.tags["table"], "db.orders");
    assert_eq!(report.tags["snapshot-id"], "7");
    assert_eq!(report.tags["total-files"], "3");
    assert!(events.iter().any(|event| event.name == "http.request"));
}
