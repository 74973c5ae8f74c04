//! Server Lifecycle
//!
//! `Uninitialized -> Initialized -> Running -> Stopped`. `initialize` builds
//! the connector, the worker pool, the metrics registry and the route table;
//! `start` binds the socket and spawns the acceptor thread; `stop` tears
//! everything down in order. Every accepted connection is handed to the pool
//! with blocking-with-timeout admission.

use crate::catalog::CatalogBackend;
use crate::connector::{log_bound, Connector};
use crate::middleware::{FilterRegistry, RequestFilter};
use crate::rest::{create_app, AppFilters, AppState};
use crate::types::CatalogConfigResponse;
use aurora_core::config::ServerConfig;
use aurora_core::{AuroraError, Result, ServerState};
use aurora_metrics::{MetricsRetentionStore, ServerMetrics};
use aurora_pool::{Admission, BoundedThreadPool, PoolConfig, Task};
use axum::Router;
use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Workers above `min_threads` exit after this long without work
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Back-off after a failed `accept`
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Collaborators injected at initialization
#[derive(Clone)]
pub struct ServerServices {
    pub catalog: Arc<dyn CatalogBackend>,
    pub metrics: Arc<MetricsRetentionStore>,
    pub filters: FilterRegistry,
    /// Runs ahead of the metrics filter when present
    pub authenticator: Option<Arc<dyn RequestFilter>>,
    /// Served at `GET /iceberg/v1/config`
    pub catalog_config: CatalogConfigResponse,
}

impl ServerServices {
    pub fn new(catalog: Arc<dyn CatalogBackend>, metrics: Arc<MetricsRetentionStore>) -> Self {
        Self {
            catalog,
            metrics,
            filters: FilterRegistry::with_builtins(),
            authenticator: None,
            catalog_config: CatalogConfigResponse::default(),
        }
    }
}

struct Acceptor {
    shutdown: CancellationToken,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Everything built by `initialize`
struct Resources {
    config: ServerConfig,
    pool: Arc<BoundedThreadPool>,
    connector: Arc<Connector>,
    app: Router,
    metrics: Arc<MetricsRetentionStore>,
    server_metrics: Arc<ServerMetrics>,
    acceptor: Option<Acceptor>,
}

struct Inner {
    state: ServerState,
    resources: Option<Resources>,
}

pub struct ServerLifecycle {
    name: String,
    inner: Mutex<Inner>,
    state_changed: Condvar,
}

impl std::fmt::Debug for ServerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: ServerState::Uninitialized,
                resources: None,
            }),
            state_changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    /// Address the acceptor is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .resources
            .as_ref()
            .and_then(|r| r.acceptor.as_ref())
            .map(|a| a.local_addr)
    }

    /// Request metrics registry, once initialized.
    pub fn server_metrics(&self) -> Option<Arc<ServerMetrics>> {
        self.inner
            .lock()
            .resources
            .as_ref()
            .map(|r| Arc::clone(&r.server_metrics))
    }

    /// Validates `config` and builds the connector, worker pool, route table
    /// and filter chain, then starts the metrics consumer. No socket is
    /// opened.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless uninitialized; `Config` or
    /// `TlsConfiguration` on bad configuration.
    pub fn initialize(&self, config: ServerConfig, services: ServerServices) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Uninitialized {
            return Err(AuroraError::invalid_transition(inner.state, "initialize"));
        }

        config.validate()?;
        let connector = Arc::new(Connector::from_config(&config)?);
        let custom = services
            .filters
            .build_chain(&config.custom_filters, &config.filter_params)?;

        let pool = Arc::new(BoundedThreadPool::new(PoolConfig {
            name: format!("{}-worker", self.name),
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            queue_capacity: config.work_queue_size,
            idle_timeout: WORKER_IDLE_TIMEOUT,
        })?);

        let server_metrics = match ServerMetrics::new() {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                pool.shutdown(Duration::ZERO);
                return Err(AuroraError::internal(format!(
                    "failed to build metrics registry: {e}"
                )));
            }
        };
        register_gauges(&server_metrics, &pool, &services.metrics);

        let state = AppState {
            catalog: services.catalog,
            sink: services.metrics.sink(),
            server_metrics: Arc::clone(&server_metrics),
            catalog_config: Arc::new(services.catalog_config),
        };
        let filters = AppFilters {
            authenticator: services.authenticator,
            custom,
            response_header_size: config.response_header_size,
        };
        let app = create_app(state, filters);

        if let Err(e) = services.metrics.start() {
            pool.shutdown(Duration::ZERO);
            return Err(e);
        }

        info!(
            server = %self.name,
            scheme = connector.scheme(),
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            queue = config.work_queue_size,
            filters = ?config.custom_filters,
            "Server initialized"
        );

        inner.resources = Some(Resources {
            config,
            pool,
            connector,
            app,
            metrics: services.metrics,
            server_metrics,
            acceptor: None,
        });
        inner.state = ServerState::Initialized;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless initialized; `AddressInUse` when the
    /// port is taken, in which case the server stays initialized.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Initialized {
            return Err(AuroraError::invalid_transition(inner.state, "start"));
        }
        let resources = inner
            .resources
            .as_mut()
            .ok_or_else(|| AuroraError::internal("initialized server without resources"))?;

        let listener = resources.connector.bind()?;
        let local_addr = listener.local_addr()?;
        log_bound(&resources.connector, local_addr);

        let shutdown = CancellationToken::new();
        let acceptor = AcceptLoop {
            pool: Arc::clone(&resources.pool),
            connector: Arc::clone(&resources.connector),
            app: resources.app.clone(),
            shutdown: shutdown.clone(),
            admission_timeout: resources.config.admission_timeout,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-acceptor", self.name))
            .spawn(move || acceptor.run(listener))?;

        resources.acceptor = Some(Acceptor {
            shutdown,
            thread,
            local_addr,
        });

        info!(
            "{} web server started on host {} port {}",
            self.name,
            resources.config.host,
            local_addr.port()
        );
        if !resources.connector.is_tls() {
            warn!("HTTPS is disabled; traffic is not encrypted");
        }

        inner.state = ServerState::Running;
        self.state_changed.notify_all();
        Ok(local_addr)
    }

    /// Blocks until the server leaves the running state.
    pub fn join(&self) {
        let mut inner = self.inner.lock();
        while inner.state == ServerState::Running {
            self.state_changed.wait(&mut inner);
        }
    }

    /// Stops with the configured stop timeout.
    pub fn stop(&self) {
        let timeout = self
            .inner
            .lock()
            .resources
            .as_ref()
            .map(|r| r.config.stop_timeout)
            .unwrap_or_default();
        self.stop_within(timeout);
    }

    /// Stops accepting, drains the pool for up to `timeout`, closes the
    /// metrics consumer and releases the socket. Idempotent; a no-op before
    /// initialization.
    pub fn stop_within(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        match inner.state {
            ServerState::Uninitialized | ServerState::Stopped => {
                debug!(server = %self.name, state = %inner.state, "Stop ignored");
                return;
            }
            ServerState::Initialized | ServerState::Running => {}
        }

        let started = Instant::now();
        info!(server = %self.name, timeout_ms = timeout.as_millis() as u64, "Stopping server");

        if let Some(mut resources) = inner.resources.take() {
            let acceptor = resources.acceptor.take();

            // 1. stop accepting; live connections finish their current request
            if let Some(acceptor) = &acceptor {
                acceptor.shutdown.cancel();
            }

            // 2. drain the pool
            if !resources.pool.shutdown(timeout) {
                warn!(
                    server = %self.name,
                    "Stop timeout elapsed, in-flight requests were cancelled"
                );
            }

            // 3. metrics consumer
            resources.metrics.close();

            // 4. listening socket
            if let Some(acceptor) = acceptor {
                if acceptor.thread.join().is_err() {
                    error!(server = %self.name, "Acceptor thread panicked");
                }
            }
        }

        inner.state = ServerState::Stopped;
        self.state_changed.notify_all();
        info!(
            server = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Server stopped"
        );
    }

    /// Returns a stopped server to `Uninitialized` so it can be initialized
    /// again with fresh services.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Stopped {
            return Err(AuroraError::invalid_transition(inner.state, "reset"));
        }
        inner.state = ServerState::Uninitialized;
        self.state_changed.notify_all();
        Ok(())
    }
}

impl Drop for ServerLifecycle {
    fn drop(&mut self) {
        self.stop_within(Duration::ZERO);
    }
}

fn register_gauges(
    metrics: &ServerMetrics,
    pool: &Arc<BoundedThreadPool>,
    pipeline: &Arc<MetricsRetentionStore>,
) {
    let gauges: [(&'static str, &'static str, fn(&BoundedThreadPool) -> f64); 5] = [
        ("thread_pool_threads", "Live worker threads", |p| p.stats().threads as f64),
        ("thread_pool_active", "Workers running a connection", |p| p.stats().active as f64),
        ("thread_pool_queued", "Connections waiting for a worker", |p| p.stats().queued as f64),
        ("thread_pool_rejected_total", "Connections refused by admission control", |p| {
            p.stats().rejected as f64
        }),
        ("thread_pool_panicked_total", "Tasks that panicked", |p| p.stats().panicked as f64),
    ];
    for (name, help, read) in gauges {
        let pool = Arc::clone(pool);
        metrics.register_gauge(name, help, move || read(&pool));
    }

    let queue = Arc::clone(pipeline.queue());
    metrics.register_gauge("metrics_queue_depth", "Metric events awaiting the consumer", move || {
        queue.len() as f64
    });
    let queue = Arc::clone(pipeline.queue());
    metrics.register_gauge(
        "metrics_events_dropped_total",
        "Metric events dropped on a full queue",
        move || queue.dropped_count() as f64,
    );
    let store = Arc::clone(pipeline.store());
    metrics.register_gauge("metrics_events_stored", "Metric events held by the store", move || {
        store.len() as f64
    });
}

// ============================================================================
// Accept Loop
// ============================================================================

struct AcceptLoop {
    pool: Arc<BoundedThreadPool>,
    connector: Arc<Connector>,
    app: Router,
    shutdown: CancellationToken,
    admission_timeout: Duration,
}

impl AcceptLoop {
    fn run(self, listener: std::net::TcpListener) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Failed to build acceptor runtime");
                return;
            }
        };
        runtime.block_on(self.accept(listener));
    }

    async fn accept(self, listener: std::net::TcpListener) {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to register listening socket");
                return;
            }
        };
        debug!("Accept loop started");

        loop {
            let (stream, remote) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Failed to detach connection");
                    continue;
                }
            };

            let connector = Arc::clone(&self.connector);
            let app = self.app.clone();
            let shutdown = self.shutdown.clone();
            let task: Task = Box::pin(async move {
                connector.serve(stream, remote, app, shutdown).await;
            });

            // Blocks this thread for at most the admission timeout
            if let Err(e) = self.pool.submit(task, Admission::Block(self.admission_timeout)) {
                warn!(remote = %remote, error = %e, "Connection refused");
            }
        }

        debug!("Accept loop stopped");
    }
}
