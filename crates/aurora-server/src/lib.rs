//! # Aurora Server
//!
//! HTTP runtime of the Aurora Iceberg REST catalog: connectors (plain or
//! TLS), the [`ServerLifecycle`] state machine driving a bounded worker pool,
//! the filter chain, and the REST routes that delegate to a
//! [`CatalogBackend`].
//!
//! ## Example
//!
//! ```no_run
//! use aurora_core::IcebergServerConfig;
//! use aurora_server::ServerBuilder;
//!
//! # fn main() -> aurora_core::Result<()> {
//! let config = IcebergServerConfig::load("conf/aurora.yaml")?;
//! let server = ServerBuilder::new(config).build()?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod connector;
pub mod lifecycle;
pub mod middleware;
pub mod rest;
pub mod tls;
pub mod types;

pub use catalog::{open_catalog, CatalogBackend, CatalogError, MemoryCatalog};
pub use connector::Connector;
pub use lifecycle::{ServerLifecycle, ServerServices};
pub use middleware::{FilterChain, FilterParams, FilterRegistry, RequestFilter};

use aurora_core::{IcebergServerConfig, Result, ServerState};
use aurora_metrics::MetricsRetentionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use types::CatalogConfigResponse;

/// Name used in thread names and log lines
pub const SERVER_NAME: &str = "aurora-iceberg-rest";

// ============================================================================
// Server Builder
// ============================================================================

pub struct ServerBuilder {
    config: IcebergServerConfig,
    name: String,
    catalog: Option<Arc<dyn CatalogBackend>>,
    filters: FilterRegistry,
    authenticator: Option<Arc<dyn RequestFilter>>,
}

impl ServerBuilder {
    pub fn new(config: IcebergServerConfig) -> Self {
        Self {
            config,
            name: SERVER_NAME.to_owned(),
            catalog: None,
            filters: FilterRegistry::with_builtins(),
            authenticator: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Uses `catalog` instead of the one named by `catalog-backend`.
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogBackend>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Makes a custom filter available to `custom.filters`.
    pub fn with_filter<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(
                &FilterParams,
            ) -> std::result::Result<Arc<dyn RequestFilter>, aurora_core::ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.filters.register(name, factory);
        self
    }

    /// Installs the authentication filter, which runs ahead of the metrics
    /// filter.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn RequestFilter>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Build the server
    pub fn build(self) -> Result<IcebergRestServer> {
        self.config.validate()?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => open_catalog(&self.config.catalog_backend)?,
        };
        let metrics = Arc::new(MetricsRetentionStore::from_config(self.config.metrics.clone())?);

        let catalog_config = CatalogConfigResponse {
            defaults: self.config.properties.with_prefix("catalog.defaults."),
            overrides: self.config.properties.with_prefix("catalog.overrides."),
        };

        info!(
            server = %self.name,
            catalog = catalog.name(),
            metrics_store = %self.config.metrics.store,
            "Built server"
        );

        let services = ServerServices {
            catalog,
            metrics,
            filters: self.filters,
            authenticator: self.authenticator,
            catalog_config,
        };

        Ok(IcebergRestServer {
            lifecycle: Arc::new(ServerLifecycle::new(self.name)),
            config: self.config,
            services,
        })
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct IcebergRestServer {
    config: IcebergServerConfig,
    lifecycle: Arc<ServerLifecycle>,
    services: ServerServices,
}

impl IcebergRestServer {
    pub fn config(&self) -> &IcebergServerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<ServerLifecycle> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<MetricsRetentionStore> {
        &self.services.metrics
    }

    /// Initializes (once) and starts the server; returns the bound address.
    /// After an `AddressInUse` failure the server stays initialized and
    /// `start` can be retried.
    pub fn start(&self) -> Result<SocketAddr> {
        if self.lifecycle.state() == ServerState::Uninitialized {
            self.lifecycle
                .initialize(self.config.server.clone(), self.services.clone())?;
        }
        self.lifecycle.start()
    }

    /// Stops the server and closes the catalog.
    pub fn stop(&self) {
        self.lifecycle.stop();
        self.services.catalog.close();
    }

    /// Runs until SIGINT/SIGTERM, then stops within `server.shutdown.timeout`.
    pub fn run(self) -> Result<()> {
        self.start()?;

        let released = CancellationToken::new();
        let watcher = {
            let lifecycle = Arc::clone(&self.lifecycle);
            let released = released.clone();
            let grace = self.config.shutdown_timeout;
            thread::Builder::new()
                .name(format!("{}-signals", lifecycle.name()))
                .spawn(move || watch_signals(&lifecycle, &released, grace))?
        };

        self.lifecycle.join();
        released.cancel();
        if watcher.join().is_err() {
            error!("Signal watcher panicked");
        }

        self.stop();
        info!("Server shutdown complete");
        Ok(())
    }
}

fn watch_signals(lifecycle: &ServerLifecycle, released: &CancellationToken, grace: Duration) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build signal runtime; signals will not stop the server");
            return;
        }
    };

    let signalled = runtime.block_on(async {
        tokio::select! {
            _ = shutdown_signal() => true,
            _ = released.cancelled() => false,
        }
    });
    if signalled {
        lifecycle.stop_within(grace);
    }
}

// ============================================================================
// Graceful Shutdown
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
