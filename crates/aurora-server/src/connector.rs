//! Plain and TLS connectors
//!
//! A [`Connector`] carries the transport settings of the listening socket.
//! `bind` opens the socket; `serve` drives one accepted connection through
//! the optional TLS handshake and HTTP/1.1 until the client closes it or the
//! shutdown token fires.

use crate::tls::build_tls_acceptor;
use aurora_core::config::ServerConfig;
use aurora_core::{AuroraError, Result};
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// hyper refuses read buffers below this size
const MIN_READ_BUFFER: usize = 8192;

pub struct Connector {
    bind_address: String,
    idle_timeout: Duration,
    request_header_size: usize,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("bind_address", &self.bind_address)
            .field("idle_timeout", &self.idle_timeout)
            .field("request_header_size", &self.request_header_size)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Connector {
    /// Builds the connector `config` describes: TLS-terminated when HTTPS is
    /// enabled, plain otherwise. Key material is loaded here.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let tls = match config.tls_material() {
            Some(material) => Some(build_tls_acceptor(material)?),
            None if config.enable_https => {
                return Err(AuroraError::tls("HTTPS enabled without TLS material"))
            }
            None => None,
        };

        Ok(Self {
            bind_address: config.bind_address(),
            idle_timeout: config.idle_timeout,
            request_header_size: config.request_header_size,
            tls,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Opens the listening socket in non-blocking mode.
    pub fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => AuroraError::AddressInUse {
                address: self.bind_address.clone(),
            },
            _ => AuroraError::Io(e),
        })?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Serves one accepted connection. Runs inside a worker's runtime.
    pub async fn serve(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        app: Router,
        shutdown: CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
        }
        let stream = match tokio::net::TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to register connection");
                return;
            }
        };

        match &self.tls {
            None => self.serve_http(stream, remote, app, shutdown).await,
            Some(acceptor) => {
                let handshake = tokio::time::timeout(self.idle_timeout, acceptor.accept(stream));
                let stream = tokio::select! {
                    result = handshake => match result {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            warn!(remote = %remote, error = %e, "TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            warn!(remote = %remote, "TLS handshake timed out");
                            return;
                        }
                    },
                    _ = shutdown.cancelled() => return,
                };
                self.serve_http(stream, remote, app, shutdown).await
            }
        }
    }

    async fn serve_http<S>(
        &self,
        stream: S,
        remote: SocketAddr,
        app: Router,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(remote));
            app.clone().oneshot(request)
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.idle_timeout)
            .max_buf_size(self.request_header_size.max(MIN_READ_BUFFER));

        let connection = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };

        if let Err(e) = result {
            debug!(remote = %remote, error = %e, "Connection closed with error");
        }
    }
}

/// Logs the connector configuration once the socket is bound.
pub(crate) fn log_bound(connector: &Connector, local: SocketAddr) {
    info!(
        scheme = connector.scheme(),
        address = %local,
        idle_timeout_ms = connector.idle_timeout.as_millis() as u64,
        "Connector bound"
    );
}
