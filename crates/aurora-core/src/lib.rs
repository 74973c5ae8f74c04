//! # Aurora Core
//!
//! Shared foundations for the Aurora Iceberg REST server:
//!
//! - **Errors**: [`AuroraError`] for runtime failures and [`ConfigError`] for
//!   configuration problems, both built on `thiserror`.
//! - **Configuration**: typed configuration entries read from a flat
//!   [`config::Properties`] map, with the [`ServerConfig`], [`MetricsConfig`]
//!   and [`IcebergServerConfig`] views and their validation.
//! - **Types**: the [`ServerState`] lifecycle enum.
//!
//! ## Example
//!
//! ```
//! use aurora_core::config::ServerConfig;
//!
//! let config = ServerConfig {
//!     host: "127.0.0.1".to_owned(),
//!     http_port: 0,
//!     min_threads: 2,
//!     max_threads: 8,
//!     ..ServerConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    IcebergServerConfig, KeyStoreType, MetricsConfig, MetricsStoreKind, ServerConfig, TlsMaterial,
};
pub use error::{AuroraError, ConfigError, Result};
pub use types::ServerState;
