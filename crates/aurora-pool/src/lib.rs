//! Aurora Worker Pool
//!
//! A bounded pool of native worker threads used by the HTTP server to
//! serve accepted connections. Each worker drives one connection future at
//! a time on its own single-threaded tokio runtime; the pool applies
//! admission control through a bounded queue.
//!
//! # Example
//!
//! ```
//! use aurora_pool::{Admission, BoundedThreadPool, PoolConfig};
//! use std::time::Duration;
//!
//! let pool = BoundedThreadPool::new(PoolConfig {
//!     min_threads: 1,
//!     max_threads: 2,
//!     queue_capacity: 4,
//!     ..PoolConfig::default()
//! })
//! .unwrap();
//!
//! pool.submit(Box::pin(async {}), Admission::Reject).unwrap();
//! assert!(pool.shutdown(Duration::from_secs(1)));
//! ```

pub mod pool;

pub use pool::{Admission, BoundedThreadPool, PoolConfig, PoolError, PoolStats, Task};
