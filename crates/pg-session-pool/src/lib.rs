//! # pg-session-pool
//!
//! A self-managing pool of PostgreSQL sessions.
//!
//! Unlike generic object pools, this implementation leans on the server:
//! sessions whose borrowers went quiet are found by reading the server's
//! activity view and reclaimed in place, and each session carries a cache
//! of centrally registered prepared queries across checkouts.
//!
//! ## Features
//!
//! - Adaptive sizing from the observed request rate
//! - Background reconciliation on a fixed tick
//! - Server-side reclamation of forgotten sessions via `pg_stat_activity`
//! - Session lifespans with staggered replacement near expiry
//! - Pool-wide prepared-query registry with per-session caches
//! - Periodic liveness validation of idle sessions
//! - Comprehensive metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use pg_session_pool::{Pool, PoolConfig};
//! use std::collections::HashMap;
//!
//! let config = PoolConfig::new()
//!     .min_connections(2)
//!     .max_connections(10)
//!     .url("postgres://localhost/app")
//!     .user("app")
//!     .password("secret");
//!
//! // Requires the `postgres` feature; any driver backend works via
//! // Pool::new(config, driver).
//! let pool = Pool::connect(config).await?;
//!
//! let mut queries = HashMap::new();
//! queries.insert("find_user".to_string(), "SELECT * FROM users WHERE id = $1".to_string());
//! pool.add_query_definitions(queries)?;
//!
//! let session = pool.borrow_connection().await?;
//! let handle = session.query_handle("find_user").await?;
//! // Execute through the driver's concrete types...
//! session.release().await;
//!
//! pool.shutdown().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod driver;
pub mod error;
pub mod pool;
pub mod prober;
mod sizing;
pub mod statements;
pub mod wrapper;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus};

// Session wrapper and query registry
pub use statements::{QueryDefinition, QueryDefinitions};
pub use wrapper::SessionWrapper;

// Reclamation
pub use prober::{ProbeOutcome, probe};

// Driver seam
pub use driver::{
    ConnectOptions, DbSession, DriverError, PrepareOptions, QueryHandle, SessionDriver,
};

#[cfg(feature = "postgres")]
pub use driver::postgres::PgDriver;
