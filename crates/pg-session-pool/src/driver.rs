//! Driver trait seam between the pool and a database backend.
//!
//! The pool consumes these traits and never implements them itself. The
//! `postgres` feature provides a production backend over `tokio-postgres`;
//! test code supplies in-memory implementations.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Errors raised by a driver backend.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Opening a session failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Preparing a query failed.
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// Executing a query failed.
    #[error("query failed: {0}")]
    Query(String),

    /// Closing a session or handle failed.
    #[error("close failed: {0}")]
    Close(String),
}

/// Options used by a driver to open a database session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Connection URL or key-value connection string.
    pub url: String,
    /// User name presented to the server.
    pub user: String,
    /// Password presented to the server.
    pub password: String,
}

/// Driver-specific options applied when preparing a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareOptions {
    /// Driver-specific statement flag (generated-key retrieval and the like).
    pub flag: i32,
}

/// A backend capable of opening database sessions.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Open a new session against the configured server.
    async fn connect(&self, opts: &ConnectOptions) -> Result<Arc<dyn DbSession>, DriverError>;
}

/// One live database session.
#[async_trait]
pub trait DbSession: Send + Sync {
    /// The server-side process id backing this session.
    async fn backend_pid(&self) -> Result<i32, DriverError>;

    /// Prepare a query for repeated execution.
    async fn prepare(&self, text: &str) -> Result<Arc<dyn QueryHandle>, DriverError>;

    /// Prepare a query with driver-specific options.
    async fn prepare_with(
        &self,
        text: &str,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn QueryHandle>, DriverError>;

    /// Check that the session still answers queries within `timeout`.
    async fn is_valid(&self, timeout: Duration) -> bool;

    /// Close the session.
    async fn close(&self) -> Result<(), DriverError>;

    /// Look up the server-side activity state of the backend with `pid`.
    ///
    /// Returns `None` when the server reports no such backend, or reports
    /// it without a state.
    async fn backend_state(&self, pid: i32) -> Result<Option<String>, DriverError>;

    /// Downcast hook so callers can reach the concrete session type for
    /// query execution.
    fn as_any(&self) -> &dyn Any;
}

/// A prepared query handle cached on a session.
#[async_trait]
pub trait QueryHandle: Send + Sync {
    /// The query text this handle was prepared from.
    fn text(&self) -> &str;

    /// Release the server-side resources behind the handle.
    async fn close(&self) -> Result<(), DriverError>;

    /// Downcast hook to the concrete handle type.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("text", &self.text())
            .finish()
    }
}
