//! Pool-level error types.

use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

/// Errors that can occur while operating the session pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A new session could not be established or identified.
    #[error("failed to establish database session: {source}")]
    EstablishFailed {
        /// The driver failure that prevented establishment.
        source: DriverError,
    },

    /// An empty key was passed to the query-handle cache.
    #[error("query cache key is empty")]
    NullKey,

    /// No session became available before the borrow deadline.
    #[error("no session available after waiting {waited:?}")]
    PoolExhausted {
        /// Total time spent waiting across both borrow attempts.
        waited: Duration,
    },

    /// A definition batch would push the registry past its capacity.
    #[error(
        "query definition batch rejected: {requested} new definitions, \
         {registered} already registered, capacity {capacity}"
    )]
    DefinitionsRejected {
        /// New definitions the batch would have added.
        requested: usize,
        /// Pool-wide registry capacity.
        capacity: usize,
        /// Definitions registered before the batch.
        registered: usize,
    },

    /// One or more sub-resources failed while closing a session.
    ///
    /// Every cached handle and the session itself are always attempted;
    /// the most recent failure is carried here.
    #[error("session closed with errors: {source}")]
    CloseAggregate {
        /// The most recent sub-close failure.
        source: DriverError,
    },

    /// The pool has been shut down.
    #[error("pool is closed")]
    PoolClosed,

    /// Invalid pool configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A driver error surfaced through a pool operation.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}
