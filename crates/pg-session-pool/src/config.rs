//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a session pool.
///
/// The configuration is immutable once the pool is constructed.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of sessions the pool keeps open.
    pub min_connections: usize,

    /// Maximum number of sessions the pool may open.
    pub max_connections: usize,

    /// Requests one session is expected to absorb per minute; drives the
    /// adaptive sizing controller.
    pub requests_per_minute_per_connection: u64,

    /// How long a session lives before it is replaced.
    pub connection_lifespan: Duration,

    /// Interval between reconciliation passes.
    pub management_tick_interval: Duration,

    /// Longest query text admitted to the definition registry.
    pub max_query_text_length: usize,

    /// Pool-wide cap on registered query definitions.
    pub max_cached_queries: usize,

    /// Database connection URL.
    pub url: String,

    /// Database user.
    pub user: String,

    /// Database password.
    pub password: String,

    /// Delay before the first validation sweep.
    pub validation_initial_delay: Duration,

    /// Interval between validation sweeps.
    pub validation_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            requests_per_minute_per_connection: 20,
            connection_lifespan: Duration::from_secs(30 * 60),
            management_tick_interval: Duration::from_millis(50),
            max_query_text_length: 2048,
            max_cached_queries: 200,
            url: String::new(),
            user: String::new(),
            password: String::new(),
            validation_initial_delay: Duration::from_secs(5 * 60),
            validation_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the configuration for internally inconsistent values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_connections < 1 {
            return Err(PoolError::Config(
                "min_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.requests_per_minute_per_connection < 1 {
            return Err(PoolError::Config(
                "requests_per_minute_per_connection must be at least 1".to_string(),
            ));
        }
        if self.connection_lifespan.is_zero() {
            return Err(PoolError::Config(
                "connection_lifespan must be non-zero".to_string(),
            ));
        }
        if self.management_tick_interval.is_zero() {
            return Err(PoolError::Config(
                "management_tick_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the per-session request quota used by the sizing controller.
    #[must_use]
    pub fn requests_per_minute_per_connection(mut self, count: u64) -> Self {
        self.requests_per_minute_per_connection = count;
        self
    }

    /// Set the session lifespan.
    #[must_use]
    pub fn connection_lifespan(mut self, lifespan: Duration) -> Self {
        self.connection_lifespan = lifespan;
        self
    }

    /// Set the reconciliation tick interval.
    #[must_use]
    pub fn management_tick_interval(mut self, interval: Duration) -> Self {
        self.management_tick_interval = interval;
        self
    }

    /// Set the longest admissible query text.
    #[must_use]
    pub fn max_query_text_length(mut self, length: usize) -> Self {
        self.max_query_text_length = length;
        self
    }

    /// Set the registry capacity for cached queries.
    #[must_use]
    pub fn max_cached_queries(mut self, count: usize) -> Self {
        self.max_cached_queries = count;
        self
    }

    /// Set the connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the database user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the database password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the delay before the first validation sweep.
    #[must_use]
    pub fn validation_initial_delay(mut self, delay: Duration) -> Self {
        self.validation_initial_delay = delay;
        self
    }

    /// Set the interval between validation sweeps.
    #[must_use]
    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }
}
