//! PostgreSQL driver backend over `tokio-postgres`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Statement};

use super::{ConnectOptions, DbSession, DriverError, PrepareOptions, QueryHandle, SessionDriver};

const BACKEND_PID_QUERY: &str = "SELECT pg_backend_pid()";
const BACKEND_STATE_QUERY: &str = "SELECT state FROM pg_stat_activity WHERE pid = $1";
const LIVENESS_QUERY: &str = "SELECT 1";

/// Driver backend connecting over `tokio-postgres`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl PgDriver {
    /// Create a new driver instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionDriver for PgDriver {
    async fn connect(&self, opts: &ConnectOptions) -> Result<Arc<dyn DbSession>, DriverError> {
        let mut config: tokio_postgres::Config = opts
            .url
            .parse()
            .map_err(|e: tokio_postgres::Error| DriverError::Connect(e.to_string()))?;
        if !opts.user.is_empty() {
            config.user(&opts.user);
        }
        if !opts.password.is_empty() {
            config.password(&opts.password);
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        // The connection object drives the socket; it must be polled for
        // the client to make progress.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "postgres connection task terminated");
            }
        });

        Ok(Arc::new(PgSession { client }))
    }
}

/// A live PostgreSQL session.
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Access the underlying client, typically after an `as_any` downcast.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl DbSession for PgSession {
    async fn backend_pid(&self) -> Result<i32, DriverError> {
        let row = self
            .client
            .query_one(BACKEND_PID_QUERY, &[])
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        row.try_get(0).map_err(|e| DriverError::Query(e.to_string()))
    }

    async fn prepare(&self, text: &str) -> Result<Arc<dyn QueryHandle>, DriverError> {
        let statement = self
            .client
            .prepare(text)
            .await
            .map_err(|e| DriverError::Prepare(e.to_string()))?;
        Ok(Arc::new(PgQueryHandle {
            text: text.to_string(),
            statement,
        }))
    }

    async fn prepare_with(
        &self,
        text: &str,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn QueryHandle>, DriverError> {
        // tokio-postgres has no per-statement driver flags.
        tracing::trace!(flag = options.flag, "prepare flag ignored by postgres backend");
        self.prepare(text).await
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.client.simple_query(LIVENESS_QUERY)).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> Result<(), DriverError> {
        // The client tears down its socket when the last reference drops.
        Ok(())
    }

    async fn backend_state(&self, pid: i32) -> Result<Option<String>, DriverError> {
        let row = self
            .client
            .query_opt(BACKEND_STATE_QUERY, &[&pid])
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => row.try_get(0).map_err(|e| DriverError::Query(e.to_string())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A prepared statement handle backed by `tokio-postgres`.
pub struct PgQueryHandle {
    text: String,
    statement: Statement,
}

impl PgQueryHandle {
    /// Access the prepared statement for execution.
    #[must_use]
    pub fn statement(&self) -> &Statement {
        &self.statement
    }
}

#[async_trait]
impl QueryHandle for PgQueryHandle {
    fn text(&self) -> &str {
        &self.text
    }

    async fn close(&self) -> Result<(), DriverError> {
        // Statements are deallocated server-side when dropped.
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
