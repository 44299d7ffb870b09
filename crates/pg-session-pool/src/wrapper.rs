//! The session wrapper: one pooled database session and its caches.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::driver::{
    ConnectOptions, DbSession, DriverError, PrepareOptions, QueryHandle, SessionDriver,
};
use crate::error::PoolError;
use crate::statements::QueryDefinitions;

/// Sessions whose remaining lifetime drops below this window become
/// eligible for staggered replacement ahead of their hard expiry.
pub(crate) const REPLACEMENT_GRACE: Duration = Duration::from_secs(120);

/// One pooled session: the live connection, its backend process id, and
/// the prepared-handle caches tied to its lifetime.
///
/// The wrapper is handed to borrowers as an `Arc`; the pool retains its
/// own reference and ultimate closing authority.
pub struct SessionWrapper {
    id: u64,
    session: Arc<dyn DbSession>,
    backend_pid: i32,
    expires_at: Instant,
    in_use: AtomicBool,
    queued: AtomicBool,
    closed: AtomicBool,
    registered: Mutex<HashMap<String, Arc<dyn QueryHandle>>>,
    ephemeral: Mutex<HashMap<String, Arc<dyn QueryHandle>>>,
}

impl SessionWrapper {
    /// Open a session, resolve its backend process id, and seed it with
    /// the registered query definitions.
    ///
    /// A session whose backend id cannot be retrieved is closed and the
    /// failure surfaces as [`PoolError::EstablishFailed`].
    pub async fn establish(
        driver: &Arc<dyn SessionDriver>,
        opts: &ConnectOptions,
        id: u64,
        lifespan: Duration,
        definitions: Option<&QueryDefinitions>,
    ) -> Result<Arc<Self>, PoolError> {
        let session = driver
            .connect(opts)
            .await
            .map_err(|source| PoolError::EstablishFailed { source })?;

        let backend_pid = match session.backend_pid().await {
            Ok(pid) => pid,
            Err(source) => {
                if let Err(e) = session.close().await {
                    tracing::debug!(error = %e, "failed to close unidentified session");
                }
                return Err(PoolError::EstablishFailed { source });
            }
        };

        let wrapper = Arc::new(Self {
            id,
            session,
            backend_pid,
            expires_at: Instant::now() + lifespan,
            in_use: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            registered: Mutex::new(HashMap::new()),
            ephemeral: Mutex::new(HashMap::new()),
        });

        if let Some(defs) = definitions {
            wrapper.adopt_definitions(defs).await;
        }

        tracing::debug!(wrapper = id, backend_pid, "session established");
        Ok(wrapper)
    }

    /// Take exclusive use of the session.
    ///
    /// Returns `None` when the wrapper is closed or already lent out.
    /// Never blocks.
    pub fn borrow(&self) -> Option<Arc<dyn DbSession>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(self.session.clone())
        } else {
            None
        }
    }

    /// Return the session to the pool.
    ///
    /// Handles prepared ad hoc during the borrow are closed and dropped;
    /// only registered definitions outlive a checkout.
    pub async fn release(&self) {
        let drained: Vec<(String, Arc<dyn QueryHandle>)> =
            self.ephemeral.lock().drain().collect();
        for (key, handle) in drained {
            if let Err(e) = handle.close().await {
                tracing::debug!(wrapper = self.id, key = %key, error = %e, "failed to close ad-hoc handle");
            }
        }
        self.in_use.store(false, Ordering::Release);
    }

    /// Fetch a prepared handle for `key`.
    ///
    /// Registered keys resolve to the permanent cache. Anything else is
    /// treated as query text, prepared on the live session, and cached
    /// until [`release`](Self::release).
    pub async fn query_handle(&self, key: &str) -> Result<Arc<dyn QueryHandle>, PoolError> {
        self.handle_for(key, None).await
    }

    /// Like [`query_handle`](Self::query_handle), with driver prepare
    /// options applied to ad-hoc preparation.
    pub async fn query_handle_with(
        &self,
        key: &str,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn QueryHandle>, PoolError> {
        self.handle_for(key, Some(options)).await
    }

    async fn handle_for(
        &self,
        key: &str,
        options: Option<&PrepareOptions>,
    ) -> Result<Arc<dyn QueryHandle>, PoolError> {
        if key.is_empty() {
            return Err(PoolError::NullKey);
        }
        if let Some(handle) = self.registered.lock().get(key) {
            return Ok(handle.clone());
        }
        if let Some(handle) = self.ephemeral.lock().get(key) {
            return Ok(handle.clone());
        }

        let handle = match options {
            Some(opts) => self.session.prepare_with(key, opts).await?,
            None => self.session.prepare(key).await?,
        };
        Ok(self
            .ephemeral
            .lock()
            .entry(key.to_string())
            .or_insert(handle)
            .clone())
    }

    /// Prepare and permanently cache every registered definition missing
    /// from this session's cache. Individual failures are logged and
    /// skipped. Returns the number of definitions adopted.
    pub async fn adopt_definitions(&self, definitions: &QueryDefinitions) -> usize {
        let mut adopted = 0;
        for (key, def) in definitions.snapshot() {
            if self.registered.lock().contains_key(&key) {
                continue;
            }
            let result = match def.flag {
                Some(flag) => {
                    self.session
                        .prepare_with(&def.text, &PrepareOptions { flag })
                        .await
                }
                None => self.session.prepare(&def.text).await,
            };
            match result {
                Ok(handle) => {
                    self.registered.lock().entry(key).or_insert(handle);
                    adopted += 1;
                }
                Err(e) => {
                    tracing::warn!(wrapper = self.id, key = %key, error = %e, "failed to prepare registered query");
                }
            }
        }
        adopted
    }

    /// Number of registered definitions cached on this session.
    #[must_use]
    pub fn cached_statement_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Whether the session has outlived its configured lifespan.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// The instant at which the session expires.
    #[must_use]
    pub fn expiration(&self) -> Instant {
        self.expires_at
    }

    /// Whether the session's remaining lifetime still exceeds the
    /// replacement grace window.
    #[must_use]
    pub fn within_replacement_grace(&self) -> bool {
        Instant::now() + REPLACEMENT_GRACE < self.expires_at
    }

    /// Probe the session for liveness. Failures are logged, never raised.
    pub async fn validate(&self, timeout: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let valid = self.session.is_valid(timeout).await;
        if !valid {
            tracing::warn!(
                wrapper = self.id,
                backend_pid = self.backend_pid,
                "session failed validation"
            );
        }
        valid
    }

    /// Close the session and every cached handle.
    ///
    /// Idempotent: the second and later calls return `Ok` without doing
    /// further work. Every sub-close is attempted regardless of earlier
    /// failures; the most recent failure is surfaced as
    /// [`PoolError::CloseAggregate`].
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut last_err: Option<DriverError> = None;

        let mut handles: Vec<Arc<dyn QueryHandle>> =
            self.registered.lock().drain().map(|(_, h)| h).collect();
        handles.extend(self.ephemeral.lock().drain().map(|(_, h)| h));
        for handle in handles {
            if let Err(e) = handle.close().await {
                last_err = Some(e);
            }
        }

        if let Err(e) = self.session.close().await {
            last_err = Some(e);
        }

        tracing::debug!(wrapper = self.id, backend_pid = self.backend_pid, "session closed");
        match last_err {
            None => Ok(()),
            Some(source) => Err(PoolError::CloseAggregate { source }),
        }
    }

    /// The wrapper's pool-local id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The server-side process id backing this session.
    #[must_use]
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Whether the session is currently lent out.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The live session behind this wrapper.
    ///
    /// Borrowers holding the wrapper use this to execute queries, usually
    /// via the driver's `as_any` downcast.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn DbSession> {
        &self.session
    }

    pub(crate) fn mark_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SessionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWrapper")
            .field("id", &self.id)
            .field("backend_pid", &self.backend_pid)
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}
