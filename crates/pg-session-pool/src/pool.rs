//! The session pool: adaptive sizing, reconciliation, and borrowing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::driver::{ConnectOptions, SessionDriver};
use crate::error::PoolError;
use crate::prober::{ProbeOutcome, probe};
use crate::sizing::SizingController;
use crate::statements::QueryDefinitions;
use crate::wrapper::SessionWrapper;

/// How long a borrow waits on the ready-queue by default.
const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_millis(50);

/// Granularity of the ready-queue poll loop.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Per-session probe budget during a validation sweep.
const VALIDATION_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// A self-managing pool of database sessions.
///
/// The pool sizes itself to the observed request rate, replaces sessions
/// as they age out, reclaims sessions whose borrowers went quiet by
/// consulting the server's activity view, and keeps a per-session cache
/// of registered query handles.
///
/// # Example
///
/// ```rust,ignore
/// use pg_session_pool::{Pool, PoolConfig};
///
/// let config = PoolConfig::new()
///     .min_connections(2)
///     .max_connections(10)
///     .url("postgres://localhost/app");
///
/// let pool = Pool::connect(config).await?;
///
/// let session = pool.borrow_connection().await?;
/// // Run queries through session.session() ...
/// session.release().await;
/// ```
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

struct PoolInner {
    config: PoolConfig,
    connect_opts: ConnectOptions,
    driver: Arc<dyn SessionDriver>,

    /// Cleared exactly once by shutdown; checked first in every public
    /// operation and at the top of every background pass.
    running: AtomicBool,

    /// Counter for generating wrapper ids.
    next_wrapper_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Every wrapper the pool currently owns, keyed by wrapper id.
    live: Mutex<HashMap<u64, Arc<SessionWrapper>>>,

    /// Free sessions awaiting borrowers.
    ready: ArrayQueue<Arc<SessionWrapper>>,

    /// Pool-wide registered query definitions.
    definitions: QueryDefinitions,

    /// Dedicated session used to read the server's activity view.
    prober: Mutex<Option<Arc<SessionWrapper>>>,

    sizing: SizingController,

    metrics: Mutex<PoolMetricsInner>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    sessions_created: u64,
    sessions_closed: u64,
    sessions_reclaimed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    probes_performed: u64,
    probes_skipped: u64,
    validations_performed: u64,
    validations_failed: u64,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a pool over the given driver backend.
    ///
    /// Establishes the prober session (fatal on failure), warms up the
    /// initial complement of sessions (individual failures are logged and
    /// skipped), runs one reconciliation pass, and spawns the background
    /// reconciliation and validation tasks.
    pub async fn new(config: PoolConfig, driver: Arc<dyn SessionDriver>) -> Result<Self, PoolError> {
        config.validate()?;

        let connect_opts = ConnectOptions {
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        };

        let inner = Arc::new(PoolInner {
            connect_opts,
            driver,
            running: AtomicBool::new(true),
            next_wrapper_id: AtomicU64::new(1),
            created_at: Instant::now(),
            live: Mutex::new(HashMap::new()),
            ready: ArrayQueue::new(config.max_connections + 1),
            definitions: QueryDefinitions::new(
                config.max_cached_queries,
                config.max_query_text_length,
            ),
            prober: Mutex::new(None),
            sizing: SizingController::new(&config),
            metrics: Mutex::new(PoolMetricsInner::default()),
            tasks: Mutex::new(Vec::new()),
            config: config.clone(),
        });

        // Without a working prober the pool cannot reclaim anything, so a
        // failure here is fatal.
        let prober = inner
            .establish_wrapper(config.connection_lifespan * 2, false)
            .await?;
        *inner.prober.lock() = Some(prober);

        let target = inner.sizing.target();
        for _ in 0..target {
            match inner
                .establish_wrapper(config.connection_lifespan, true)
                .await
            {
                Ok(wrapper) => {
                    inner.live.lock().insert(wrapper.id(), wrapper);
                    inner.metrics.lock().sessions_created += 1;
                }
                Err(e) => tracing::warn!(error = %e, "failed to establish session during warm-up"),
            }
        }

        inner.reconcile().await;
        Self::spawn_tasks(&inner);

        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            target,
            "session pool created"
        );

        Ok(Self { inner })
    }

    /// Create a pool backed by the PostgreSQL driver.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: PoolConfig) -> Result<Self, PoolError> {
        Self::new(config, Arc::new(crate::driver::postgres::PgDriver::new())).await
    }

    fn spawn_tasks(inner: &Arc<PoolInner>) {
        let weak = Arc::downgrade(inner);
        let tick = inner.config.management_tick_interval;
        let reconciliation = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                inner.reconcile().await;
            }
        });

        let weak = Arc::downgrade(inner);
        let initial_delay = inner.config.validation_initial_delay;
        let interval_period = inner.config.validation_interval;
        let validation = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(interval_period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                inner.validate_sweep().await;
            }
        });

        inner.tasks.lock().extend([reconciliation, validation]);
    }

    /// Borrow a session, waiting up to the default timeout.
    ///
    /// The returned wrapper is exclusively lent to the caller; call
    /// [`SessionWrapper::release`] to hand it back. Borrowers that forget
    /// are eventually reclaimed through the server's activity view.
    pub async fn borrow_connection(&self) -> Result<Arc<SessionWrapper>, PoolError> {
        self.borrow_connection_timeout(DEFAULT_BORROW_TIMEOUT).await
    }

    /// Borrow a session, waiting up to `timeout` per attempt.
    ///
    /// An empty first attempt triggers one out-of-band reconciliation
    /// pass and a single retry; a second miss fails with
    /// [`PoolError::PoolExhausted`].
    pub async fn borrow_connection_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Arc<SessionWrapper>, PoolError> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        self.inner.sizing.record_request();

        let started = Instant::now();
        if let Some(wrapper) = self.inner.take_ready(timeout).await {
            self.inner.metrics.lock().checkouts_successful += 1;
            return Ok(wrapper);
        }

        self.inner.reconcile().await;
        if let Some(wrapper) = self.inner.take_ready(timeout).await {
            self.inner.metrics.lock().checkouts_successful += 1;
            return Ok(wrapper);
        }

        self.inner.metrics.lock().checkouts_failed += 1;
        Err(PoolError::PoolExhausted {
            waited: started.elapsed(),
        })
    }

    /// Register a batch of query definitions.
    ///
    /// Each live session adopts missing definitions lazily during
    /// reconciliation. See [`QueryDefinitions::add`] for the admission
    /// rules.
    pub fn add_query_definitions(
        &self,
        defs: HashMap<String, String>,
    ) -> Result<usize, PoolError> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        self.inner.definitions.add(defs, None)
    }

    /// Register a batch of query definitions with driver prepare flags
    /// attached to matching keys.
    pub fn add_query_definitions_with(
        &self,
        defs: HashMap<String, String>,
        constants: &HashMap<String, i32>,
    ) -> Result<usize, PoolError> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        self.inner.definitions.add(defs, Some(constants))
    }

    /// Shut the pool down.
    ///
    /// Idempotent. Stops the background tasks, drains the ready-queue,
    /// and closes every live session and the prober. Every close is
    /// attempted; the first failure is surfaced.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        while self.inner.ready.pop().is_some() {}

        let wrappers: Vec<Arc<SessionWrapper>> =
            self.inner.live.lock().drain().map(|(_, w)| w).collect();
        let mut first_err: Option<PoolError> = None;
        for wrapper in wrappers {
            if let Err(e) = wrapper.close().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            self.inner.metrics.lock().sessions_closed += 1;
        }

        let prober = self.inner.prober.lock().take();
        if let Some(prober) = prober {
            if let Err(e) = prober.close().await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        tracing::info!("session pool closed");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let live = self.inner.live.lock();
        let in_use = live.values().filter(|w| w.in_use()).count();
        PoolStatus {
            available: self.inner.ready.len(),
            live: live.len(),
            in_use,
            target: self.inner.sizing.target(),
            max: self.inner.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            sessions_created: inner.sessions_created,
            sessions_closed: inner.sessions_closed,
            sessions_reclaimed: inner.sessions_reclaimed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            probes_performed: inner.probes_performed,
            probes_skipped: inner.probes_skipped,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Check if the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.inner.running.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl PoolInner {
    async fn establish_wrapper(
        &self,
        lifespan: Duration,
        seed: bool,
    ) -> Result<Arc<SessionWrapper>, PoolError> {
        let id = self.next_wrapper_id.fetch_add(1, Ordering::Relaxed);
        let definitions = seed.then_some(&self.definitions);
        SessionWrapper::establish(&self.driver, &self.connect_opts, id, lifespan, definitions)
            .await
    }

    /// Pull a usable session from the ready-queue.
    ///
    /// Stale entries (closed, or beaten to the in-use flag) are discarded
    /// and polling restarts with a fresh timeout, so the worst case is
    /// bounded by roughly `timeout * max_connections`.
    async fn take_ready(&self, timeout: Duration) -> Option<Arc<SessionWrapper>> {
        loop {
            let deadline = Instant::now() + timeout;
            let wrapper = loop {
                match self.ready.pop() {
                    Some(wrapper) => break wrapper,
                    None => {
                        if Instant::now() >= deadline {
                            return None;
                        }
                        tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                    }
                }
            };

            wrapper.clear_queued();
            if wrapper.is_closed() {
                self.remove_from_live(&wrapper);
                continue;
            }
            if wrapper.borrow().is_some() {
                return Some(wrapper);
            }
        }
    }

    fn remove_from_live(&self, wrapper: &Arc<SessionWrapper>) {
        if self.live.lock().remove(&wrapper.id()).is_some() {
            self.metrics.lock().sessions_closed += 1;
        }
    }

    async fn remove_and_close(&self, wrapper: &Arc<SessionWrapper>) {
        self.remove_from_live(wrapper);
        if let Err(e) = wrapper.close().await {
            tracing::debug!(wrapper = wrapper.id(), error = %e, "session closed with errors");
        }
    }

    /// One management pass: resize, sweep, top up or trim, refresh the
    /// prober, and offer free sessions to borrowers.
    async fn reconcile(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        self.sizing.tick();

        // Sweep the dead and the dying. At most one session nearing
        // expiry is replaced per pass so a cohort created together does
        // not all expire at once.
        let snapshot: Vec<Arc<SessionWrapper>> = self.live.lock().values().cloned().collect();
        let registered = self.definitions.len();
        let mut replaced_one = false;
        for wrapper in &snapshot {
            if wrapper.is_closed() || wrapper.has_expired() {
                self.remove_and_close(wrapper).await;
            } else if !replaced_one && !wrapper.within_replacement_grace() && !wrapper.in_use() {
                replaced_one = true;
                self.remove_and_close(wrapper).await;
            } else if wrapper.cached_statement_count() < registered {
                wrapper.adopt_definitions(&self.definitions).await;
            }
        }

        // Bring the live count to the target.
        let target = self.sizing.target();
        let live_count = self.live.lock().len();
        if live_count < target {
            for _ in live_count..target {
                match self
                    .establish_wrapper(self.config.connection_lifespan, true)
                    .await
                {
                    Ok(wrapper) => {
                        if !self.running.load(Ordering::Acquire) {
                            if let Err(e) = wrapper.close().await {
                                tracing::debug!(error = %e, "session closed with errors");
                            }
                            return;
                        }
                        self.live.lock().insert(wrapper.id(), wrapper);
                        self.metrics.lock().sessions_created += 1;
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to establish pool session"),
                }
            }
        } else if live_count > target {
            let mut idle: Vec<Arc<SessionWrapper>> = self
                .live
                .lock()
                .values()
                .filter(|w| !w.in_use())
                .cloned()
                .collect();
            idle.sort_by_key(|w| w.expiration());
            for wrapper in idle.into_iter().take(live_count - target) {
                self.remove_and_close(&wrapper).await;
            }
        }

        self.refresh_prober().await;

        // Offer every free session to borrowers. Sessions still flagged
        // in-use are checked against the server's activity view and
        // reclaimed if their backend sits idle.
        let snapshot: Vec<Arc<SessionWrapper>> = self.live.lock().values().cloned().collect();
        let prober = self.prober.lock().clone();
        for wrapper in snapshot {
            if wrapper.is_closed() || wrapper.is_queued() {
                continue;
            }
            let free = if wrapper.in_use() {
                match &prober {
                    Some(prober) => {
                        let outcome = probe(prober, &wrapper).await;
                        {
                            let mut metrics = self.metrics.lock();
                            metrics.probes_performed += 1;
                            match outcome {
                                ProbeOutcome::Reclaimed => metrics.sessions_reclaimed += 1,
                                ProbeOutcome::Skipped => metrics.probes_skipped += 1,
                                ProbeOutcome::Busy | ProbeOutcome::Gone => {}
                            }
                        }
                        matches!(outcome, ProbeOutcome::Reclaimed)
                    }
                    None => false,
                }
            } else {
                true
            };
            if free && wrapper.mark_queued() && self.ready.push(wrapper.clone()).is_err() {
                wrapper.clear_queued();
                tracing::warn!(wrapper = wrapper.id(), "ready queue full, deferring session");
            }
        }
    }

    async fn refresh_prober(&self) {
        let stale = match self.prober.lock().as_ref() {
            Some(prober) => prober.is_closed() || prober.has_expired(),
            None => true,
        };
        if !stale {
            return;
        }

        match self
            .establish_wrapper(self.config.connection_lifespan * 2, false)
            .await
        {
            Ok(fresh) => {
                let old = self.prober.lock().replace(fresh);
                if let Some(old) = old {
                    if let Err(e) = old.close().await {
                        tracing::debug!(error = %e, "previous prober closed with errors");
                    }
                }
                tracing::debug!("prober session refreshed");
            }
            Err(e) => tracing::warn!(error = %e, "failed to refresh prober session"),
        }
    }

    /// Liveness-check every idle session; failures close and remove it.
    async fn validate_sweep(&self) {
        let snapshot: Vec<Arc<SessionWrapper>> = self.live.lock().values().cloned().collect();
        for wrapper in snapshot {
            if wrapper.in_use() || wrapper.is_closed() {
                continue;
            }
            let valid = wrapper.validate(VALIDATION_PROBE_TIMEOUT).await;
            {
                let mut metrics = self.metrics.lock();
                metrics.validations_performed += 1;
                if !valid {
                    metrics.validations_failed += 1;
                }
            }
            if !valid {
                self.remove_and_close(&wrapper).await;
            }
        }
    }
}

/// Builder for creating a session pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .config(config)
///     .driver(driver)
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder {
    config: PoolConfig,
    driver: Option<Arc<dyn SessionDriver>>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            driver: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the driver backend.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn SessionDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min_connections(mut self, count: usize) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<Pool, PoolError> {
        let driver = self
            .driver
            .ok_or_else(|| PoolError::Config("no session driver configured".to_string()))?;
        Pool::new(self.config, driver).await
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of free sessions waiting in the ready-queue.
    pub available: usize,
    /// Total number of sessions the pool currently owns.
    pub live: usize,
    /// Number of sessions currently lent out.
    pub in_use: usize,
    /// The sizing controller's current target.
    pub target: usize,
    /// Maximum allowed sessions.
    pub max: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.live >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total sessions established since pool start.
    pub sessions_created: u64,
    /// Total sessions closed since pool start.
    pub sessions_closed: u64,
    /// Sessions reclaimed from quiet borrowers via the activity view.
    pub sessions_reclaimed: u64,
    /// Successful borrows.
    pub checkouts_successful: u64,
    /// Failed borrows (timeouts, pool closed).
    pub checkouts_failed: u64,
    /// Backend state probes performed.
    pub probes_performed: u64,
    /// Probes that failed and were deferred.
    pub probes_skipped: u64,
    /// Validation probes performed.
    pub validations_performed: u64,
    /// Validation probes that failed.
    pub validations_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate borrow success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            live: 10,
            in_use: 5,
            target: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            live: 10,
            in_use: 10,
            target: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status = PoolStatus {
            available: 5,
            live: 10,
            in_use: 5,
            target: 10,
            max: 20,
        };
        assert!(!status.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            sessions_created: 10,
            sessions_closed: 2,
            sessions_reclaimed: 1,
            checkouts_successful: 90,
            checkouts_failed: 10,
            probes_performed: 100,
            probes_skipped: 3,
            validations_performed: 100,
            validations_failed: 5,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_metrics_rates_are_full() {
        let metrics = PoolMetrics {
            sessions_created: 0,
            sessions_closed: 0,
            sessions_reclaimed: 0,
            checkouts_successful: 0,
            checkouts_failed: 0,
            probes_performed: 0,
            probes_skipped: 0,
            validations_performed: 0,
            validations_failed: 0,
            uptime: Duration::ZERO,
        };
        assert!((metrics.checkout_success_rate() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::builder().min_connections(5).max_connections(50);
        assert_eq!(builder.config.min_connections, 5);
        assert_eq!(builder.config.max_connections, 50);
        assert!(builder.driver.is_none());
    }
}
