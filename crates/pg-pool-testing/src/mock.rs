//! In-memory mock driver with scriptable backend states.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pg_session_pool::{
    ConnectOptions, DbSession, DriverError, PrepareOptions, QueryHandle, SessionDriver,
};

/// Shared, scriptable state behind every mock session.
///
/// Tests hold an `Arc<MockBackend>` to change per-pid activity states,
/// inject failures, and read operation counters.
pub struct MockBackend {
    next_pid: AtomicI32,
    states: Mutex<HashMap<i32, String>>,
    connects: AtomicUsize,
    prepares: AtomicUsize,
    session_closes: AtomicUsize,
    handle_closes: AtomicUsize,
    state_probes: AtomicUsize,
    fail_connects: AtomicBool,
    fail_backend_pid: AtomicBool,
    fail_prepares: AtomicBool,
    fail_state_probes: AtomicBool,
    fail_closes: AtomicBool,
    valid: AtomicBool,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(100),
            states: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            session_closes: AtomicUsize::new(0),
            handle_closes: AtomicUsize::new(0),
            state_probes: AtomicUsize::new(0),
            fail_connects: AtomicBool::new(false),
            fail_backend_pid: AtomicBool::new(false),
            fail_prepares: AtomicBool::new(false),
            fail_state_probes: AtomicBool::new(false),
            fail_closes: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        }
    }

    /// Script the activity state the server reports for `pid`.
    pub fn set_state(&self, pid: i32, state: &str) {
        self.states.lock().insert(pid, state.to_string());
    }

    /// Make the server forget `pid` entirely, as if the backend died.
    pub fn drop_backend(&self, pid: i32) {
        self.states.lock().remove(&pid);
    }

    /// Make subsequent connection attempts fail.
    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Release);
    }

    /// Make backend pid retrieval fail on newly opened sessions.
    pub fn fail_backend_pid(&self, fail: bool) {
        self.fail_backend_pid.store(fail, Ordering::Release);
    }

    /// Make query preparation fail.
    pub fn fail_prepares(&self, fail: bool) {
        self.fail_prepares.store(fail, Ordering::Release);
    }

    /// Make activity-state probes fail.
    pub fn fail_state_probes(&self, fail: bool) {
        self.fail_state_probes.store(fail, Ordering::Release);
    }

    /// Make session and handle closes report failure.
    pub fn fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::Release);
    }

    /// Control the answer of liveness validation probes.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    /// Sessions opened so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Queries prepared so far.
    #[must_use]
    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::Acquire)
    }

    /// Sessions closed so far.
    #[must_use]
    pub fn session_closes(&self) -> usize {
        self.session_closes.load(Ordering::Acquire)
    }

    /// Query handles closed so far.
    #[must_use]
    pub fn handle_closes(&self) -> usize {
        self.handle_closes.load(Ordering::Acquire)
    }

    /// Activity-state probes served so far.
    #[must_use]
    pub fn state_probes(&self) -> usize {
        self.state_probes.load(Ordering::Acquire)
    }
}

/// A driver backed entirely by in-memory state.
///
/// Every session it opens gets a fresh pid and an `active` state entry in
/// the shared [`MockBackend`].
#[derive(Clone)]
pub struct MockDriver {
    backend: Arc<MockBackend>,
}

impl MockDriver {
    /// Create a driver with a fresh backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backend: Arc::new(MockBackend::new()),
        }
    }

    /// The shared backend state, for scripting and assertions.
    #[must_use]
    pub fn backend(&self) -> Arc<MockBackend> {
        self.backend.clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionDriver for MockDriver {
    async fn connect(&self, _opts: &ConnectOptions) -> Result<Arc<dyn DbSession>, DriverError> {
        self.backend.connects.fetch_add(1, Ordering::AcqRel);
        if self.backend.fail_connects.load(Ordering::Acquire) {
            return Err(DriverError::Connect("mock connect failure".to_string()));
        }
        let pid = self.backend.next_pid.fetch_add(1, Ordering::AcqRel);
        self.backend.states.lock().insert(pid, "active".to_string());
        Ok(Arc::new(MockSession {
            pid,
            backend: self.backend.clone(),
        }))
    }
}

/// A mock database session.
pub struct MockSession {
    pid: i32,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl DbSession for MockSession {
    async fn backend_pid(&self) -> Result<i32, DriverError> {
        if self.backend.fail_backend_pid.load(Ordering::Acquire) {
            return Err(DriverError::Query("backend pid unavailable".to_string()));
        }
        Ok(self.pid)
    }

    async fn prepare(&self, text: &str) -> Result<Arc<dyn QueryHandle>, DriverError> {
        self.backend.prepares.fetch_add(1, Ordering::AcqRel);
        if self.backend.fail_prepares.load(Ordering::Acquire) {
            return Err(DriverError::Prepare("mock prepare failure".to_string()));
        }
        Ok(Arc::new(MockQueryHandle {
            text: text.to_string(),
            backend: self.backend.clone(),
        }))
    }

    async fn prepare_with(
        &self,
        text: &str,
        _options: &PrepareOptions,
    ) -> Result<Arc<dyn QueryHandle>, DriverError> {
        self.prepare(text).await
    }

    async fn is_valid(&self, _timeout: Duration) -> bool {
        self.backend.valid.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.backend.session_closes.fetch_add(1, Ordering::AcqRel);
        self.backend.states.lock().remove(&self.pid);
        if self.backend.fail_closes.load(Ordering::Acquire) {
            return Err(DriverError::Close("mock close failure".to_string()));
        }
        Ok(())
    }

    async fn backend_state(&self, pid: i32) -> Result<Option<String>, DriverError> {
        self.backend.state_probes.fetch_add(1, Ordering::AcqRel);
        if self.backend.fail_state_probes.load(Ordering::Acquire) {
            return Err(DriverError::Query("activity view unavailable".to_string()));
        }
        Ok(self.backend.states.lock().get(&pid).cloned())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A mock prepared query handle.
pub struct MockQueryHandle {
    text: String,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl QueryHandle for MockQueryHandle {
    fn text(&self) -> &str {
        &self.text
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.backend.handle_closes.fetch_add(1, Ordering::AcqRel);
        if self.backend.fail_closes.load(Ordering::Acquire) {
            return Err(DriverError::Close("mock close failure".to_string()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
