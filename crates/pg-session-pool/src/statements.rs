//! Pool-wide query definition registry.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::PoolError;

/// A registered query: its text plus an optional driver prepare flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    /// The query text prepared on each session.
    pub text: String,
    /// Driver-specific prepare flag, if one was registered for this key.
    pub flag: Option<i32>,
}

/// The shared registry of query definitions every pooled session caches.
///
/// Admission is atomic per batch: a batch that would push the registry
/// past its capacity is rejected in full.
pub struct QueryDefinitions {
    inner: Mutex<HashMap<String, QueryDefinition>>,
    max_entries: usize,
    max_text_length: usize,
}

impl QueryDefinitions {
    /// Create an empty registry with the given admission limits.
    #[must_use]
    pub fn new(max_entries: usize, max_text_length: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_entries,
            max_text_length,
        }
    }

    /// Register a batch of query definitions.
    ///
    /// Candidates with empty or over-length text are skipped, and keys
    /// already registered count zero. If the surviving candidates would
    /// exceed the registry capacity the whole batch is rejected and
    /// nothing is added. Returns the number of definitions added.
    pub fn add(
        &self,
        defs: HashMap<String, String>,
        constants: Option<&HashMap<String, i32>>,
    ) -> Result<usize, PoolError> {
        let mut registry = self.inner.lock();

        let mut admitted = Vec::new();
        for (key, text) in defs {
            if key.is_empty() || text.is_empty() || text.len() > self.max_text_length {
                tracing::debug!(
                    key = %key,
                    text_len = text.len(),
                    "skipping query definition outside admission bounds"
                );
                continue;
            }
            if registry.contains_key(&key) {
                continue;
            }
            let flag = constants.and_then(|c| c.get(&key).copied());
            admitted.push((key, QueryDefinition { text, flag }));
        }

        let requested = admitted.len();
        if registry.len() + requested > self.max_entries {
            return Err(PoolError::DefinitionsRejected {
                requested,
                capacity: self.max_entries,
                registered: registry.len(),
            });
        }

        for (key, def) in admitted {
            registry.insert(key, def);
        }
        Ok(requested)
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Look up one definition by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<QueryDefinition> {
        self.inner.lock().get(key).cloned()
    }

    /// Snapshot the registry for iteration outside the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, QueryDefinition)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl std::fmt::Debug for QueryDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDefinitions")
            .field("registered", &self.len())
            .field("max_entries", &self.max_entries)
            .field("max_text_length", &self.max_text_length)
            .finish()
    }
}
