//! The process-wide map from [`DocumentKey`] to [`DocumentBroker`].

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::pool::WorkerPool;

use super::DocumentBroker;

/// Canonical identity of a document: the sanitized, percent-decoded path
/// component of its public URI, with any scheme/host/query stripped.
///
/// Two requests whose public URIs decode to the same key MUST share a
/// broker (§3, §8 — at most one broker per key at any instant).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Derive a key from the path segment of a public request URI.
    pub fn from_public_path(raw_path: &str) -> Self {
        let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
        let trimmed = decoded.trim_start_matches('/').trim_end_matches('/');
        Self(trimmed.to_string())
    }

    /// Derive a synthetic key for a `/convert-to` request, scoped to its own
    /// temp directory so it can never collide with a key a live editing
    /// session could derive from a public document URI (see the
    /// conversion-path Open Question decision in DESIGN.md).
    pub fn for_conversion(temp_dir_id: &str, filename: &str) -> Self {
        Self(format!("convert:{temp_dir_id}/{filename}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `map<DocumentKey, DocumentBroker>` guarded by a single mutex.
///
/// Lock order: registry mutex is always acquired before a broker's own
/// session mutex, never the reverse (see the concurrency model).
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    brokers: Mutex<HashMap<DocumentKey, Arc<DocumentBroker>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing broker for `key`, or acquire a worker and create
    /// one. On the creation path the registry mutex is released while
    /// waiting on the worker pool, to avoid blocking unrelated documents on
    /// one slow acquire; the map is re-checked on return in case a
    /// concurrent caller won the race.
    ///
    /// # Errors
    /// Propagates [`AppError::WorkerUnavailable`] from the pool without
    /// inserting a broker.
    pub async fn get_or_create(
        &self,
        key: DocumentKey,
        public_uri: String,
        pool: &WorkerPool,
    ) -> Result<Arc<DocumentBroker>, AppError> {
        if let Some(existing) = self.brokers.lock().await.get(&key) {
            existing.inc_sessions();
            return Ok(existing.clone());
        }

        let worker = pool.acquire().await?;

        let mut guard = self.brokers.lock().await;
        if let Some(existing) = guard.get(&key) {
            existing.inc_sessions();
            return Ok(existing.clone());
        }

        let broker = Arc::new(DocumentBroker::new(key.clone(), public_uri, worker));
        broker.inc_sessions();
        guard.insert(key, broker.clone());
        drop(guard);

        Ok(broker)
    }

    /// Release one reference on `key`'s broker, removing it from the map if
    /// the count reaches zero.
    pub async fn release(&self, key: &DocumentKey) {
        let mut guard = self.brokers.lock().await;
        let Some(broker) = guard.get(key) else { return };
        if broker.dec_sessions() == 0 {
            guard.remove(key);
        }
    }

    pub async fn get(&self, key: &DocumentKey) -> Option<Arc<DocumentBroker>> {
        self.brokers.lock().await.get(key).cloned()
    }

    /// Snapshot of every live broker, for the maintenance loop's scans.
    pub async fn all_brokers(&self) -> Vec<Arc<DocumentBroker>> {
        self.brokers.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.brokers.lock().await.len()
    }
}
