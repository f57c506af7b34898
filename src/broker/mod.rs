//! The document broker: per-document hub owning one worker, a set of user
//! sessions, and the edit-lock / reference-count bookkeeping the
//! specification requires.

pub mod registry;

pub use registry::{BrokerRegistry, DocumentKey};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::pool::WorkerHandle;
use crate::socket::{Frame, FrameTransport};
use crate::tile_queue::TileQueue;

/// Which side of a user↔worker pairing a [`UserSession`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The user-facing half, driven by the public endpoint's websocket.
    ToClient,
    /// The worker-facing half, driven by the internal endpoint's attach.
    ToWorker,
}

/// One participant in a document's editing session.
#[derive(Debug)]
pub struct UserSession {
    /// Session id, shared between the `ToClient` and `ToWorker` halves.
    pub id: String,
    pub kind: SessionKind,
    /// Outbound tile queue; present only on the `ToClient` half.
    pub queue: Option<Arc<TileQueue>>,
    /// True for exactly one session per broker: the first one attached.
    pub edit_lock: bool,
    pub last_message_time: Instant,
    pub idle_save_time: Instant,
    pub auto_save_time: Instant,
    /// Set if this session's initial `load` command failed; suppresses the
    /// last-session-save policy on teardown.
    pub load_error: bool,
    pub save_as_result: Option<String>,
    /// Set when the inbound reader sees an explicit `disconnect` token,
    /// distinguishing a clean close from an abrupt one.
    pub normal_shutdown: bool,
}

impl UserSession {
    /// Construct the user-facing half of a new session.
    pub fn new_to_client(id: String, queue: Arc<TileQueue>) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind: SessionKind::ToClient,
            queue: Some(queue),
            edit_lock: false,
            last_message_time: now,
            idle_save_time: now,
            auto_save_time: now,
            load_error: false,
            save_as_result: None,
            normal_shutdown: false,
        }
    }

    /// Record that a frame just arrived from this session's peer.
    pub fn touch(&mut self) {
        self.last_message_time = Instant::now();
    }
}

/// Per-document hub: one acquired worker, the set of attached sessions, and
/// the refcount that governs the broker's lifetime in the [`BrokerRegistry`].
pub struct DocumentBroker {
    pub key: DocumentKey,
    pub public_uri: String,
    pub worker_pid: u32,
    /// The originally-acquired worker's transport, kept as a control channel
    /// for announcing new sessions to it (the worker forks a per-session
    /// child that reconnects through the internal endpoint using the
    /// announced session id — that child process is out of scope here).
    control: Mutex<WorkerHandle>,
    sessions: Mutex<HashMap<String, Arc<Mutex<UserSession>>>>,
    ref_count: AtomicUsize,
    loaded: AtomicBool,
}

impl DocumentBroker {
    /// Create a broker that owns `worker` for editing `public_uri` under `key`.
    pub fn new(key: DocumentKey, public_uri: String, worker: WorkerHandle) -> Self {
        Self {
            key,
            public_uri,
            worker_pid: worker.pid,
            control: Mutex::new(worker),
            sessions: Mutex::new(HashMap::new()),
            ref_count: AtomicUsize::new(0),
            loaded: AtomicBool::new(false),
        }
    }

    /// Tell the owned worker to start a new session with `session_id`,
    /// expected to reconnect through the internal endpoint's `child-uri`
    /// attach point carrying that same id.
    pub async fn announce_session(&self, session_id: &str) -> anyhow::Result<()> {
        let mut guard = self.control.lock().await;
        guard
            .transport
            .send_frame(&Frame::Text(format!("session {session_id} {} {}", self.key, self.public_uri)))
            .await
    }

    /// Ensure `uri` is well-formed enough for the storage backend. A
    /// rejection here must not consume a worker slot — callers validate
    /// before calling [`BrokerRegistry::get_or_create`].
    pub fn validate_uri(uri: &str) -> Result<(), String> {
        if uri.is_empty() {
            return Err("empty document URI".to_string());
        }
        if uri.split('/').any(|segment| segment == "..") {
            return Err("document URI must not contain '..' segments".to_string());
        }
        Ok(())
    }

    /// Called by the internal endpoint once the worker declares its jail
    /// identity. Idempotent.
    pub fn load(&self, _jail_id: &str) {
        self.loaded.store(true, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Increment the broker's reference count, returning the new value.
    pub fn inc_sessions(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the broker's reference count, returning the new value.
    pub fn dec_sessions(&self) -> usize {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Insert `session`, granting the edit lock if it is the first one.
    /// Returns whether this session became the edit-lock holder.
    pub async fn add_session(&self, mut session: UserSession) -> bool {
        let mut guard = self.sessions.lock().await;
        let is_first = guard.is_empty();
        session.edit_lock = is_first;
        guard.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        is_first
    }

    pub async fn remove_session(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Mutex<UserSession>>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Every attached session, for the maintenance loop's idle/auto-save scans.
    pub async fn sessions_snapshot(&self) -> Vec<Arc<Mutex<UserSession>>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Number of sessions currently holding the edit lock (must never exceed 1).
    pub async fn edit_lock_count(&self) -> usize {
        let mut n = 0;
        for session in self.sessions.lock().await.values() {
            if session.lock().await.edit_lock {
                n += 1;
            }
        }
        n
    }
}

impl std::fmt::Debug for DocumentBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBroker")
            .field("key", &self.key)
            .field("worker_pid", &self.worker_pid)
            .field("ref_count", &self.ref_count())
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
