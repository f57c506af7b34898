//! The worker pool: pre-spawning, handoff, and bounded-wait acquisition of
//! ready worker processes produced by the [`crate::supervisor::SupervisorLink`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::error::AppError;
use crate::socket::StreamTransport;

/// A ready-or-bound worker connection handed off by the internal endpoint.
///
/// Wraps the plain TCP stream to the worker process; [`StreamTransport`]
/// speaks the shared frame protocol over it once a [`crate::pipeline::SessionPipeline`]
/// takes ownership.
#[derive(Debug)]
pub struct WorkerHandle {
    /// PID reported by the worker on registration (for diagnostics and the
    /// supervisor's own bookkeeping).
    pub pid: u32,
    /// The underlying frame transport to the worker process.
    pub transport: StreamTransport<tokio::net::TcpStream>,
}

/// Bounded-wait queue of ready [`WorkerHandle`]s.
///
/// Acquisition pops from the tail (LIFO): a just-registered worker has the
/// warmest caches, so handing it out first avoids waking a worker that has
/// been idle since an earlier pre-spawn batch.
pub struct WorkerPool {
    ready: Mutex<VecDeque<WorkerHandle>>,
    notify: Notify,
    configured_prespawn: usize,
    acquire_timeout: Duration,
    supervisor: Arc<crate::supervisor::SupervisorLink>,
}

impl WorkerPool {
    /// Create a pool that requests `configured_prespawn` ready workers at a
    /// time from `supervisor`, and waits up to `acquire_timeout` per acquire.
    pub fn new(
        configured_prespawn: usize,
        acquire_timeout: Duration,
        supervisor: Arc<crate::supervisor::SupervisorLink>,
    ) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            configured_prespawn,
            acquire_timeout,
            supervisor,
        }
    }

    /// Issue the initial `spawn configured_prespawn` request.
    pub async fn pre_spawn(&self) {
        log::info!("pre-spawning {} worker(s)", self.configured_prespawn);
        self.supervisor.spawn(self.configured_prespawn).await;
    }

    /// Register a newly-available worker and wake exactly one waiter.
    pub async fn register(&self, handle: WorkerHandle) {
        log::debug!("worker {} registered as ready", handle.pid);
        self.ready.lock().await.push_back(handle);
        self.notify.notify_one();
    }

    /// Current number of ready (unacquired) workers.
    pub async fn available(&self) -> usize {
        self.ready.lock().await.len()
    }

    /// Acquire a ready worker, replenishing the pool first if it is running
    /// low, and waiting up to the configured timeout for one to appear.
    ///
    /// # Errors
    /// Returns [`AppError::WorkerUnavailable`] if no worker becomes ready in
    /// time.
    pub async fn acquire(&self) -> Result<WorkerHandle, AppError> {
        {
            let available = self.ready.lock().await.len();
            let deficit = if available == 0 {
                self.configured_prespawn
            } else {
                self.configured_prespawn.saturating_sub(available - 1)
            };
            if deficit > 0 {
                if available == 0 {
                    log::warn!("worker pool exhausted, requesting {deficit} more");
                }
                self.supervisor.spawn(deficit).await;
            }
        }

        timeout(self.acquire_timeout, self.wait_for_ready())
            .await
            .map_err(|_| AppError::WorkerUnavailable)
    }

    async fn wait_for_ready(&self) -> WorkerHandle {
        loop {
            {
                let mut guard = self.ready.lock().await;
                if let Some(handle) = guard.pop_back() {
                    return handle;
                }
            }
            self.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("configured_prespawn", &self.configured_prespawn)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorLink;

    fn no_op_supervisor() -> Arc<SupervisorLink> {
        Arc::new(SupervisorLink::disconnected())
    }

    async fn fake_handle(pid: u32) -> WorkerHandle {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, _) = tokio::join!(async { listener.accept().await.unwrap().0 }, connect);
        let _ = accepted;
        let stream = connect_ignored(addr).await;
        WorkerHandle { pid, transport: StreamTransport::new(stream) }
    }

    async fn connect_ignored(addr: std::net::SocketAddr) -> tokio::net::TcpStream {
        tokio::net::TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_stays_empty() {
        let pool = WorkerPool::new(0, Duration::from_millis(50), no_op_supervisor());
        let result = pool.acquire().await;
        assert!(matches!(result, Err(AppError::WorkerUnavailable)));
    }

    #[tokio::test]
    async fn acquire_returns_registered_worker() {
        let pool = WorkerPool::new(1, Duration::from_secs(2), no_op_supervisor());
        let handle = fake_handle(42).await;
        pool.register(handle).await;
        let acquired = pool.acquire().await.unwrap();
        assert_eq!(acquired.pid, 42);
        assert_eq!(pool.available().await, 0);
    }

    #[tokio::test]
    async fn acquire_is_lifo() {
        let pool = WorkerPool::new(2, Duration::from_secs(2), no_op_supervisor());
        pool.register(fake_handle(1).await).await;
        pool.register(fake_handle(2).await).await;
        let acquired = pool.acquire().await.unwrap();
        assert_eq!(acquired.pid, 2, "most recently registered worker should be handed out first");
    }
}
