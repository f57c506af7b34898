//! The cancel-collapsing per-session message queue.
//!
//! A single producer (the inbound reader of a [`crate::pipeline::SessionPipeline`])
//! enqueues command strings; a single consumer drains them toward the bound
//! worker session. The only non-FIFO behavior is the `canceltiles` collapse:
//! enqueuing a `canceltiles` message atomically drops every currently queued
//! `tile`/`tilecombine` message that precedes it.

use std::collections::VecDeque;

use tokio::sync::Notify;
use tokio::sync::Mutex;

/// Sentinel appended by the pipeline to signal the consumer to drain and exit.
pub const EOF: &str = "eof";

fn is_tile_producing(msg: &str) -> bool {
    let first = msg.split_whitespace().next().unwrap_or("");
    first == "tile" || first == "tilecombine"
}

/// Ordered, unbounded, single-consumer message queue with tile-cancel collapse.
#[derive(Debug)]
pub struct TileQueue {
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TileQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue `msg`. If `msg`'s first token is `canceltiles`, every queued
    /// tile-producing message is dropped first so a cancelled tile can never
    /// reach the worker.
    pub async fn put(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut guard = self.inner.lock().await;
        if msg.split_whitespace().next() == Some("canceltiles") {
            guard.retain(|queued| !is_tile_producing(queued));
        }
        guard.push_back(msg);
        drop(guard);
        self.notify.notify_one();
    }

    /// Drop every queued message, leaving the queue empty.
    ///
    /// Used when a session tears down abruptly and pending tile work should
    /// be abandoned rather than delivered.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    /// Wait for and remove the next message, in FIFO order.
    pub async fn take(&self) -> String {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(msg) = guard.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Snapshot the queue contents without consuming them (test/debug use).
    #[cfg(test)]
    async fn snapshot(&self) -> Vec<String> {
        self.inner.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canceltiles_drops_preceding_tile_frames() {
        let q = TileQueue::new();
        q.put("tile 0 0").await;
        q.put("tile 0 1").await;
        q.put("tilecombine part=0").await;
        q.put("text T").await;
        q.put("canceltiles").await;

        assert_eq!(
            q.snapshot().await,
            vec!["text T".to_string(), "canceltiles".to_string()]
        );
    }

    #[tokio::test]
    async fn non_tile_messages_preserve_order() {
        let q = TileQueue::new();
        q.put("a").await;
        q.put("b").await;
        assert_eq!(q.take().await, "a");
        assert_eq!(q.take().await, "b");
    }

    #[tokio::test]
    async fn clear_empties_queue() {
        let q = TileQueue::new();
        q.put("tile 0 0").await;
        q.clear().await;
        assert!(q.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn take_waits_for_producer() {
        let q = std::sync::Arc::new(TileQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.take().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.put("uno .uno:Save").await;
        let msg = handle.await.unwrap();
        assert_eq!(msg, "uno .uno:Save");
    }
}
