//! Rendezvous point between the public endpoint's per-client session and the
//! matching worker-side session the internal endpoint attaches later.
//!
//! A client's websocket arrives first and registers interest in a session
//! id; the worker's attach can arrive before or after that. Either order
//! must resolve to the same pairing, so both sides go through one map keyed
//! by session id, with a `Notify` waking whichever side got there first.

use std::collections::HashMap;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::socket::{FrameReader, FrameWriter};

/// The worker-side read half of an attached session, handed to the
/// pipeline's worker-reader task.
pub type WorkerSessionReader = FrameReader<ReadHalf<TcpStream>>;
/// The worker-side write half of an attached session, handed to the
/// pipeline's queue-consumer task.
pub type WorkerSessionWriter = FrameWriter<WriteHalf<TcpStream>>;

/// The worker-side half of a session pairing, split so the pipeline can run
/// its reader and its queue consumer as independent tasks over it.
pub struct AvailableWorkerSessions {
    ready: Mutex<HashMap<String, (WorkerSessionReader, WorkerSessionWriter)>>,
    notify: Notify,
}

impl AvailableWorkerSessions {
    pub fn new() -> Self {
        Self { ready: Mutex::new(HashMap::new()), notify: Notify::new() }
    }

    /// Record that `session_id`'s worker-side transport is ready, waking any
    /// pipeline already waiting for it.
    pub async fn publish(&self, session_id: String, reader: WorkerSessionReader, writer: WorkerSessionWriter) {
        self.ready.lock().await.insert(session_id, (reader, writer));
        self.notify.notify_waiters();
    }

    /// Take the worker-side transport for `session_id` if it has already
    /// been published, without waiting.
    pub async fn try_take(&self, session_id: &str) -> Option<(WorkerSessionReader, WorkerSessionWriter)> {
        self.ready.lock().await.remove(session_id)
    }

    /// Wait until `session_id`'s worker-side transport is published, then
    /// take it. Callers are expected to race this against their own
    /// deadline (the worker pool's acquire timeout already bounds how long
    /// a session can plausibly wait).
    pub async fn wait_for(&self, session_id: &str) -> (WorkerSessionReader, WorkerSessionWriter) {
        loop {
            // Registered before the check: a `publish` landing between the
            // check and the wait is still observed, since `notified()` ties
            // itself to the Notify's state at creation, not at first poll.
            let notified = self.notify.notified();
            if let Some(halves) = self.try_take(session_id).await {
                return halves;
            }
            notified.await;
        }
    }

    /// Drop a published-but-never-claimed transport, e.g. when a client
    /// disconnects before its worker attach arrives.
    pub async fn cancel(&self, session_id: &str) {
        self.ready.lock().await.remove(session_id);
    }
}

impl Default for AvailableWorkerSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AvailableWorkerSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailableWorkerSessions").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{Frame, FrameSink, FrameTransport, StreamTransport};
    use std::sync::Arc;
    use std::time::Duration;

    async fn fake_halves() -> ((WorkerSessionReader, WorkerSessionWriter), tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, (peer, _)) = tokio::join!(
            async { tokio::net::TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap() }
        );
        (StreamTransport::new(stream).split(), peer)
    }

    #[tokio::test]
    async fn try_take_returns_none_before_publish() {
        let sessions = AvailableWorkerSessions::new();
        assert!(sessions.try_take("abc").await.is_none());
    }

    #[tokio::test]
    async fn publish_then_try_take_round_trips() {
        let sessions = AvailableWorkerSessions::new();
        let ((reader, mut writer), peer) = fake_halves().await;
        sessions.publish("abc".into(), reader, writer).await;
        let (_reader, mut writer) = sessions.try_take("abc").await.unwrap();
        writer.send_frame(&Frame::Text("ping".into())).await.unwrap();
        let mut peer_transport = StreamTransport::new(peer);
        let got = peer_transport.recv_frame().await.unwrap().unwrap();
        assert_eq!(got.as_text(), Some("ping"));
        assert!(sessions.try_take("abc").await.is_none());
    }

    #[tokio::test]
    async fn wait_for_resolves_once_published_late() {
        let sessions = Arc::new(AvailableWorkerSessions::new());
        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let (_reader, mut writer) = sessions.wait_for("abc").await;
                writer.send_frame(&Frame::Text("hi".into())).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let ((reader, writer), peer) = fake_halves().await;
        sessions.publish("abc".into(), reader, writer).await;

        waiter.await.unwrap();
        let mut peer_transport = StreamTransport::new(peer);
        let got = peer_transport.recv_frame().await.unwrap().unwrap();
        assert_eq!(got.as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn wait_for_does_not_miss_a_publish_racing_the_check() {
        // No sleep here: the waiter and the publisher race to run first,
        // exercising the gap between `try_take` failing and `notified()`
        // being awaited rather than relying on a generous head start.
        let sessions = Arc::new(AvailableWorkerSessions::new());
        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.wait_for("abc").await })
        };

        let ((reader, writer), _peer) = fake_halves().await;
        sessions.publish("abc".into(), reader, writer).await;

        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await;
        assert!(result.is_ok(), "wait_for never resolved after publish");
    }

    #[tokio::test]
    async fn cancel_drops_an_unclaimed_publish() {
        let sessions = AvailableWorkerSessions::new();
        let ((reader, writer), _peer) = fake_halves().await;
        sessions.publish("abc".into(), reader, writer).await;
        sessions.cancel("abc").await;
        assert!(sessions.try_take("abc").await.is_none());
    }
}
