//! The per-session pipeline: the four concurrent activities that bridge one
//! client connection to its matching worker-side session.
//!
//! - **Inbound reader**: reads frames from the client, enqueues them onto
//!   the session's [`TileQueue`].
//! - **Queue consumer**: drains the queue, forwards each message to the
//!   worker.
//! - **Worker reader**: reads frames from the worker, forwards them to the
//!   client, and captures `saveas:` results.
//! - **Supervision**: decides, on teardown, whether the last-session save
//!   policy applies, then lets the other three activities wind down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::{DocumentBroker, UserSession};
use crate::socket::{Frame, FrameSink, FrameSource};
use crate::tile_queue::{TileQueue, EOF};

/// Run one client session's full pipeline to completion.
///
/// `client_reader`/`client_writer` and `worker_reader`/`worker_writer` are
/// the split halves of the two full-duplex connections involved; the
/// pipeline owns all four tasks and only returns once every one of them has
/// wound down.
pub async fn run_session<CR, CW, WR, WW>(
    session_id: String,
    broker: Arc<DocumentBroker>,
    queue: Arc<TileQueue>,
    mut client_reader: CR,
    mut client_writer: CW,
    mut worker_reader: WR,
    mut worker_writer: WW,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    CR: FrameSource + 'static,
    CW: FrameSink + 'static,
    WR: FrameSource + 'static,
    WW: FrameSink + 'static,
{
    let mut normal_shutdown = false;

    // The queue consumer and the worker-side forwarder both run for the
    // whole lifetime of the session; only the inbound reader's exit drives
    // teardown, so it alone is awaited directly below.
    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let msg = queue.take().await;
                if msg == EOF {
                    return Ok::<(), anyhow::Error>(());
                }
                worker_writer.send_frame(&Frame::Text(msg)).await?;
            }
        })
    };

    let worker_forward = {
        let cancel = cancel.clone();
        let session_id = session_id.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            crate::socket::read_loop(&mut worker_reader, &cancel, |frame| {
                if let Some(text) = frame.as_text() {
                    if let Some(result) = text.strip_prefix("saveas: ") {
                        let broker = broker.clone();
                        let session_id = session_id.clone();
                        let result = result.to_string();
                        tokio::spawn(async move {
                            if let Some(session) = broker.get_session(&session_id).await {
                                session.lock().await.save_as_result = Some(result);
                            }
                        });
                    }
                }
                std::ops::ControlFlow::Continue(())
            })
            .await?;
            client_writer.send_frame(&Frame::Text("disconnected".into())).await.ok();
            Ok::<(), anyhow::Error>(())
        })
    };

    // Enqueued inline, on this one task, rather than spawned per frame: the
    // cancel-collapse policy depends on `canceltiles` reaching the queue
    // strictly after the tile frames that preceded it on the wire, which a
    // detached task per frame cannot guarantee.
    let session = broker.get_session(&session_id).await;
    let inbound_res: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = client_reader.recv_frame() => {
                    let Some(frame) = frame? else { return Ok(()) };
                    let Some(text) = frame.as_text() else { continue };
                    if let Some(session) = &session {
                        // Best-effort: a contended lock just means this touch
                        // is skipped, the next frame will update it.
                        if let Ok(mut guard) = session.try_lock() {
                            guard.touch();
                        }
                    }
                    if text.split_whitespace().next() == Some("disconnect") {
                        normal_shutdown = true;
                        return Ok(());
                    }
                    queue.put(text.to_string()).await;
                }
            }
        }
    }
    .await;

    let load_error = match &session {
        Some(session) => session.lock().await.load_error,
        None => false,
    };

    supervise_teardown(&broker, &session_id, &queue, normal_shutdown, load_error).await;

    let consumer_res = consumer.await;
    worker_forward.abort();

    broker.remove_session(&session_id).await;

    inbound_res?;
    consumer_res??;
    Ok(())
}

/// Decide whether this session's teardown should trigger a save, per the
/// last-session-save policy, then always signal the queue consumer to stop.
async fn supervise_teardown(
    broker: &DocumentBroker,
    session_id: &str,
    queue: &TileQueue,
    normal_shutdown: bool,
    load_error: bool,
) {
    let is_last = broker.session_count().await <= 1;
    if is_last && !normal_shutdown && !load_error {
        log::info!("session {session_id} was the last on its document, saving before teardown");
        queue.put("uno .uno:Save").await;
    } else {
        queue.clear().await;
    }
    queue.put(EOF).await;
}

/// Construct the user-facing half of a session and register it (and its
/// start time) with `broker`, returning whether it won the edit lock.
pub async fn attach_client_session(broker: &DocumentBroker, id: String, queue: Arc<TileQueue>) -> bool {
    let got_lock = broker.add_session(UserSession::new_to_client(id.clone(), queue)).await;
    log::debug!("session {id} attached (edit_lock={got_lock})");
    got_lock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerHandle;
    use crate::socket::StreamTransport;
    use std::time::Duration;

    async fn duplex_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) = tokio::join!(
            async { tokio::net::TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap() }
        );
        (a, b)
    }

    async fn test_broker() -> Arc<DocumentBroker> {
        let (worker_side, _their_side) = duplex_pair().await;
        let worker = WorkerHandle { pid: 1, transport: StreamTransport::new(worker_side) };
        Arc::new(DocumentBroker::new(
            crate::broker::DocumentKey::from_public_path("doc/Test.odt"),
            "doc/Test.odt".to_string(),
            worker,
        ))
    }

    #[tokio::test]
    async fn single_tile_frame_is_forwarded_to_worker() {
        let broker = test_broker().await;
        let queue = Arc::new(TileQueue::new());
        attach_client_session(&broker, "s1".into(), queue.clone()).await;

        let (client_a, client_b) = duplex_pair().await;
        let (worker_a, worker_b) = duplex_pair().await;

        let (client_reader, _client_writer) = StreamTransport::new(client_a).split();
        let (mut peer_reader, mut peer_writer) = StreamTransport::new(client_b).split();
        let (worker_reader, worker_writer) = StreamTransport::new(worker_a).split();
        let (mut worker_peer_reader, mut worker_peer_writer) = StreamTransport::new(worker_b).split();

        let cancel = CancellationToken::new();
        let broker2 = broker.clone();
        let queue2 = queue.clone();
        let session_id = "s1".to_string();
        let cancel2 = cancel.clone();
        let pipeline = tokio::spawn(async move {
            run_session(
                session_id,
                broker2,
                queue2,
                client_reader,
                _client_writer,
                worker_reader,
                worker_writer,
                cancel2,
            )
            .await
        });

        peer_writer.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
        peer_writer.send_frame(&Frame::Text("disconnect".into())).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), worker_peer_reader.recv_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_text(), Some("tile 0 0"));

        drop(peer_writer);
        let _ = worker_peer_writer.send_frame(&Frame::Text("ignored".into())).await;
        drop(worker_peer_reader);
        drop(worker_peer_writer);
        drop(peer_reader);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), pipeline).await;
    }

    #[tokio::test]
    async fn canceltiles_collapses_preceding_tiles_even_when_coalesced_on_the_wire() {
        let broker = test_broker().await;
        let queue = Arc::new(TileQueue::new());
        attach_client_session(&broker, "s1".into(), queue.clone()).await;

        let (client_a, client_b) = duplex_pair().await;
        let (worker_a, worker_b) = duplex_pair().await;

        let (client_reader, client_writer) = StreamTransport::new(client_a).split();
        let (mut peer_reader, mut peer_writer) = StreamTransport::new(client_b).split();
        let (worker_reader, worker_writer) = StreamTransport::new(worker_a).split();
        let (mut worker_peer_reader, _worker_peer_writer) = StreamTransport::new(worker_b).split();

        let cancel = CancellationToken::new();
        let pipeline = tokio::spawn(run_session(
            "s1".to_string(),
            broker.clone(),
            queue.clone(),
            client_reader,
            client_writer,
            worker_reader,
            worker_writer,
            cancel.clone(),
        ));

        // All four frames are written back-to-back, so a single `read()` on
        // the pipeline side can decode them together; the cancel must still
        // reach the queue only after having dropped the two preceding tiles.
        peer_writer.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
        peer_writer.send_frame(&Frame::Text("tile 0 1".into())).await.unwrap();
        peer_writer.send_frame(&Frame::Text("canceltiles".into())).await.unwrap();
        peer_writer.send_frame(&Frame::Text("text hello".into())).await.unwrap();
        peer_writer.send_frame(&Frame::Text("disconnect".into())).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), worker_peer_reader.recv_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), worker_peer_reader.recv_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.as_text(), Some("canceltiles"));
        assert_eq!(second.as_text(), Some("text hello"));

        drop(peer_writer);
        drop(peer_reader);
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), pipeline).await;
    }
}
