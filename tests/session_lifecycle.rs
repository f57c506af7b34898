//! End-to-end exercise of one client session: upgrade, tile request,
//! explicit disconnect, and the last-session-save policy that follows it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use loolwsd_rs::broker::{DocumentBroker, DocumentKey};
use loolwsd_rs::pipeline;
use loolwsd_rs::pool::WorkerHandle;
use loolwsd_rs::socket::{Frame, FrameSink, FrameSource, FrameTransport, StreamTransport};
use loolwsd_rs::tile_queue::TileQueue;

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (a, (b, _)) = tokio::join!(
        async { TcpStream::connect(addr).await.unwrap() },
        async { listener.accept().await.unwrap() }
    );
    (a, b)
}

#[tokio::test]
async fn single_client_session_saves_on_disconnect_and_forwards_tiles() {
    // The broker's own control channel; unused once the session is attached.
    let (control_ours, _control_theirs) = tcp_pair().await;
    let worker = WorkerHandle { pid: 100, transport: StreamTransport::new(control_ours) };
    let broker = Arc::new(DocumentBroker::new(
        DocumentKey::from_public_path("doc/Report.odt"),
        "doc/Report.odt".to_string(),
        worker,
    ));

    let queue = Arc::new(TileQueue::new());
    let session_id = "sess-1".to_string();
    pipeline::attach_client_session(&broker, session_id.clone(), queue.clone()).await;

    let (client_app, client_test) = tcp_pair().await;
    let (worker_app, worker_test) = tcp_pair().await;

    let (client_reader, client_writer) = StreamTransport::new(client_app).split();
    let (mut test_reader, mut test_writer) = StreamTransport::new(client_test).split();
    let (worker_reader, worker_writer) = StreamTransport::new(worker_app).split();
    let (mut worker_test_reader, _worker_test_writer) = StreamTransport::new(worker_test).split();

    let cancel = CancellationToken::new();
    let pipeline_task = tokio::spawn(pipeline::run_session(
        session_id,
        broker.clone(),
        queue,
        client_reader,
        client_writer,
        worker_reader,
        worker_writer,
        cancel.clone(),
    ));

    test_writer.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), worker_test_reader.recv_frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.as_text(), Some("tile 0 0"));

    // An abrupt close (not an explicit `disconnect` command) leaves
    // `normal_shutdown` false, so teardown of the last session on this
    // document enqueues a save ahead of the EOF sentinel.
    drop(test_writer);
    drop(test_reader);

    let saved = tokio::time::timeout(Duration::from_secs(2), worker_test_reader.recv_frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(saved.as_text(), Some("uno .uno:Save"));

    let result = tokio::time::timeout(Duration::from_secs(2), pipeline_task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(broker.session_count().await, 0);
}
