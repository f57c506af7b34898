//! The public HTTPS surface: discovery document, the document-session
//! websocket upgrade, and the plain-HTTP conversion/upload helpers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::io::AsyncReadExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::broker::DocumentKey;
use crate::context::AppContext;
use crate::error::AppError;
use crate::pipeline;
use crate::socket::{Frame, FrameSink, FrameSource};
use crate::tile_queue::TileQueue;

use super::{discovery, ws_adapter};

/// Directory under a worker's jail where a document's own files live; shared
/// by `/insertfile` and the `/<jailid>/<sub>/<file>` download route.
const JAILED_DOCUMENT_ROOT: &str = "tmp/user/docs";

/// Characters a worker command's `url=` value must not contain unescaped.
const COMMAND_URL_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Build the router for the public listener.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let fileserver_root = ctx.config.fileserverroot.clone().unwrap_or_else(|| PathBuf::from("."));

    Router::new()
        .route("/hosting/discovery", get(discovery_handler))
        .route("/convert-to", post(convert_to_handler).layer(CorsLayer::permissive()))
        .route("/insertfile", post(insertfile_handler).layer(CorsLayer::permissive()))
        .route("/{jailid}/{sub}/{file}", post(download_handler))
        .nest_service("/loleaflet", ServeDir::new(fileserver_root.join("loleaflet")))
        .route("/adminws", get(adminws_stub))
        .fallback(document_session_handler)
        .with_state(ctx)
}

/// `/adminws` is out of scope; acknowledge the route exists without serving it.
async fn adminws_stub() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn discovery_handler(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Result<Response, AppError> {
    let root = ctx.config.fileserverroot.clone().unwrap_or_else(|| PathBuf::from("."));
    let xml = tokio::fs::read_to_string(root.join("discovery.xml"))
        .await
        .map_err(|e| AppError::Other(e.into()))?;

    let advertised = advertised_url(&headers, ctx.config.port);
    let rewritten = discovery::rewrite(&xml, &advertised)?;

    Ok(([("content-type", "text/xml")], rewritten).into_response())
}

fn advertised_url(headers: &HeaderMap, port: u16) -> String {
    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "localhost".to_string());
    format!("https://{host}:{port}")
}

/// The document-editing websocket upgrade: `GET /<document-uri>`.
///
/// Derives the document's canonical key from the request path, joins or
/// creates its broker, allocates a session id, tells the broker's worker to
/// expect a session with that id, then upgrades to a websocket and hands it
/// to [`pipeline::run_session`] once the worker side attaches back through
/// the internal endpoint.
async fn document_session_handler(
    State(ctx): State<Arc<AppContext>>,
    uri: axum::extract::OriginalUri,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let raw_path = uri.0.path().to_string();
    let key = DocumentKey::from_public_path(&raw_path);
    crate::broker::DocumentBroker::validate_uri(&raw_path).map_err(AppError::BadRequest)?;

    let broker = ctx.registry.get_or_create(key.clone(), raw_path.clone(), &ctx.pool).await?;
    let session_id = ctx.ids.next();
    let queue = Arc::new(TileQueue::new());

    pipeline::attach_client_session(&broker, session_id.clone(), queue.clone()).await;
    broker.announce_session(&session_id).await.map_err(AppError::Other)?;

    let acquire_timeout = Duration::from_secs(crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS);
    let cancel = ctx.cancel.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let halves = tokio::time::timeout(acquire_timeout, ctx.available_sessions.wait_for(&session_id)).await;
        let Ok((worker_reader, worker_writer)) = halves else {
            log::warn!("session {session_id} timed out waiting for its worker to attach");
            broker.remove_session(&session_id).await;
            ctx.registry.release(&key).await;
            return;
        };

        let (client_reader, client_writer) = ws_adapter::split(socket);
        let result = pipeline::run_session(
            session_id,
            broker.clone(),
            queue,
            client_reader,
            client_writer,
            worker_reader,
            worker_writer,
            cancel,
        )
        .await;
        if let Err(e) = result {
            log::warn!("session pipeline ended with an error: {e}");
        }
        ctx.registry.release(&key).await;
    }))
}

/// One-shot format conversion: load the uploaded file into a freshly
/// acquired worker, issue `saveas` to the requested format, stream the
/// result back, then release the worker's broker and delete the scratch
/// directory.
async fn convert_to_handler(
    State(ctx): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut file_bytes: Option<Bytes> = None;
    let mut file_name = String::from("document");
    let mut target_format = String::from("pdf");

    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::BadRequest(e.to_string()))? {
        match field.name().unwrap_or("") {
            "format" => {
                target_format = field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
            }
            _ => {
                if let Some(name) = field.file_name() {
                    file_name = name.to_string();
                }
                file_bytes = Some(field.bytes().await.map_err(|e| AppError::BadRequest(e.to_string()))?);
            }
        }
    }
    let file_bytes = file_bytes.ok_or_else(|| AppError::BadRequest("missing file field".into()))?;

    let temp_dir = tempfile::Builder::new()
        .prefix("loolwsd-convert-")
        .tempdir()
        .map_err(|e| AppError::Other(e.into()))?;
    let input_path = temp_dir.path().join(&file_name);
    tokio::fs::write(&input_path, &file_bytes).await.map_err(|e| AppError::Other(e.into()))?;

    let temp_id = ctx.ids.next();
    let key = DocumentKey::for_conversion(&temp_id, &file_name);
    let uri = input_path.to_string_lossy().into_owned();

    let broker = ctx.registry.get_or_create(key.clone(), uri.clone(), &ctx.pool).await?;
    let session_id = ctx.ids.next();
    broker.announce_session(&session_id).await.map_err(AppError::Other)?;

    let acquire_timeout = Duration::from_secs(crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS);
    let (mut worker_reader, mut worker_writer) =
        tokio::time::timeout(acquire_timeout, ctx.available_sessions.wait_for(&session_id))
            .await
            .map_err(|_| AppError::WorkerUnavailable)?;

    let encoded_uri = utf8_percent_encode(&uri, COMMAND_URL_ENCODE_SET);
    worker_writer
        .send_frame(&Frame::Text(format!("load url={encoded_uri}")))
        .await
        .map_err(AppError::Other)?;

    let jailed_name = PathBuf::from(&file_name).with_extension(&target_format);
    let jailed_name = jailed_name.to_string_lossy();
    worker_writer
        .send_frame(&Frame::Text(format!(
            "saveas url={jailed_name} format={target_format} options="
        )))
        .await
        .map_err(AppError::Other)?;

    let output_path = loop {
        match worker_reader.recv_frame().await.map_err(AppError::Other)? {
            Some(frame) => {
                if let Some(result) = frame.as_text().and_then(|t| t.strip_prefix("saveas: ")) {
                    break PathBuf::from(result.trim());
                }
            }
            None => return Err(AppError::LoadError(uri)),
        }
    };

    let mut output_bytes = Vec::new();
    tokio::fs::File::open(&output_path)
        .await
        .map_err(|e| AppError::Other(e.into()))?
        .read_to_end(&mut output_bytes)
        .await
        .map_err(|e| AppError::Other(e.into()))?;

    ctx.registry.release(&key).await;

    Ok(([("content-type", "application/octet-stream")], output_bytes).into_response())
}

/// Accepts an uploaded file under a worker's jail for a later `insertfile`
/// command, rejecting any `childid`/`name` that attempts a path escape.
async fn insertfile_handler(
    State(ctx): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<StatusCode, AppError> {
    let mut childid = None;
    let mut name = None;
    let mut bytes = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::BadRequest(e.to_string()))? {
        match field.name().unwrap_or("") {
            "childid" => childid = Some(field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?),
            "name" => name = Some(field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?),
            _ => bytes = Some(field.bytes().await.map_err(|e| AppError::BadRequest(e.to_string()))?),
        }
    }

    let childid = childid.ok_or_else(|| AppError::BadRequest("missing childid".into()))?;
    let name = name.ok_or_else(|| AppError::BadRequest("missing name".into()))?;
    let bytes = bytes.ok_or_else(|| AppError::BadRequest("missing file".into()))?;

    if childid.contains('/') || name.contains('/') {
        return Err(AppError::BadRequest("childid and name must not contain '/'".into()));
    }

    let dest_dir = ctx.config.childroot.join(&childid).join(JAILED_DOCUMENT_ROOT).join("insertfile");
    tokio::fs::create_dir_all(&dest_dir).await.map_err(|e| AppError::Other(e.into()))?;
    tokio::fs::write(dest_dir.join(&name), &bytes).await.map_err(|e| AppError::Other(e.into()))?;

    Ok(StatusCode::OK)
}

/// Downloads a file a worker previously staged under its jail (via
/// `/convert-to` or `/insertfile`) at `/<jailid>/<sub>/<file>`, then
/// recursively removes the `<sub>` directory it was served from.
async fn download_handler(
    State(ctx): State<Arc<AppContext>>,
    Path((jailid, sub, file)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    if [&jailid, &sub, &file].iter().any(|s| s.contains("..") || s.contains('/')) {
        return Err(AppError::BadRequest("path segment must not escape its directory".into()));
    }

    let sub_dir = ctx.config.childroot.join(&jailid).join(JAILED_DOCUMENT_ROOT).join(&sub);
    let path = sub_dir.join(&file);
    let bytes = tokio::fs::read(&path).await.map_err(|_| AppError::NotFound(path.display().to_string()))?;
    let _ = tokio::fs::remove_dir_all(&sub_dir).await;

    Ok(([("content-type", "application/octet-stream")], bytes).into_response())
}
