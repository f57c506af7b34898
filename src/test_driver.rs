//! The `--test` mode line-by-line stdin driver.
//!
//! Rather than binding the public listener and a real websocket client, this
//! wires one document session directly to stdin/stdout: every line typed is
//! sent as a frame to the worker, and every frame the worker sends back is
//! printed. Ends the process when stdin reaches EOF.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::broker::DocumentKey;
use crate::context::AppContext;
use crate::pipeline;
use crate::socket::{Frame, FrameSink, FrameSource};
use crate::tile_queue::TileQueue;

/// Synthetic document URI the driver opens; there is no real client request
/// behind it, so any fixed key will do.
const TEST_DOCUMENT_URI: &str = "/test";

/// Drive one document session from stdin until it reaches EOF, then cancel
/// the process-wide shutdown token.
pub async fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let key = DocumentKey::from_public_path(TEST_DOCUMENT_URI);
    let broker = ctx
        .registry
        .get_or_create(key.clone(), TEST_DOCUMENT_URI.to_string(), &ctx.pool)
        .await?;
    let session_id = ctx.ids.next();
    let queue = Arc::new(TileQueue::new());

    pipeline::attach_client_session(&broker, session_id.clone(), queue.clone()).await;
    broker.announce_session(&session_id).await?;

    let acquire_timeout = Duration::from_secs(crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS);
    let (worker_reader, worker_writer) =
        tokio::time::timeout(acquire_timeout, ctx.available_sessions.wait_for(&session_id))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the test session's worker to attach"))?;

    println!("Enter requests, one per line. Enter EOF to finish.");

    let result = pipeline::run_session(
        session_id,
        broker.clone(),
        queue,
        StdinSource::new(),
        StdoutSink,
        worker_reader,
        worker_writer,
        ctx.cancel.clone(),
    )
    .await;

    ctx.registry.release(&key).await;
    ctx.cancel.cancel();
    result
}

/// Reads stdin line by line, handing each line to the pipeline as a text frame.
struct StdinSource {
    lines: tokio::io::Lines<BufReader<tokio::io::Stdin>>,
}

impl StdinSource {
    fn new() -> Self {
        Self { lines: BufReader::new(tokio::io::stdin()).lines() }
    }
}

impl FrameSource for StdinSource {
    async fn recv_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        Ok(self.lines.next_line().await?.map(Frame::Text))
    }
}

/// Prints every frame the worker sends back for this session to stdout.
struct StdoutSink;

impl FrameSink for StdoutSink {
    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        if let Some(text) = frame.as_text() {
            println!("{text}");
        }
        Ok(())
    }
}
