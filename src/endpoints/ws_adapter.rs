//! Adapts an `axum` websocket's split halves to the shared [`FrameSource`]/
//! [`FrameSink`] traits, so a [`crate::pipeline::SessionPipeline`] drives a
//! public client exactly the way it drives a plain-TCP worker connection.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::socket::{Frame, FrameSink, FrameSource};

pub struct WsReader(pub SplitStream<WebSocket>);
pub struct WsWriter(pub SplitSink<WebSocket, Message>);

/// Split a client websocket into the two halves a [`crate::pipeline`] session expects.
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader(stream), WsWriter(sink))
}

impl FrameSource for WsReader {
    async fn recv_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            match self.0.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data.to_vec()))),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping/Pong are answered transparently by axum; nothing to surface here.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            }
        }
    }
}

impl FrameSink for WsWriter {
    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.clone().into()),
            Frame::Binary(data) => Message::Binary(data.clone().into()),
        };
        self.0.send(message).await.map_err(Into::into)
    }
}
