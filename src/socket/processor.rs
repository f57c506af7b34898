//! The shared full-duplex frame read loop.
//!
//! Every long-lived connection in the system — the internal endpoint's
//! worker streams and the reader halves of a [`crate::pipeline::SessionPipeline`]
//! — is driven by the same primitive: read a frame, hand it to a
//! caller-supplied handler, and keep going until the peer closes the
//! connection, the handler says to stop, or the process-wide termination
//! flag fires.

use std::collections::VecDeque;
use std::ops::ControlFlow;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::framing::{Frame, FrameDecoder};

/// Abstraction over "something that speaks the internal frame protocol".
///
/// Implemented for any `AsyncRead + AsyncWrite` (the internal TCP socket);
/// the public endpoint's websocket upgrade is adapted to this trait in
/// `endpoints::public` so both sides of a pipeline share this one loop.
pub trait FrameTransport {
    /// Read and return the next frame, or `None` on a clean peer close.
    fn recv_frame(&mut self) -> impl std::future::Future<Output = anyhow::Result<Option<Frame>>> + Send;

    /// Write a frame to the peer.
    fn send_frame(&mut self, frame: &Frame) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// [`FrameTransport`] over any length-prefixed byte stream (the internal
/// endpoint's plain TCP connections).
pub struct StreamTransport<S> {
    stream: S,
    decoder: FrameDecoder,
    read_buf: [u8; 8192],
    pending: VecDeque<Frame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> StreamTransport<S> {
    /// Wrap `stream` for frame-at-a-time reads and writes.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            read_buf: [0u8; 8192],
            pending: VecDeque::new(),
        }
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameTransport for StreamTransport<S> {
    async fn recv_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend(self.decoder.feed(&self.read_buf[..n])?);
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.stream.write_all(&frame.encode()).await?;
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> StreamTransport<S> {
    /// Split into independent read and write halves so a
    /// [`crate::pipeline::SessionPipeline`] can run its reader and forwarder
    /// as separate concurrent tasks over the same underlying stream.
    pub fn split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                read,
                decoder: self.decoder,
                read_buf: self.read_buf,
                pending: self.pending,
            },
            FrameWriter { write },
        )
    }
}

/// A frame source: something a reader task can pull decoded frames from.
///
/// Separate from [`FrameTransport`] so the two halves of a split duplex
/// connection (or a websocket's independently-typed sink/stream halves) can
/// each implement only the direction they need.
pub trait FrameSource: Send {
    fn recv_frame(&mut self) -> impl std::future::Future<Output = anyhow::Result<Option<Frame>>> + Send;
}

/// A frame sink: something a forwarder task can push encoded frames to.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &Frame) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Read half of a split [`StreamTransport`].
pub struct FrameReader<R> {
    read: R,
    decoder: FrameDecoder,
    read_buf: [u8; 8192],
    pending: VecDeque<Frame>,
}

impl<R: AsyncRead + Unpin + Send> FrameSource for FrameReader<R> {
    async fn recv_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.read.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend(self.decoder.feed(&self.read_buf[..n])?);
        }
    }
}

/// Write half of a split [`StreamTransport`].
pub struct FrameWriter<W> {
    write: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for FrameWriter<W> {
    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.write.write_all(&frame.encode()).await?;
        Ok(())
    }
}

/// Drive `transport`, calling `on_frame` for every decoded frame, until the
/// peer closes the connection, `on_frame` requests a break, or `cancel`
/// fires.
///
/// This is the shared primitive named "SocketProcessor" in the design: every
/// long-lived connection in the system is a call to this function with a
/// different handler.
pub async fn run<T, F>(
    transport: &mut T,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> anyhow::Result<()>
where
    T: FrameTransport,
    F: FnMut(Frame) -> ControlFlow<()>,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = transport.recv_frame() => {
                match frame? {
                    None => return Ok(()),
                    Some(frame) => {
                        if on_frame(frame).is_break() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Read-only variant of [`run`] for a split [`FrameSource`] half, used by the
/// reader tasks of a [`crate::pipeline::SessionPipeline`] that forward into a
/// queue rather than replying on the same connection.
pub async fn read_loop<T, F>(
    source: &mut T,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> anyhow::Result<()>
where
    T: FrameSource,
    F: FnMut(Frame) -> ControlFlow<()>,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = source.recv_frame() => {
                match frame? {
                    None => return Ok(()),
                    Some(frame) => {
                        if on_frame(frame).is_break() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn run_dispatches_frames_until_peer_closes() {
        let (client, server) = duplex(4096);
        let mut server_transport = StreamTransport::new(server);
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(async move {
            let mut client_transport = StreamTransport::new(client);
            client_transport.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
            client_transport.send_frame(&Frame::Text("canceltiles".into())).await.unwrap();
            // dropping client_transport closes the stream
        });

        let mut seen = Vec::new();
        run(&mut server_transport, &cancel, |frame| {
            seen.push(frame);
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

        writer.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_text(), Some("tile 0 0"));
        assert_eq!(seen[1].as_text(), Some("canceltiles"));
    }

    #[tokio::test]
    async fn split_halves_forward_independently() {
        let (client, server) = duplex(4096);
        let (mut server_reader, mut server_writer) = StreamTransport::new(server).split();

        let writer = tokio::spawn(async move {
            let mut client_transport = StreamTransport::new(client);
            client_transport.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
            let reply = client_transport.recv_frame().await.unwrap().unwrap();
            assert_eq!(reply.as_text(), Some("ack"));
        });

        let frame = server_reader.recv_frame().await.unwrap().unwrap();
        assert_eq!(frame.as_text(), Some("tile 0 0"));
        server_writer.send_frame(&Frame::Text("ack".into())).await.unwrap();

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn recv_frame_drains_multiple_frames_from_one_read() {
        let (client, server) = duplex(4096);
        let mut server_transport = StreamTransport::new(server);

        let mut client_transport = StreamTransport::new(client);
        // Both frames land in the same write, so they arrive in one `read()`
        // on the server side and must both be handed out, in order, before
        // the next read.
        client_transport.send_frame(&Frame::Text("tile 0 0".into())).await.unwrap();
        client_transport.send_frame(&Frame::Text("tile 0 1".into())).await.unwrap();
        client_transport.send_frame(&Frame::Text("canceltiles".into())).await.unwrap();
        drop(client_transport);

        let first = server_transport.recv_frame().await.unwrap().unwrap();
        let second = server_transport.recv_frame().await.unwrap().unwrap();
        let third = server_transport.recv_frame().await.unwrap().unwrap();
        assert_eq!(first.as_text(), Some("tile 0 0"));
        assert_eq!(second.as_text(), Some("tile 0 1"));
        assert_eq!(third.as_text(), Some("canceltiles"));
        assert!(server_transport.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let (_client, server) = duplex(4096);
        let mut server_transport = StreamTransport::new(server);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut called = false;
        run(&mut server_transport, &cancel, |_frame| {
            called = true;
            ControlFlow::Continue(())
        })
        .await
        .unwrap();

        assert!(!called);
    }
}
