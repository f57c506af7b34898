//! Shared wire protocol and the full-duplex read loop built on it.
//!
//! Both the internal endpoint's worker connections and the reader halves of
//! a [`crate::pipeline::SessionPipeline`] are driven by the same primitive:
//! see [`processor::run`].
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 type][payload]`. See
//! [`framing`] for frame types and codec.

pub mod framing;
pub mod processor;

pub use framing::Frame;
pub use processor::{
    read_loop, run, FrameReader, FrameSink, FrameSource, FrameTransport, FrameWriter, StreamTransport,
};
