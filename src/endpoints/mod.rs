//! The two HTTP surfaces: the public endpoint clients and WOPI hosts talk
//! to, and the internal endpoint only worker processes on loopback reach.

pub mod discovery;
pub mod internal;
pub mod public;
pub mod ws_adapter;
