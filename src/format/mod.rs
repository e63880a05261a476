//! Streaming protocol implementations.

pub mod rtp;
pub mod rtsp;
