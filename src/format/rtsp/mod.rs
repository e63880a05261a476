//! # Real Time Streaming Protocol (RTSP)
//!
//! Client and server sides of RTSP 1.0 with RTP carried over UDP, UDP
//! multicast or TCP interleaved frames.
//!
//! The URL scheme selects what a connection may do:
//!
//! | scheme   | connection | media transports        |
//! |----------|------------|-------------------------|
//! | `rtsp`   | TCP        | UDP, multicast, TCP     |
//! | `rtspt`  | TCP        | TCP only                |
//! | `rtsps`  | TLS        | TCP only                |
//!
//! See [`Client`] and [`server::Server`].

pub mod auth;
pub mod callbacks;
pub mod client;
pub mod conn;
pub mod dial;
pub mod message;
pub mod policy;
pub mod sdp;
pub mod server;
pub mod transport;
pub mod url;

pub use callbacks::PacketCallbacks;
pub use client::{Client, ClientOptions, ClientState};
pub use message::{Headers, Method, Request, Response, StatusCode};
pub use policy::{SchemePolicy, Transport};
pub use sdp::{MediaDescription, SessionDescription};
pub use server::{Server, ServerConfig, ServerHandler, ServerSession, ServerStream, SessionState};
pub use transport::TransportHeader;
pub use self::url::{canonical_addr, RtspUrl, Scheme};
