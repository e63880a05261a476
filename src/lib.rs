#![doc(html_root_url = "https://docs.rs/rtspio/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # rtspio - async RTSP client and server
//!
//! `rtspio` moves RTP media over RTSP sessions. It negotiates the media
//! transport from the URL scheme and the caller's preference, frames
//! interleaved packets on the control connection, tracks session state on
//! both ends and fans published streams out to every reader.
//!
//! ## Reading a stream
//!
//! ```rust,no_run
//! use rtspio::format::rtsp::{Client, ClientOptions, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(ClientOptions::new().with_transport(Transport::Tcp));
//!     client.on_packet_rtp_any(|media, packet| {
//!         println!("media {}: {} bytes", media, packet.payload.len());
//!     });
//!     client.start_reading("rtsp://example.com:8554/stream").await?;
//!     client.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `format::rtsp`: URLs, transport policy, message framing, SDP, the
//!   client and the server
//! - `format::rtp`: RTP packet parsing and marshaling
//! - `config`: settings from the environment and config files
//! - `error`: the crate error type and `Result` alias

/// Configuration module
pub mod config;

/// Error types and utilities
pub mod error;

/// RTSP and RTP implementations
pub mod format;

pub use error::{Result, RtspError};
