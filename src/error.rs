use std::num::ParseIntError;
use thiserror::Error;

use crate::format::rtp::RTPError;
use crate::format::rtsp::{Method, Scheme, StatusCode, Transport};

#[derive(Error, Debug)]
pub enum RtspError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The URL scheme forces TCP but a different transport was requested.
    #[error("the '{scheme}' scheme can't be used with a non-TCP transport protocol (requested {transport})")]
    TransportNotAllowed { scheme: Scheme, transport: Transport },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("timed out")]
    Timeout,

    #[error("bad status code: {status} ({message}) in response to {method}")]
    BadStatus {
        method: Method,
        status: StatusCode,
        message: String,
    },

    #[error("can't send {method} in state {state}")]
    InvalidState { method: Method, state: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("terminated")]
    Terminated,

    #[error("stream closed")]
    StreamClosed,

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("rtp error: {0}")]
    Rtp(#[from] RTPError),
}

impl RtspError {
    /// Whether the error ends the connection it happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RtspError::Io(_)
                | RtspError::Framing(_)
                | RtspError::Timeout
                | RtspError::Tls(_)
                | RtspError::Terminated
                | RtspError::TransportNotAllowed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RtspError>;
