//! Hooks through which applications drive the server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::session::ServerSession;
use super::stream::ServerStream;
use crate::format::rtsp::message::{Request, Response, StatusCode};
use crate::format::rtsp::policy::Transport;
use crate::format::rtsp::sdp::SessionDescription;
use crate::{Result, RtspError};

/// Identity of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    /// Whether the connection is encrypted.
    pub secure: bool,
}

/// Request path and query, extracted from the request URL.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    /// Path without the leading slash and without any media control suffix.
    pub path: &'a str,
    pub query: Option<&'a str>,
}

pub struct DescribeCtx<'a> {
    pub conn: &'a ConnInfo,
    pub request: &'a Request,
    pub target: RequestTarget<'a>,
}

pub struct AnnounceCtx<'a> {
    pub conn: &'a ConnInfo,
    pub session: &'a Arc<ServerSession>,
    pub request: &'a Request,
    pub target: RequestTarget<'a>,
    /// Description being published, media controls already assigned.
    pub description: &'a SessionDescription,
}

pub struct SetupCtx<'a> {
    pub conn: &'a ConnInfo,
    pub session: &'a Arc<ServerSession>,
    pub request: &'a Request,
    pub target: RequestTarget<'a>,
    pub transport: Transport,
}

/// Context of PLAY, RECORD and PAUSE.
pub struct SessionCtx<'a> {
    pub conn: &'a ConnInfo,
    pub session: &'a Arc<ServerSession>,
    pub request: &'a Request,
    pub target: RequestTarget<'a>,
}

/// Context of GET_PARAMETER and SET_PARAMETER, which may arrive outside a
/// session.
pub struct ParameterCtx<'a> {
    pub conn: &'a ConnInfo,
    pub session: Option<&'a Arc<ServerSession>>,
    pub request: &'a Request,
    pub target: RequestTarget<'a>,
}

/// Application callbacks of a [`Server`](super::Server).
///
/// Every method has a default. Request hooks return the response to send;
/// an `Err` is answered with `400 Bad Request` and a non-2xx response is
/// forwarded as it is. In both cases the session keeps its state.
///
/// Hooks run on the connection task. Long work should be moved to a
/// spawned task.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn on_conn_open(&self, _conn: &ConnInfo) {}

    async fn on_conn_close(&self, _conn: &ConnInfo, _cause: &RtspError) {}

    async fn on_session_open(&self, _session: &Arc<ServerSession>) {}

    async fn on_session_close(&self, _session: &Arc<ServerSession>, _cause: &RtspError) {}

    /// Returns the stream to describe. With a 2xx response and a stream, the
    /// server fills the body with the stream's description.
    async fn on_describe(&self, _ctx: DescribeCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
        Ok((Response::new(StatusCode::NOT_FOUND), None))
    }

    async fn on_announce(&self, _ctx: AnnounceCtx<'_>) -> Result<Response> {
        Ok(Response::new(StatusCode::NOT_IMPLEMENTED))
    }

    /// For sessions that read, the returned stream is the one attached to
    /// the session. Publishing sessions ignore it.
    async fn on_setup(&self, _ctx: SetupCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
        Ok((Response::new(StatusCode::NOT_IMPLEMENTED), None))
    }

    async fn on_play(&self, _ctx: SessionCtx<'_>) -> Result<Response> {
        Ok(Response::ok())
    }

    async fn on_record(&self, _ctx: SessionCtx<'_>) -> Result<Response> {
        Ok(Response::ok())
    }

    async fn on_pause(&self, _ctx: SessionCtx<'_>) -> Result<Response> {
        Ok(Response::ok())
    }

    async fn on_get_parameter(&self, _ctx: ParameterCtx<'_>) -> Result<Response> {
        Ok(Response::ok())
    }

    async fn on_set_parameter(&self, _ctx: ParameterCtx<'_>) -> Result<Response> {
        Ok(Response::ok())
    }
}
