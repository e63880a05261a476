//! One accepted RTSP connection on the server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::net::TcpStream;

use super::handler::{
    AnnounceCtx, ConnInfo, DescribeCtx, ParameterCtx, RequestTarget, ServerHandler, SessionCtx, SetupCtx,
};
use super::session::{next_state, MediaTarget, ServerSession, SessionState};
use super::ServerHandle;
use crate::format::rtsp::conn::{split, BoxedReader, ConnWriter, FrameReader, InterleavedFrame, Message};
use crate::format::rtsp::dial::BoxedStream;
use crate::format::rtsp::message::{Method, Request, Response, StatusCode};
use crate::format::rtsp::policy::Transport;
use crate::format::rtsp::sdp::SessionDescription;
use crate::format::rtsp::transport::TransportHeader;
use crate::format::rtsp::url::RtspUrl;
use crate::RtspError;

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, GET_PARAMETER, SET_PARAMETER, TEARDOWN";

/// Serves a connection until the peer leaves, an error occurs or the server
/// closes.
pub(crate) async fn serve(shared: ServerHandle, tcp: TcpStream, remote_addr: SocketAddr, id: u64) {
    let _ = tcp.set_nodelay(true);

    let (stream, secure): (BoxedStream, bool) = match shared.tls_acceptor() {
        Some(acceptor) => {
            match tokio::time::timeout(shared.config().read_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => (Box::new(tls) as BoxedStream, true),
                Ok(Err(e)) => {
                    warn!("TLS handshake with {} failed: {}", remote_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake with {} timed out", remote_addr);
                    return;
                }
            }
        }
        None => (Box::new(tcp) as BoxedStream, false),
    };

    let info = ConnInfo {
        id,
        remote_addr,
        secure,
    };
    info!("connection {} opened from {}", id, remote_addr);

    let handler = shared.handler();
    handler.on_conn_open(&info).await;

    let (reader, writer) = split(stream);
    let mut conn = ServerConn {
        shared,
        handler: handler.clone(),
        info,
        writer,
        sessions: HashMap::new(),
        channels: HashMap::new(),
    };

    let cause = conn.run(reader).await;
    info!("connection {} closed: {}", conn.info.id, cause);
    conn.release(&cause);
    {
        let mut writer = conn.writer.lock().await;
        let _ = writer.shutdown().await;
    }
    handler.on_conn_close(&conn.info, &cause).await;
}

struct ServerConn {
    shared: ServerHandle,
    handler: Arc<dyn ServerHandler>,
    info: ConnInfo,
    writer: ConnWriter,
    /// Sessions created or resumed on this connection.
    sessions: HashMap<String, Arc<ServerSession>>,
    /// Interleaved channel → (session, media, is RTCP).
    channels: HashMap<u8, (Arc<ServerSession>, usize, bool)>,
}

impl ServerConn {
    async fn run(&mut self, mut reader: FrameReader<BoxedReader>) -> RtspError {
        let mut shutdown = self.shared.subscribe_shutdown();
        if *shutdown.borrow() {
            return RtspError::Terminated;
        }

        loop {
            let config = self.shared.config();
            let timeout = if self.has_active_session() {
                config.session_timeout
            } else {
                config.read_timeout
            };
            let write_timeout = config.write_timeout;

            let message = tokio::select! {
                res = reader.read_message_timeout(timeout) => res,
                _ = shutdown.changed() => return RtspError::Terminated,
            };
            let message = match message {
                Ok(m) => m,
                Err(e) => return e,
            };

            match message {
                Message::Request(req) => {
                    let res = self.handle_request(req).await;
                    let write = async { self.writer.lock().await.write_response(&res).await };
                    match tokio::time::timeout(write_timeout, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return e,
                        Err(_) => return RtspError::Timeout,
                    }
                }
                Message::Interleaved(frame) => self.route_frame(frame),
                Message::Response(res) => {
                    debug!("ignoring response {} from {}", res.status, self.info.remote_addr)
                }
            }
        }
    }

    fn has_active_session(&self) -> bool {
        self.sessions
            .values()
            .any(|s| matches!(s.state(), SessionState::Playing | SessionState::Recording))
    }

    fn route_frame(&self, frame: InterleavedFrame) {
        match self.channels.get(&frame.channel) {
            Some((session, media, is_rtcp)) => session.deliver(*media, *is_rtcp, &frame.payload),
            None => trace!("frame on unknown channel {}", frame.channel),
        }
    }

    /// Closes or detaches the sessions of the connection.
    fn release(&mut self, cause: &RtspError) {
        for (_, session) in self.sessions.drain() {
            if session.owner() != Some(self.info.id) {
                continue;
            }
            let active = matches!(session.state(), SessionState::Playing | SessionState::Recording);
            if active || session.transport() == Some(Transport::Tcp) {
                session.close_with(session_cause(cause));
            } else {
                session.detach(self.shared.config().session_timeout);
            }
        }
        self.channels.clear();
    }

    async fn handle_request(&mut self, req: Request) -> Response {
        debug!("{} {} from {}", req.method, req.uri, self.info.remote_addr);

        let mut res = match req.method {
            Method::Options => Response::ok().with_header("Public", PUBLIC_METHODS),
            Method::Describe => self.handle_describe(&req).await,
            Method::Other(_) => Response::new(StatusCode::NOT_IMPLEMENTED),
            _ => self.handle_session_request(&req).await,
        };

        if let Some(cseq) = req.headers.get("CSeq") {
            res.headers.set("CSeq", cseq);
        }
        res.headers.set("Server", self.shared.config().server_name.clone());
        res.headers.set(
            "Date",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        debug!("{} response: {}", req.method, res.status);
        res
    }

    async fn handle_describe(&mut self, req: &Request) -> Response {
        let url = match RtspUrl::parse(&req.uri) {
            Ok(url) => url,
            Err(_) => return Response::new(StatusCode::BAD_REQUEST),
        };
        let (path, query) = request_target(&url);

        let ctx = DescribeCtx {
            conn: &self.info,
            request: req,
            target: RequestTarget {
                path: &path,
                query: query.as_deref(),
            },
        };
        let (mut res, stream) = match self.handler.on_describe(ctx).await {
            Ok(reply) => reply,
            Err(e) => return handler_failed(&Method::Describe, e),
        };
        if !res.status.is_success() {
            return res;
        }

        if let Some(stream) = stream {
            if !stream.is_initialized() || stream.is_closed() {
                return Response::new(StatusCode::NOT_FOUND);
            }
            res.headers.set("Content-Base", format!("{}/", url.without_credentials().as_str().trim_end_matches('/')));
            res = res.with_body("application/sdp", stream.description().marshal());
        }
        res
    }

    async fn handle_session_request(&mut self, req: &Request) -> Response {
        let url = match RtspUrl::parse(&req.uri) {
            Ok(url) => url,
            Err(_) => return Response::new(StatusCode::BAD_REQUEST),
        };
        let (path, query) = request_target(&url);

        let session = match req.headers.session_id() {
            Some(id) => match self.lookup_session(id) {
                Some(session) => Some(session),
                None => return Response::new(StatusCode::SESSION_NOT_FOUND),
            },
            None => None,
        };

        match (&req.method, session) {
            (Method::Announce, session) => self.handle_announce(req, session, &path, query.as_deref()).await,
            (Method::Setup, session) => self.handle_setup(req, session, &path, query.as_deref()).await,
            (Method::GetParameter, session) | (Method::SetParameter, session) => {
                self.handle_parameter(req, session, &path, query.as_deref()).await
            }
            (Method::Teardown, Some(session)) => self.handle_teardown(session),
            (Method::Play, Some(session)) | (Method::Record, Some(session)) | (Method::Pause, Some(session)) => {
                self.handle_control(req, session, &path, query.as_deref()).await
            }
            (_, None) => Response::new(StatusCode::SESSION_NOT_FOUND),
            (_, Some(_)) => Response::new(StatusCode::NOT_IMPLEMENTED),
        }
    }

    /// Finds a session addressed by a request. Sessions left by their
    /// connection, and non-TCP sessions in general, can be taken over.
    fn lookup_session(&mut self, id: &str) -> Option<Arc<ServerSession>> {
        let session = self.shared.session(id)?;
        match session.owner() {
            Some(owner) if owner == self.info.id => {}
            Some(_) if session.transport() == Some(Transport::Tcp) => return None,
            _ => {
                debug!("session {} resumed on connection {}", id, self.info.id);
                session.set_owner(self.info.id);
                self.sessions.insert(id.to_string(), session.clone());
            }
        }
        session.touch();
        Some(session)
    }

    fn new_session(&self) -> Arc<ServerSession> {
        Arc::new(ServerSession::new(
            self.shared.new_session_id(),
            Arc::downgrade(&self.shared),
            self.info.remote_addr,
            self.info.id,
        ))
    }

    async fn commit(&mut self, session: &Arc<ServerSession>, is_new: bool) {
        if is_new {
            self.shared.insert_session(session.clone());
            self.sessions.insert(session.id().to_string(), session.clone());
            self.handler.on_session_open(session).await;
        }
    }

    fn with_session_header(&self, mut res: Response, session: &ServerSession) -> Response {
        res.headers.set("Session", session.header_value(self.shared.config().session_timeout));
        res
    }

    async fn handle_announce(
        &mut self,
        req: &Request,
        session: Option<Arc<ServerSession>>,
        path: &str,
        query: Option<&str>,
    ) -> Response {
        let (session, is_new) = match session {
            Some(s) => (s, false),
            None => (self.new_session(), true),
        };
        let next = match next_state(session.state(), Method::Announce, session.media_count(), session.announced_count()) {
            Ok(next) => next,
            Err(status) => return Response::new(status),
        };

        let is_sdp = req
            .headers
            .get("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().eq_ignore_ascii_case("application/sdp"))
            .unwrap_or(false);
        if !is_sdp {
            debug!("ANNOUNCE without an SDP body");
            return Response::new(StatusCode::BAD_REQUEST);
        }
        let mut description = match std::str::from_utf8(&req.body)
            .map_err(|_| RtspError::Protocol("description is not valid UTF-8".into()))
            .and_then(SessionDescription::parse)
        {
            Ok(d) if !d.media.is_empty() => d,
            Ok(_) => return Response::new(StatusCode::BAD_REQUEST),
            Err(e) => {
                debug!("invalid description: {}", e);
                return Response::new(StatusCode::BAD_REQUEST);
            }
        };
        description.ensure_controls();

        let ctx = AnnounceCtx {
            conn: &self.info,
            session: &session,
            request: req,
            target: RequestTarget { path, query },
            description: &description,
        };
        let res = match self.handler.on_announce(ctx).await {
            Ok(res) => res,
            Err(e) => return handler_failed(&Method::Announce, e),
        };
        if !res.status.is_success() {
            return res;
        }

        session.set_announced(description, path, query);
        session.set_state(next);
        self.commit(&session, is_new).await;
        self.with_session_header(res, &session)
    }

    async fn handle_setup(
        &mut self,
        req: &Request,
        session: Option<Arc<ServerSession>>,
        path: &str,
        query: Option<&str>,
    ) -> Response {
        let (session, is_new) = match session {
            Some(s) => (s, false),
            None => (self.new_session(), true),
        };
        let next = match next_state(session.state(), Method::Setup, session.media_count(), session.announced_count()) {
            Ok(next) => next,
            Err(status) => return Response::new(status),
        };

        let header = match req.headers.get("Transport").and_then(TransportHeader::parse) {
            Some(h) => h,
            None => return Response::new(StatusCode::BAD_REQUEST),
        };
        let transport = header.transport();
        if let Some(current) = session.transport() {
            if current != transport {
                debug!("session {} uses {}, refusing {}", session.id(), current, transport);
                return Response::new(StatusCode::BAD_REQUEST);
            }
        }

        let recording = session.state() == SessionState::PreRecord;
        let udp = self.shared.udp();
        match transport {
            Transport::Udp => {
                if self.info.secure || udp.is_none() {
                    return Response::new(StatusCode::UNSUPPORTED_TRANSPORT);
                }
                if header.client_ports.is_none() {
                    return Response::new(StatusCode::BAD_REQUEST);
                }
            }
            Transport::UdpMulticast => {
                if self.info.secure || recording || self.shared.multicast_allocator().is_none() {
                    return Response::new(StatusCode::UNSUPPORTED_TRANSPORT);
                }
            }
            Transport::Tcp => {}
        }

        let (base_path, control) = match session.path() {
            known if !known.is_empty() && (path == known || path.starts_with(&format!("{}/", known))) => {
                let control = path[known.len()..].trim_start_matches('/').to_string();
                (known, Some(control).filter(|c| !c.is_empty()))
            }
            _ => split_control(path),
        };

        let ctx = SetupCtx {
            conn: &self.info,
            session: &session,
            request: req,
            target: RequestTarget {
                path: &base_path,
                query,
            },
            transport,
        };
        let (res, stream) = match self.handler.on_setup(ctx).await {
            Ok(reply) => reply,
            Err(e) => return handler_failed(&Method::Setup, e),
        };
        if !res.status.is_success() {
            return res;
        }

        let index = if recording {
            session
                .announced_description()
                .and_then(|d| media_index(&d, path, control.as_deref()))
        } else {
            let stream = match &stream {
                Some(s) if s.is_initialized() && !s.is_closed() => s,
                _ => return Response::new(StatusCode::NOT_FOUND),
            };
            if let Some(current) = session.stream() {
                if !Arc::ptr_eq(&current, stream) {
                    debug!("session {} already reads another stream", session.id());
                    return Response::new(StatusCode::BAD_REQUEST);
                }
            }
            media_index(stream.description(), path, control.as_deref())
        };
        let index = match index {
            Some(i) if !session.has_media(i) => i,
            Some(i) => {
                debug!("media {} of session {} is already set up", i, session.id());
                return Response::new(StatusCode::BAD_REQUEST);
            }
            None => {
                debug!("no media matches {}", path);
                return Response::new(StatusCode::BAD_REQUEST);
            }
        };

        let (target, mut reply) = match (transport, &udp) {
            (Transport::Udp, Some(udp)) => {
                let (rtp, rtcp) = header.client_ports.unwrap_or_default();
                let ip = self.info.remote_addr.ip();
                let mut reply = TransportHeader::new_udp((rtp, rtcp));
                reply.server_ports = Some(udp.ports());
                (
                    MediaTarget::Udp {
                        rtp: SocketAddr::new(ip, rtp),
                        rtcp: SocketAddr::new(ip, rtcp),
                    },
                    reply,
                )
            }
            (Transport::UdpMulticast, _) => {
                let stream = match &stream {
                    Some(s) => s,
                    None => return Response::new(StatusCode::NOT_FOUND),
                };
                let group = match stream.multicast_target(index).await {
                    Ok(group) => group,
                    Err(e) => {
                        warn!("unable to serve media {} over multicast: {}", index, e);
                        return Response::new(StatusCode::UNSUPPORTED_TRANSPORT);
                    }
                };
                let mut reply = TransportHeader::new_multicast();
                reply.destination = Some(group.group);
                reply.ports = Some(group.ports);
                reply.ttl = Some(group.ttl);
                (MediaTarget::Multicast, reply)
            }
            (Transport::Tcp, _) => {
                let channels = match header.interleaved {
                    Some(channels) => channels,
                    None => match self.free_channels() {
                        Some(channels) => channels,
                        None => return Response::new(StatusCode::BAD_REQUEST),
                    },
                };
                if self.channels.contains_key(&channels.0) || self.channels.contains_key(&channels.1) {
                    debug!("interleaved channels {:?} already in use", channels);
                    return Response::new(StatusCode::BAD_REQUEST);
                }
                (MediaTarget::Tcp { channels }, TransportHeader::new_interleaved(channels))
            }
            (Transport::Udp, None) => return Response::new(StatusCode::UNSUPPORTED_TRANSPORT),
        };
        if let Some(mode) = header.mode {
            reply = reply.with_mode(mode);
        }

        let tcp_writer = match target {
            MediaTarget::Tcp { .. } => Some(self.writer.clone()),
            _ => None,
        };
        session.set_target(&base_path, query);
        session.add_media(index, target, transport, if recording { None } else { stream }, tcp_writer);
        match target {
            MediaTarget::Udp { rtp, rtcp } => {
                if let Some(udp) = &udp {
                    udp.add_route(rtp, rtcp, &session, index);
                }
            }
            MediaTarget::Tcp { channels } => {
                self.channels.insert(channels.0, (session.clone(), index, false));
                self.channels.insert(channels.1, (session.clone(), index, true));
            }
            MediaTarget::Multicast => {}
        }
        session.set_state(next);
        self.commit(&session, is_new).await;

        let mut res = self.with_session_header(res, &session);
        res.headers.set("Transport", reply.to_string());
        res
    }

    fn free_channels(&self) -> Option<(u8, u8)> {
        (0..=254u8)
            .step_by(2)
            .find(|i| !self.channels.contains_key(i) && !self.channels.contains_key(&(i + 1)))
            .map(|i| (i, i + 1))
    }

    /// PLAY, RECORD and PAUSE.
    async fn handle_control(
        &mut self,
        req: &Request,
        session: Arc<ServerSession>,
        path: &str,
        query: Option<&str>,
    ) -> Response {
        let next = match next_state(session.state(), req.method.clone(), session.media_count(), session.announced_count()) {
            Ok(next) => next,
            Err(status) => return Response::new(status),
        };
        let (base_path, _) = split_control(path);

        let ctx = SessionCtx {
            conn: &self.info,
            session: &session,
            request: req,
            target: RequestTarget {
                path: &base_path,
                query,
            },
        };
        let res = match req.method {
            Method::Play => self.handler.on_play(ctx).await,
            Method::Record => self.handler.on_record(ctx).await,
            _ => self.handler.on_pause(ctx).await,
        };
        let res = match res {
            Ok(res) => res,
            Err(e) => return handler_failed(&req.method, e),
        };
        if !res.status.is_success() {
            return res;
        }

        match req.method {
            Method::Play => {
                if let Err(e) = session.start_playing(self.shared.config().write_queue_size) {
                    warn!("session {} can't play: {}", session.id(), e);
                    return Response::new(StatusCode::BAD_REQUEST);
                }
            }
            Method::Pause if session.state() == SessionState::Playing => session.stop_playing(),
            _ => {}
        }
        session.set_state(next);
        self.with_session_header(res, &session)
    }

    fn handle_teardown(&mut self, session: Arc<ServerSession>) -> Response {
        self.sessions.remove(session.id());
        self.channels.retain(|_, (s, _, _)| s.id() != session.id());
        session.close_with(RtspError::Terminated);
        Response::ok()
    }

    async fn handle_parameter(
        &mut self,
        req: &Request,
        session: Option<Arc<ServerSession>>,
        path: &str,
        query: Option<&str>,
    ) -> Response {
        let ctx = ParameterCtx {
            conn: &self.info,
            session: session.as_ref(),
            request: req,
            target: RequestTarget { path, query },
        };
        let res = match req.method {
            Method::GetParameter => self.handler.on_get_parameter(ctx).await,
            _ => self.handler.on_set_parameter(ctx).await,
        };
        match (res, &session) {
            (Err(e), _) => handler_failed(&req.method, e),
            (Ok(res), Some(session)) if res.status.is_success() => self.with_session_header(res, session),
            (Ok(res), _) => res,
        }
    }
}

fn handler_failed(method: &Method, e: RtspError) -> Response {
    debug!("{} handler failed: {}", method, e);
    Response::new(StatusCode::BAD_REQUEST)
}

/// Cause reported to sessions closed with their connection.
fn session_cause(cause: &RtspError) -> RtspError {
    match cause {
        RtspError::Timeout => RtspError::Timeout,
        RtspError::Terminated => RtspError::Terminated,
        other => RtspError::Protocol(format!("connection lost: {}", other)),
    }
}

/// Path without the leading slash, and query, of a request URL.
fn request_target(url: &RtspUrl) -> (String, Option<String>) {
    (
        url.path().trim_start_matches('/').to_string(),
        url.query().map(str::to_string),
    )
}

/// Splits a trailing media control such as `trackID=1` from a path.
fn split_control(path: &str) -> (String, Option<String>) {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some((base, last)) if last.contains('=') => (base.to_string(), Some(last.to_string())),
        None if path.contains('=') => (String::new(), Some(path.to_string())),
        _ => (path.to_string(), None),
    }
}

fn media_index(description: &SessionDescription, path: &str, control: Option<&str>) -> Option<usize> {
    if let Some(index) = control.and_then(|c| description.find_media_by_control(c)) {
        return Some(index);
    }
    description.find_media_by_control(path).or_else(|| {
        if control.is_none() && description.media.len() == 1 {
            Some(0)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::rtsp::sdp::MediaDescription;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_control() {
        assert_eq!(split_control("live/cam/trackID=1"), ("live/cam".to_string(), Some("trackID=1".to_string())));
        assert_eq!(split_control("live/cam"), ("live/cam".to_string(), None));
        assert_eq!(split_control("live/cam/"), ("live/cam".to_string(), None));
        assert_eq!(split_control("trackID=0"), (String::new(), Some("trackID=0".to_string())));
    }

    #[test]
    fn test_media_index() {
        let mut desc = SessionDescription::new()
            .with_media(MediaDescription::new("video", 0, "RTP/AVP", vec![96]))
            .with_media(MediaDescription::new("audio", 0, "RTP/AVP", vec![97]));
        desc.ensure_controls();

        assert_eq!(media_index(&desc, "cam/trackID=1", Some("trackID=1")), Some(1));
        assert_eq!(media_index(&desc, "cam/trackID=0", Some("trackID=0")), Some(0));
        assert_eq!(media_index(&desc, "cam", None), None);
        assert_eq!(media_index(&desc, "cam/trackID=5", Some("trackID=5")), None);

        let single = SessionDescription::new().with_media(
            MediaDescription::new("video", 0, "RTP/AVP", vec![96]).with_attribute("control", "trackID=0"),
        );
        assert_eq!(media_index(&single, "cam", None), Some(0));
    }

    #[test]
    fn test_session_cause() {
        assert!(matches!(session_cause(&RtspError::Timeout), RtspError::Timeout));
        assert!(matches!(
            session_cause(&RtspError::Framing("x".into())),
            RtspError::Protocol(_)
        ));
    }
}
