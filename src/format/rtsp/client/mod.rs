//! RTSP client.
//!
//! The client drives one session at a time over one control connection:
//!
//! ```rust,no_run
//! use rtspio::format::rtsp::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(ClientOptions::new());
//!     client.on_packet_rtp_any(|media, pkt| {
//!         println!("media {} seq {}", media, pkt.sequence_number);
//!     });
//!     client.start_reading("rtsp://example.com/stream").await?;
//!     client.wait().await?;
//!     Ok(())
//! }
//! ```

mod media;
mod state;

pub use state::ClientState;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::media::{bind_udp_pair, join_multicast, ClientMedia, MediaTransport};
use self::state::Snapshot;
use super::auth::{Authenticator, Credentials};
use super::callbacks::PacketCallbacks;
use super::conn::{self, BoxedReader, ConnWriter, FrameReader, Message};
use super::dial::{self, default_dialer, DialFn, TlsParams};
use super::message::{Method, Request, Response, StatusCode};
use super::policy::{check_transport, resolve_transport, SchemePolicy, Transport};
use super::sdp::SessionDescription;
use super::transport::{TransportHeader, TransportMode};
use super::url::{RtspUrl, Scheme};
use crate::format::rtp::RTPPacket;
use crate::{Result, RtspError};

pub const DEFAULT_USER_AGENT: &str = concat!("rtspio/", env!("CARGO_PKG_VERSION"));

/// How often `wait` checks for UDP inactivity.
const CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Preferred transport. When unset, SETUP tries UDP and falls back to TCP.
    pub transport: Option<Transport>,
    /// TLS configuration, required by `rtsps` URLs.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Maximum wait for a response, and for UDP packets while playing.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Deadline for dialing and the TLS handshake.
    pub connect_timeout: Duration,
    /// Interval of keep-alive requests sent by `wait`. Zero disables them.
    pub keepalive_period: Duration,
    pub user_agent: String,
    /// Opens TCP connections; replaceable for tests and custom networking.
    pub dialer: DialFn,
}

impl ClientOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            transport: None,
            tls_config: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keepalive_period: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            dialer: default_dialer(),
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.keepalive_period = period;
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Replaces the function used to open TCP connections.
    pub fn with_dialer(mut self, dialer: DialFn) -> Self {
        self.dialer = dialer;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("transport", &self.transport)
            .field("tls", &self.tls_config.is_some())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_period", &self.keepalive_period)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Interleaved channel → (media index, is RTCP).
type ChannelMap = Arc<RwLock<HashMap<u8, (usize, bool)>>>;

struct ClientConn {
    writer: ConnWriter,
    responses: mpsc::UnboundedReceiver<Response>,
    read_task: Option<JoinHandle<RtspError>>,
}

impl ClientConn {
    async fn exchange(
        &mut self,
        req: &Request,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Response> {
        let write = async { self.writer.lock().await.write_request(req).await };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(res) => res?,
            Err(_) => return Err(RtspError::Timeout),
        }

        let cseq = req.headers.cseq();
        let deadline = tokio::time::Instant::now() + read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.responses.recv()).await {
                Err(_) => return Err(RtspError::Timeout),
                Ok(None) => return Err(self.read_error().await),
                Ok(Some(res)) => {
                    let res_cseq = res.headers.cseq();
                    if res_cseq.is_none() || res_cseq == cseq {
                        return Ok(res);
                    }
                    debug!("discarding response with CSeq {:?}", res_cseq);
                }
            }
        }
    }

    /// Error that stopped the read task.
    async fn read_error(&mut self) -> RtspError {
        match self.read_task.take() {
            Some(task) => task.await.unwrap_or(RtspError::Terminated),
            None => RtspError::Terminated,
        }
    }

    async fn close(mut self, write_timeout: Duration) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        let shutdown = async { self.writer.lock().await.shutdown().await };
        let _ = tokio::time::timeout(write_timeout, shutdown).await;
    }
}

/// RTSP client implementation supporting playback and publishing.
///
/// This client provides:
/// - Scheme-driven transport selection (`rtsp`, `rtsps`, `rtspt`)
/// - UDP, UDP-multicast and TCP-interleaved media transport
/// - Authentication handling (Basic and Digest)
/// - Packet callbacks for received RTP/RTCP
pub struct Client {
    options: ClientOptions,
    /// Server root URL, set by `start`.
    conn_url: Option<RtspUrl>,
    /// Transport preference after the scheme policy is applied.
    transport: Option<Transport>,
    /// Transport the caller asked for, checked when the connection opens.
    declared_transport: Option<Transport>,
    conn: Option<ClientConn>,
    server_ip: Option<IpAddr>,
    cseq: u32,
    state: ClientState,
    announced: bool,
    session: Option<String>,
    credentials: Option<Credentials>,
    auth: Option<Authenticator>,
    description: Option<SessionDescription>,
    base_url: Option<RtspUrl>,
    /// Transport shared by every media of the current session.
    session_transport: Option<Transport>,
    medias: Vec<ClientMedia>,
    channels: ChannelMap,
    callbacks: Arc<RwLock<PacketCallbacks>>,
    last_packet: Arc<Mutex<Instant>>,
    udp_tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            conn_url: None,
            transport: None,
            declared_transport: None,
            conn: None,
            server_ip: None,
            cseq: 0,
            state: ClientState::Idle,
            announced: false,
            session: None,
            credentials: None,
            auth: None,
            description: None,
            base_url: None,
            session_transport: None,
            medias: Vec::new(),
            channels: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(RwLock::new(PacketCallbacks::new())),
            last_packet: Arc::new(Mutex::new(Instant::now())),
            udp_tasks: Vec::new(),
        }
    }

    /// Prepares the client for a server. No I/O happens here; the
    /// connection is opened by the first request.
    ///
    /// # Arguments
    ///
    /// * `scheme` - URL scheme; `rtsps` and `rtspt` force TCP transport
    /// * `host` - `host[:port]` of the server
    pub fn start(&mut self, scheme: Scheme, host: &str) -> Result<()> {
        if self.conn_url.is_some() {
            return Err(RtspError::Protocol("client already started".into()));
        }

        let url = RtspUrl::from_host(scheme, host)?;
        self.declared_transport = self.options.transport;
        self.transport = resolve_transport(scheme, self.options.transport);
        debug!(
            "client started for {} (transport {:?})",
            url.canonical_addr(),
            self.transport
        );
        self.conn_url = Some(url);
        Ok(())
    }

    /// Effective transport preference.
    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    /// Transport explicitly requested by the caller.
    pub fn declared_transport(&self) -> Option<Transport> {
        self.declared_transport
    }

    /// Declares the transport to use. After `start` the scheme policy still
    /// applies, and a non-TCP declaration on a TCP-only scheme makes the
    /// connection fail to open.
    pub fn set_transport(&mut self, transport: Transport) {
        self.declared_transport = Some(transport);
        match &self.conn_url {
            Some(url) => self.transport = resolve_transport(url.scheme(), Some(transport)),
            None => self.options.transport = Some(transport),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        self.description.as_ref()
    }

    /// Base URL used to resolve media controls.
    pub fn base_url(&self) -> Option<&RtspUrl> {
        self.base_url.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Transport negotiated by SETUP, once a media is set up.
    pub fn session_transport(&self) -> Option<Transport> {
        self.session_transport
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            announced: self.announced,
            medias: self.medias.len(),
        }
    }

    /// Opens the control connection.
    ///
    /// Fails with `TransportNotAllowed`, before any network activity, when
    /// the scheme requires TCP and another transport was declared.
    pub async fn conn_open(&mut self) -> Result<()> {
        let url = self
            .conn_url
            .clone()
            .ok_or_else(|| RtspError::Protocol("client not started".into()))?;

        check_transport(url.scheme(), self.declared_transport)?;

        let tls = if SchemePolicy::for_scheme(url.scheme()).uses_tls() {
            let config = self.options.tls_config.clone().ok_or_else(|| {
                RtspError::Tls("rtsps requires a TLS client configuration".into())
            })?;
            Some(TlsParams {
                server_name: url.hostname().to_string(),
                config,
            })
        } else {
            None
        };

        let addr = url.canonical_addr();
        let (stream, peer) =
            dial::open(&addr, tls, &self.options.dialer, self.options.connect_timeout).await?;
        let (reader, writer) = conn::split(stream);

        let (res_tx, res_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(read_loop(
            reader,
            writer.clone(),
            res_tx,
            self.channels.clone(),
            self.callbacks.clone(),
            self.last_packet.clone(),
        ));

        info!("connected to {} ({})", addr, peer);
        self.server_ip = Some(peer.ip());
        self.conn = Some(ClientConn {
            writer,
            responses: res_rx,
            read_task: Some(read_task),
        });
        Ok(())
    }

    async fn release_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close(self.options.write_timeout).await;
        }
    }

    fn reset_session(&mut self) {
        self.stop_udp_readers();
        self.medias.clear();
        self.channels.write().clear();
        self.state = ClientState::Idle;
        self.announced = false;
        self.session = None;
        self.description = None;
        self.base_url = None;
        self.session_transport = None;
    }

    fn remember_credentials(&mut self, url: &RtspUrl) {
        if let Some(username) = url.username() {
            self.credentials = Some(Credentials {
                username: username.to_string(),
                password: url.password().unwrap_or_default().to_string(),
            });
        }
    }

    /// Sends a request and waits for its response, answering one
    /// authentication challenge if credentials are known.
    async fn round_trip(&mut self, mut req: Request) -> Result<Response> {
        if self.conn.is_none() {
            self.conn_open().await?;
        }

        let mut retried = false;
        loop {
            self.cseq += 1;
            req.headers.set("CSeq", self.cseq.to_string());
            req.headers.set("User-Agent", self.options.user_agent.clone());
            if let Some(id) = &self.session {
                req.headers.set("Session", id.clone());
            }
            if let Some(auth) = &self.auth {
                req.headers
                    .set("Authorization", auth.authorization(&req.method, &req.uri));
            }

            debug!("sending {} {}", req.method, req.uri);
            let (write_timeout, read_timeout) = (self.options.write_timeout, self.options.read_timeout);
            let conn = self.conn.as_mut().ok_or(RtspError::Terminated)?;
            let res = match conn.exchange(&req, write_timeout, read_timeout).await {
                Ok(res) => res,
                Err(e) => {
                    if e.is_fatal() {
                        self.release_conn().await;
                    }
                    return Err(e);
                }
            };
            debug!("{} response: {} {}", req.method, res.status, res.reason);

            if res.status == StatusCode::UNAUTHORIZED && !retried {
                if let Some(credentials) = self.credentials.clone() {
                    self.auth = Some(Authenticator::from_challenge(credentials, &res.headers)?);
                    retried = true;
                    continue;
                }
            }

            if let Some(id) = res.headers.session_id() {
                self.session = Some(id.to_string());
            }
            return Ok(res);
        }
    }

    /// Sends OPTIONS. Allowed in every state.
    pub async fn options(&mut self, url: &RtspUrl) -> Result<Response> {
        self.snapshot().check(Method::Options)?;
        self.remember_credentials(url);
        let req = Request::new(Method::Options, url.without_credentials().as_str());
        let res = self.round_trip(req).await?;
        check_status(Method::Options, res)
    }

    /// Sends DESCRIBE and stores the returned description.
    pub async fn describe(&mut self, url: &RtspUrl) -> Result<SessionDescription> {
        self.snapshot().check(Method::Describe)?;
        self.remember_credentials(url);

        let url = url.without_credentials();
        let req = Request::new(Method::Describe, url.as_str()).with_header("Accept", "application/sdp");
        let res = check_status(Method::Describe, self.round_trip(req).await?)?;

        let body = std::str::from_utf8(&res.body)
            .map_err(|_| RtspError::Protocol("description is not valid UTF-8".into()))?;
        let description = SessionDescription::parse(body)?;
        if description.media.is_empty() {
            return Err(RtspError::Protocol("No media sections found in SDP".into()));
        }

        let mut base = match res.headers.get("Content-Base") {
            Some(raw) => RtspUrl::parse(raw)?,
            None => url,
        };
        if let Some(control) = description.get_attribute("control") {
            base = base.join_control(control)?;
        }

        info!("Found {} media descriptions", description.media.len());
        self.description = Some(description.clone());
        self.base_url = Some(base);
        self.announced = false;
        self.state = ClientState::Described;
        Ok(description)
    }

    /// Announces a stream to publish. Media without a control attribute get
    /// `trackID=<index>`.
    pub async fn announce(&mut self, url: &RtspUrl, description: &SessionDescription) -> Result<Response> {
        self.snapshot().check(Method::Announce)?;
        self.remember_credentials(url);

        let mut description = description.clone();
        description.ensure_controls();

        let url = url.without_credentials();
        let req = Request::new(Method::Announce, url.as_str())
            .with_body("application/sdp", description.marshal());
        let res = check_status(Method::Announce, self.round_trip(req).await?)?;

        self.description = Some(description);
        self.base_url = Some(url);
        self.announced = true;
        self.state = ClientState::Described;
        Ok(res)
    }

    /// Sets up one media of the stored description.
    ///
    /// The first SETUP decides the transport of the whole session. With no
    /// preference, UDP is tried first and TCP is used when the server
    /// answers `461 Unsupported Transport`.
    ///
    /// # Arguments
    ///
    /// * `media_index` - Index of the media inside the description
    pub async fn setup(&mut self, media_index: usize) -> Result<Response> {
        self.snapshot().check(Method::Setup)?;

        let (url, control) = {
            let description = self
                .description
                .as_ref()
                .ok_or_else(|| RtspError::Protocol("no session description".into()))?;
            let media = description
                .media
                .get(media_index)
                .ok_or_else(|| RtspError::Protocol(format!("media {} does not exist", media_index)))?;
            let base = self
                .base_url
                .as_ref()
                .ok_or_else(|| RtspError::Protocol("no base URL".into()))?;
            (base.clone(), media.control().unwrap_or("*").to_string())
        };
        if self.medias.iter().any(|m| m.index == media_index) {
            return Err(RtspError::Protocol(format!("media {} is already set up", media_index)));
        }
        let url = url.join_control(&control)?;

        if self.conn.is_none() {
            self.conn_open().await?;
        }
        let server_ip = self.server_ip.ok_or(RtspError::Terminated)?;

        let can_fall_back = self.session_transport.is_none() && self.transport.is_none();
        let mut transport = self
            .session_transport
            .or(self.transport)
            .unwrap_or(Transport::Udp);

        loop {
            let (header, pending) = self.prepare_transport(transport, server_ip).await?;
            let req = Request::new(Method::Setup, url.as_str()).with_header("Transport", header.to_string());
            let res = self.round_trip(req).await?;

            if res.status == StatusCode::UNSUPPORTED_TRANSPORT && can_fall_back && transport == Transport::Udp {
                info!("server refused UDP, switching to TCP");
                transport = Transport::Tcp;
                continue;
            }
            let res = check_status(Method::Setup, res)?;

            let reply = res
                .headers
                .get("Transport")
                .and_then(TransportHeader::parse)
                .ok_or_else(|| RtspError::Protocol("missing or invalid Transport header in response".into()))?;

            let media_transport = match pending {
                Pending::Udp(rtp, rtcp) => MediaTransport::Udp {
                    rtp: Arc::new(rtp),
                    rtcp: Arc::new(rtcp),
                    server_ports: reply.server_ports,
                },
                Pending::Multicast => {
                    let group = reply
                        .destination
                        .ok_or_else(|| RtspError::Protocol("multicast reply without destination".into()))?;
                    let ports = reply
                        .ports
                        .ok_or_else(|| RtspError::Protocol("multicast reply without ports".into()))?;
                    let (rtp, rtcp) = join_multicast(group, ports).await?;
                    MediaTransport::Multicast {
                        rtp: Arc::new(rtp),
                        rtcp: Arc::new(rtcp),
                        group,
                        ports,
                    }
                }
                Pending::Tcp(requested) => {
                    let channels = reply.interleaved.unwrap_or(requested);
                    let mut map = self.channels.write();
                    map.insert(channels.0, (media_index, false));
                    map.insert(channels.1, (media_index, true));
                    MediaTransport::Tcp { channels }
                }
            };

            debug!("media {} set up with {}", media_index, transport);
            self.medias.push(ClientMedia {
                index: media_index,
                transport: media_transport,
            });
            self.session_transport = Some(transport);
            self.state = ClientState::Prepared;
            return Ok(res);
        }
    }

    async fn prepare_transport(
        &self,
        transport: Transport,
        server_ip: IpAddr,
    ) -> Result<(TransportHeader, Pending)> {
        let (header, pending) = match transport {
            Transport::Udp => {
                let (rtp, rtcp) = bind_udp_pair(server_ip).await?;
                let ports = (rtp.local_addr()?.port(), rtcp.local_addr()?.port());
                (TransportHeader::new_udp(ports), Pending::Udp(rtp, rtcp))
            }
            Transport::UdpMulticast => (TransportHeader::new_multicast(), Pending::Multicast),
            Transport::Tcp => {
                let i = u8::try_from(self.medias.len() * 2)
                    .map_err(|_| RtspError::Protocol("too many media for interleaved transport".into()))?;
                let channels = (i, i.saturating_add(1));
                (TransportHeader::new_interleaved(channels), Pending::Tcp(channels))
            }
        };

        let header = if self.announced {
            header.with_mode(TransportMode::Record)
        } else {
            header
        };
        Ok((header, pending))
    }

    /// Sets up every media of the stored description.
    pub async fn setup_all(&mut self) -> Result<()> {
        let count = self.description.as_ref().map(|d| d.media.len()).unwrap_or(0);
        for i in 0..count {
            if !self.medias.iter().any(|m| m.index == i) {
                self.setup(i).await?;
            }
        }
        Ok(())
    }

    fn aggregate_url(&self) -> Result<RtspUrl> {
        self.base_url
            .clone()
            .ok_or_else(|| RtspError::Protocol("no base URL".into()))
    }

    fn start_udp_readers(&mut self) {
        let server_ip = match self.server_ip {
            Some(ip) => ip,
            None => return,
        };
        for media in &self.medias {
            let tasks = media.spawn_readers(server_ip, &self.callbacks, &self.last_packet);
            self.udp_tasks.extend(tasks);
        }
    }

    fn stop_udp_readers(&mut self) {
        for task in self.udp_tasks.drain(..) {
            task.abort();
        }
    }

    fn uses_udp(&self) -> bool {
        matches!(
            self.session_transport,
            Some(Transport::Udp) | Some(Transport::UdpMulticast)
        )
    }

    /// Starts playback of every set up media.
    pub async fn play(&mut self) -> Result<Response> {
        self.snapshot().check(Method::Play)?;
        let url = self.aggregate_url()?;

        // readers go first so that early packets are not lost
        self.start_udp_readers();
        let req = Request::new(Method::Play, url.as_str()).with_header("Range", "npt=0.000-");
        let res = match self.round_trip(req).await.and_then(|r| check_status(Method::Play, r)) {
            Ok(res) => res,
            Err(e) => {
                self.stop_udp_readers();
                return Err(e);
            }
        };

        *self.last_packet.lock() = Instant::now();
        self.state = ClientState::Playing;
        Ok(res)
    }

    /// Starts publishing to every set up media.
    pub async fn record(&mut self) -> Result<Response> {
        self.snapshot().check(Method::Record)?;
        let url = self.aggregate_url()?;

        let req = Request::new(Method::Record, url.as_str());
        let res = check_status(Method::Record, self.round_trip(req).await?)?;

        // receiver reports come back on the RTCP sockets
        self.start_udp_readers();
        self.state = ClientState::Recording;
        Ok(res)
    }

    /// Pauses playback or publishing; the session returns to prepared.
    pub async fn pause(&mut self) -> Result<Response> {
        self.snapshot().check(Method::Pause)?;
        let url = self.aggregate_url()?;

        let req = Request::new(Method::Pause, url.as_str());
        let res = check_status(Method::Pause, self.round_trip(req).await?)?;

        self.stop_udp_readers();
        self.state = ClientState::Prepared;
        Ok(res)
    }

    /// Ends the session and releases the connection.
    pub async fn teardown(&mut self) -> Result<Response> {
        self.snapshot().check(Method::Teardown)?;
        let url = self.aggregate_url()?;

        let res = self.round_trip(Request::new(Method::Teardown, url.as_str())).await;
        self.reset_session();
        self.release_conn().await;
        check_status(Method::Teardown, res?)
    }

    /// Tears the session down if needed and releases every resource. The
    /// client can be started again afterwards.
    pub async fn close(&mut self) {
        if self.state != ClientState::Idle && self.conn.is_some() {
            if let Err(e) = self.teardown().await {
                debug!("teardown on close failed: {}", e);
            }
        }
        self.reset_session();
        self.release_conn().await;
        self.conn_url = None;
        self.server_ip = None;
        self.auth = None;
        self.credentials = None;
    }

    /// Waits until the connection fails.
    ///
    /// Sends keep-alive OPTIONS every `keepalive_period` and fails with
    /// `Timeout` when UDP playback receives nothing for `read_timeout`.
    /// Returns `Ok(())` right away when no connection is open.
    pub async fn wait(&mut self) -> Result<()> {
        enum Event {
            Closed(RtspError),
            KeepAlive,
            Check,
        }

        let period = self.options.keepalive_period;
        let mut keepalive = (!period.is_zero())
            .then(|| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
        let mut check = tokio::time::interval(CHECK_PERIOD);

        loop {
            let event = {
                let task = match self.conn.as_mut().and_then(|c| c.read_task.as_mut()) {
                    Some(task) => task,
                    None => return Ok(()),
                };
                tokio::select! {
                    res = task => Event::Closed(res.unwrap_or(RtspError::Terminated)),
                    _ = tick(&mut keepalive) => Event::KeepAlive,
                    _ = check.tick() => Event::Check,
                }
            };

            match event {
                Event::Closed(e) => {
                    warn!("connection closed: {}", e);
                    if let Some(conn) = self.conn.as_mut() {
                        conn.read_task = None;
                    }
                    self.release_conn().await;
                    return Err(e);
                }
                Event::KeepAlive => {
                    if let Some(url) = self.base_url.clone().or_else(|| self.conn_url.clone()) {
                        trace!("sending keep-alive");
                        let req = Request::new(Method::Options, url.as_str());
                        self.round_trip(req).await?;
                    }
                }
                Event::Check => {
                    if self.state == ClientState::Playing
                        && self.uses_udp()
                        && self.last_packet.lock().elapsed() > self.options.read_timeout
                    {
                        warn!("no UDP packets received in {:?}", self.options.read_timeout);
                        self.reset_session();
                        self.release_conn().await;
                        return Err(RtspError::Timeout);
                    }
                }
            }
        }
    }

    /// Registers a callback for RTP packets of one media and payload type.
    pub fn on_packet_rtp<F>(&self, media: usize, payload_type: u8, cb: F)
    where
        F: Fn(&RTPPacket) + Send + Sync + 'static,
    {
        self.callbacks.write().on_packet_rtp(media, payload_type, cb);
    }

    /// Registers a callback for RTP packets without a specific callback.
    pub fn on_packet_rtp_any<F>(&self, cb: F)
    where
        F: Fn(usize, &RTPPacket) + Send + Sync + 'static,
    {
        self.callbacks.write().on_packet_rtp_any(cb);
    }

    pub fn on_packet_rtcp<F>(&self, media: usize, cb: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.callbacks.write().on_packet_rtcp(media, cb);
    }

    pub fn on_packet_rtcp_any<F>(&self, cb: F)
    where
        F: Fn(usize, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.write().on_packet_rtcp_any(cb);
    }

    /// Sends an RTP packet of a media while recording.
    pub async fn write_packet_rtp(&mut self, media: usize, packet: &RTPPacket) -> Result<()> {
        if self.state != ClientState::Recording {
            return Err(RtspError::InvalidState {
                method: Method::Record,
                state: self.state.to_string(),
            });
        }
        self.write_packet(media, false, packet.marshal()?).await
    }

    /// Sends an RTCP packet of a media while playing or recording.
    pub async fn write_packet_rtcp(&mut self, media: usize, data: &[u8]) -> Result<()> {
        if !matches!(self.state, ClientState::Playing | ClientState::Recording) {
            return Err(RtspError::InvalidState {
                method: if self.announced { Method::Record } else { Method::Play },
                state: self.state.to_string(),
            });
        }
        self.write_packet(media, true, Bytes::copy_from_slice(data)).await
    }

    async fn write_packet(&mut self, media: usize, is_rtcp: bool, data: Bytes) -> Result<()> {
        let media = self
            .medias
            .iter()
            .find(|m| m.index == media)
            .ok_or_else(|| RtspError::Protocol(format!("media {} is not set up", media)))?;

        let channel = match &media.transport {
            MediaTransport::Tcp { channels } => {
                if is_rtcp {
                    channels.1
                } else {
                    channels.0
                }
            }
            _ => {
                let server_ip = self.server_ip.ok_or(RtspError::Terminated)?;
                let (socket, target) = media.udp_target(server_ip, is_rtcp)?;
                trace!("sending {} bytes to {} ({:?})", data.len(), target, media.kind());
                socket.send_to(&data, target).await?;
                return Ok(());
            }
        };

        let writer = self.conn.as_ref().ok_or(RtspError::Terminated)?.writer.clone();
        let write = async { writer.lock().await.write_interleaved(channel, &data).await };
        let res = match tokio::time::timeout(self.options.write_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(RtspError::Timeout),
        };

        // a frame cut short leaves the stream unreadable for the server
        if let Err(e @ (RtspError::Io(_) | RtspError::Timeout)) = &res {
            warn!("interleaved write failed: {}", e);
            self.reset_session();
            self.release_conn().await;
        }
        res
    }

    /// Starts a client, reads the description at `url`, sets up every media
    /// and starts playing.
    pub async fn start_reading(&mut self, url: &str) -> Result<()> {
        let url = RtspUrl::parse(url)?;
        self.start(url.scheme(), &url.canonical_addr())?;

        let res = async {
            self.describe(&url).await?;
            self.setup_all().await?;
            self.play().await?;
            Ok(())
        }
        .await;

        if res.is_err() {
            self.close().await;
        }
        res
    }

    /// Starts a client, announces `description` at `url`, sets up every
    /// media and starts recording.
    pub async fn start_recording(&mut self, url: &str, description: &SessionDescription) -> Result<()> {
        let url = RtspUrl::parse(url)?;
        self.start(url.scheme(), &url.canonical_addr())?;

        let res = async {
            self.announce(&url, description).await?;
            self.setup_all().await?;
            self.record().await?;
            Ok(())
        }
        .await;

        if res.is_err() {
            self.close().await;
        }
        res
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_udp_readers();
        if let Some(task) = self.conn.as_mut().and_then(|c| c.read_task.take()) {
            task.abort();
        }
    }
}

enum Pending {
    Udp(tokio::net::UdpSocket, tokio::net::UdpSocket),
    Multicast,
    Tcp((u8, u8)),
}

/// Ticks of an optional interval; never completes without one.
async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

fn check_status(method: Method, res: Response) -> Result<Response> {
    if res.status.is_success() {
        Ok(res)
    } else {
        Err(RtspError::BadStatus {
            method,
            status: res.status,
            message: res.reason.clone(),
        })
    }
}

async fn read_loop(
    mut reader: FrameReader<BoxedReader>,
    writer: ConnWriter,
    responses: mpsc::UnboundedSender<Response>,
    channels: ChannelMap,
    callbacks: Arc<RwLock<PacketCallbacks>>,
    last_packet: Arc<Mutex<Instant>>,
) -> RtspError {
    loop {
        let message = match reader.read_message().await {
            Ok(m) => m,
            Err(e) => {
                debug!("read loop ended: {}", e);
                return e;
            }
        };

        match message {
            Message::Response(res) => {
                if responses.send(res).is_err() {
                    return RtspError::Terminated;
                }
            }
            Message::Request(req) => {
                debug!("server sent {} request", req.method);
                let mut res = Response::ok();
                if let Some(cseq) = req.headers.get("CSeq") {
                    res.headers.set("CSeq", cseq);
                }
                if let Err(e) = writer.lock().await.write_response(&res).await {
                    return e;
                }
            }
            Message::Interleaved(frame) => {
                let target = channels.read().get(&frame.channel).copied();
                match target {
                    Some((media, false)) => {
                        *last_packet.lock() = Instant::now();
                        callbacks.read().deliver_rtp(media, &frame.payload);
                    }
                    Some((media, true)) => {
                        callbacks.read().deliver_rtcp(media, &frame.payload);
                    }
                    None => trace!("frame on unknown channel {}", frame.channel),
                }
            }
        }
    }
}
