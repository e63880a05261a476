//! Server-side sessions.
//!
//! A session is created by the first successful ANNOUNCE or SETUP of a
//! client and lives in the server's session table until TEARDOWN, the loss
//! of its connection, or its timeout:
//!
//! ```text
//! ANNOUNCE            Idle      -> PreRecord
//! SETUP               Idle      -> PreRead
//! SETUP               PreRead   -> PreRead
//! SETUP               PreRecord -> PreRecord
//! PLAY                PreRead   -> Playing
//! RECORD              PreRecord -> Recording
//! PAUSE               Playing   -> PreRead
//! PAUSE               Recording -> PreRecord
//! TEARDOWN            any       -> (removed)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::stream::{OutPacket, ServerStream};
use super::{ServerConfig, ServerShared};
use crate::format::rtsp::callbacks::PacketCallbacks;
use crate::format::rtsp::conn::ConnWriter;
use crate::format::rtsp::message::{Method, StatusCode};
use crate::format::rtsp::policy::Transport;
use crate::format::rtsp::sdp::SessionDescription;
use crate::format::rtp::RTPPacket;
use crate::{Result, RtspError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Set up for reading, not playing yet.
    PreRead,
    /// Announced, not recording yet.
    PreRecord,
    Playing,
    Recording,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::PreRead => "pre-read",
            SessionState::PreRecord => "pre-record",
            SessionState::Playing => "playing",
            SessionState::Recording => "recording",
        })
    }
}

/// State a request moves a session to, or the status to answer with when
/// the request is not valid in `state`.
///
/// `setup_medias` counts the media already set up, `announced_medias` the
/// media of the announced description.
pub(crate) fn next_state(
    state: SessionState,
    method: Method,
    setup_medias: usize,
    announced_medias: usize,
) -> std::result::Result<SessionState, StatusCode> {
    use SessionState::*;

    let next = match (method, state) {
        (Method::Announce, Idle) => Some(PreRecord),
        (Method::Setup, Idle) | (Method::Setup, PreRead) => Some(PreRead),
        (Method::Setup, PreRecord) => Some(PreRecord),
        (Method::Play, PreRead) if setup_medias > 0 => Some(Playing),
        (Method::Record, PreRecord) if setup_medias > 0 && setup_medias == announced_medias => {
            Some(Recording)
        }
        (Method::Pause, Playing) | (Method::Pause, PreRead) => Some(PreRead),
        (Method::Pause, Recording) | (Method::Pause, PreRecord) => Some(PreRecord),
        (Method::Teardown, _) => Some(Idle),
        (Method::Options, _)
        | (Method::Describe, _)
        | (Method::GetParameter, _)
        | (Method::SetParameter, _) => Some(state),
        _ => None,
    };

    next.ok_or(StatusCode::METHOD_NOT_VALID_IN_THIS_STATE)
}

/// Where the packets of one set up media go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MediaTarget {
    /// Client RTP and RTCP addresses.
    Udp { rtp: SocketAddr, rtcp: SocketAddr },
    /// Served by the stream's multicast writer.
    Multicast,
    Tcp { channels: (u8, u8) },
}

struct SessionInner {
    state: SessionState,
    /// Id of the connection the session belongs to; `None` while detached.
    owner: Option<u64>,
    path: String,
    query: Option<String>,
    transport: Option<Transport>,
    announced: Option<SessionDescription>,
    stream: Option<Arc<ServerStream>>,
    medias: BTreeMap<usize, MediaTarget>,
    tcp_writer: Option<ConnWriter>,
    writer_task: Option<JoinHandle<()>>,
    last_activity: Instant,
}

/// A client session on the server.
pub struct ServerSession {
    id: String,
    server: Weak<ServerShared>,
    remote_addr: SocketAddr,
    inner: Mutex<SessionInner>,
    callbacks: RwLock<PacketCallbacks>,
    closed: AtomicBool,
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerSession {
    pub(crate) fn new(id: String, server: Weak<ServerShared>, remote_addr: SocketAddr, owner: u64) -> Self {
        Self {
            id,
            server,
            remote_addr,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                owner: Some(owner),
                path: String::new(),
                query: None,
                transport: None,
                announced: None,
                stream: None,
                medias: BTreeMap::new(),
                tcp_writer: None,
                writer_task: None,
                last_activity: Instant::now(),
            }),
            callbacks: RwLock::new(PacketCallbacks::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Transport shared by every media of the session.
    pub fn transport(&self) -> Option<Transport> {
        self.inner.lock().transport
    }

    /// Path the session was announced or set up on.
    pub fn path(&self) -> String {
        self.inner.lock().path.clone()
    }

    pub fn query(&self) -> Option<String> {
        self.inner.lock().query.clone()
    }

    /// Address of the connection that created the session.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Description received with ANNOUNCE.
    pub fn announced_description(&self) -> Option<SessionDescription> {
        self.inner.lock().announced.clone()
    }

    /// Indexes of the media set up so far, in ascending order.
    pub fn setup_medias(&self) -> Vec<usize> {
        self.inner.lock().medias.keys().copied().collect()
    }

    /// Stream read by the session.
    pub fn stream(&self) -> Option<Arc<ServerStream>> {
        self.inner.lock().stream.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a callback for RTP packets published on one media.
    ///
    /// Callbacks run on the task that received the packet and must not
    /// block.
    pub fn on_packet_rtp<F>(&self, media: usize, payload_type: u8, cb: F)
    where
        F: Fn(&RTPPacket) + Send + Sync + 'static,
    {
        self.callbacks.write().on_packet_rtp(media, payload_type, cb);
    }

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

    /// Sends an RTCP packet to the client, for instance receiver reports to
    /// a publisher.
    pub async fn write_packet_rtcp(&self, media: usize, data: &[u8]) -> Result<()> {
        let (target, writer) = {
            let inner = self.inner.lock();
            if !matches!(inner.state, SessionState::Playing | SessionState::Recording) {
                return Err(RtspError::InvalidState {
                    method: if inner.announced.is_some() {
                        Method::Record
                    } else {
                        Method::Play
                    },
                    state: inner.state.to_string(),
                });
            }
            let target = *inner
                .medias
                .get(&media)
                .ok_or_else(|| RtspError::Protocol(format!("media {} is not set up", media)))?;
            (target, inner.tcp_writer.clone())
        };

        match target {
            MediaTarget::Tcp { channels } => {
                let writer = writer.ok_or(RtspError::Terminated)?;
                write_interleaved(&writer, self.write_timeout(), channels.1, data).await
            }
            MediaTarget::Udp { rtcp, .. } => {
                let server = self.server.upgrade().ok_or(RtspError::Terminated)?;
                let udp = server
                    .udp()
                    .ok_or_else(|| RtspError::Protocol("UDP listeners are not running".into()))?;
                udp.rtcp_socket().send_to(data, rtcp).await?;
                Ok(())
            }
            MediaTarget::Multicast => Err(RtspError::Protocol(
                "multicast media are written through the stream".into(),
            )),
        }
    }

    /// Closes the session and detaches it from its stream.
    pub fn close(self: &Arc<Self>) {
        self.close_with(RtspError::Terminated);
    }

    pub(crate) fn close_with(self: &Arc<Self>, cause: RtspError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (stream, task, tcp_writer) = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Idle;
            (inner.stream.take(), inner.writer_task.take(), inner.tcp_writer.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(stream) = stream {
            stream.remove_reader(&self.id);
        }
        info!("session {} closed: {}", self.id, cause);

        // an ended stream or a broken frame leaves nothing to read on the
        // connection, so the client is told by closing it
        if let Some(writer) = tcp_writer.filter(|_| !matches!(cause, RtspError::Terminated)) {
            let timeout = self.write_timeout();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = tokio::time::timeout(timeout, async move { writer.lock().await.shutdown().await }).await;
                });
            }
        }

        if let Some(server) = self.server.upgrade() {
            server.remove_session(&self.id);
            let handler = server.handler();
            let session = self.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    handler.on_session_close(&session, &cause).await;
                });
            }
        }
    }

    /// `Session` header value of responses.
    pub(crate) fn header_value(&self, timeout: Duration) -> String {
        format!("{};timeout={}", self.id, timeout.as_secs())
    }

    fn write_timeout(&self) -> Duration {
        match self.server.upgrade() {
            Some(server) => server.config().write_timeout,
            None => ServerConfig::default().write_timeout,
        }
    }

    pub(crate) fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        self.inner.lock().owner
    }

    pub(crate) fn set_owner(&self, conn: u64) {
        self.inner.lock().owner = Some(conn);
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.lock();
        debug!("session {}: {} -> {}", self.id, inner.state, state);
        inner.state = state;
    }

    pub(crate) fn media_count(&self) -> usize {
        self.inner.lock().medias.len()
    }

    pub(crate) fn announced_count(&self) -> usize {
        self.inner
            .lock()
            .announced
            .as_ref()
            .map(|d| d.media.len())
            .unwrap_or(0)
    }

    pub(crate) fn has_media(&self, index: usize) -> bool {
        self.inner.lock().medias.contains_key(&index)
    }

    pub(crate) fn set_announced(&self, description: SessionDescription, path: &str, query: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.announced = Some(description);
        inner.path = path.to_string();
        inner.query = query.map(str::to_string);
    }

    /// Records a set up media. The first one fixes the session transport,
    /// path and stream.
    pub(crate) fn add_media(
        &self,
        index: usize,
        target: MediaTarget,
        transport: Transport,
        stream: Option<Arc<ServerStream>>,
        tcp_writer: Option<ConnWriter>,
    ) {
        let mut inner = self.inner.lock();
        inner.medias.insert(index, target);
        inner.transport = Some(transport);
        if inner.stream.is_none() {
            inner.stream = stream;
        }
        if tcp_writer.is_some() {
            inner.tcp_writer = tcp_writer;
        }
    }

    pub(crate) fn set_target(&self, path: &str, query: Option<&str>) {
        let mut inner = self.inner.lock();
        if inner.path.is_empty() {
            inner.path = path.to_string();
            inner.query = query.map(str::to_string);
        }
    }

    /// Attaches the session to its stream and starts the writer task.
    pub(crate) fn start_playing(self: &Arc<Self>, queue_size: usize) -> Result<()> {
        let write_timeout = self.write_timeout();
        let (stream, sink, medias) = {
            let inner = self.inner.lock();
            let stream = inner
                .stream
                .clone()
                .ok_or_else(|| RtspError::Protocol("session has no stream".into()))?;
            let medias: HashSet<usize> = inner
                .medias
                .iter()
                .filter(|(_, target)| **target != MediaTarget::Multicast)
                .map(|(index, _)| *index)
                .collect();
            (stream, self.sink(&inner, write_timeout)?, medias)
        };

        let (tx, rx) = mpsc::channel(queue_size.max(1));
        stream.add_reader(self, medias, tx)?;

        let task = tokio::spawn(write_loop(Arc::downgrade(self), rx, sink));
        self.inner.lock().writer_task = Some(task);
        Ok(())
    }

    pub(crate) fn stop_playing(&self) {
        let (stream, task) = {
            let mut inner = self.inner.lock();
            (inner.stream.clone(), inner.writer_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(stream) = stream {
            stream.remove_reader(&self.id);
        }
    }

    fn sink(&self, inner: &SessionInner, write_timeout: Duration) -> Result<SessionSink> {
        match inner.transport {
            Some(Transport::Tcp) => {
                let writer = inner.tcp_writer.clone().ok_or(RtspError::Terminated)?;
                let channels = inner
                    .medias
                    .iter()
                    .filter_map(|(index, target)| match target {
                        MediaTarget::Tcp { channels } => Some((*index, *channels)),
                        _ => None,
                    })
                    .collect();
                Ok(SessionSink::Tcp {
                    writer,
                    channels,
                    write_timeout,
                })
            }
            Some(Transport::Udp) => {
                let server = self.server.upgrade().ok_or(RtspError::Terminated)?;
                let udp = server
                    .udp()
                    .ok_or_else(|| RtspError::Protocol("UDP listeners are not running".into()))?;
                let targets = inner
                    .medias
                    .iter()
                    .filter_map(|(index, target)| match target {
                        MediaTarget::Udp { rtp, rtcp } => Some((*index, (*rtp, *rtcp))),
                        _ => None,
                    })
                    .collect();
                Ok(SessionSink::Udp {
                    rtp: udp.rtp_socket(),
                    rtcp: udp.rtcp_socket(),
                    targets,
                })
            }
            _ => Ok(SessionSink::Discard),
        }
    }

    /// Hands a packet received from the client to the registered callbacks.
    /// RTP is accepted while recording, RTCP while playing or recording.
    pub(crate) fn deliver(&self, media: usize, is_rtcp: bool, data: &[u8]) {
        let state = {
            let mut inner = self.inner.lock();
            inner.last_activity = Instant::now();
            inner.state
        };

        let callbacks = self.callbacks.read();
        match (state, is_rtcp) {
            (SessionState::Recording, false) => {
                callbacks.deliver_rtp(media, data);
            }
            (SessionState::Recording, true) | (SessionState::Playing, true) => {
                callbacks.deliver_rtcp(media, data);
            }
            _ => trace!("session {} ignoring packet in state {}", self.id, state),
        }
    }

    /// Leaves the session without a connection. It is closed once it has
    /// been inactive for `timeout`, unless another connection resumes it.
    pub(crate) fn detach(self: &Arc<Self>, timeout: Duration) {
        self.inner.lock().owner = None;
        debug!("session {} detached", self.id);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut wait = timeout;
            loop {
                tokio::time::sleep(wait).await;
                let session = match weak.upgrade() {
                    Some(s) => s,
                    None => return,
                };
                if session.is_closed() || session.owner().is_some() {
                    return;
                }
                let idle = session.idle_for();
                if idle >= timeout {
                    session.close_with(RtspError::Timeout);
                    return;
                }
                wait = timeout - idle;
            }
        });
    }
}

/// Destination of a playing session's packets.
pub(crate) enum SessionSink {
    Tcp {
        writer: ConnWriter,
        channels: HashMap<usize, (u8, u8)>,
        write_timeout: Duration,
    },
    Udp {
        rtp: Arc<UdpSocket>,
        rtcp: Arc<UdpSocket>,
        targets: HashMap<usize, (SocketAddr, SocketAddr)>,
    },
    /// Every media is multicast.
    Discard,
}

impl SessionSink {
    async fn send(&self, packet: &OutPacket) -> Result<()> {
        match self {
            SessionSink::Tcp {
                writer,
                channels,
                write_timeout,
            } => {
                if let Some((rtp, rtcp)) = channels.get(&packet.media) {
                    let channel = if packet.is_rtcp { *rtcp } else { *rtp };
                    write_interleaved(writer, *write_timeout, channel, &packet.data).await?;
                }
                Ok(())
            }
            SessionSink::Udp { rtp, rtcp, targets } => {
                if let Some((rtp_addr, rtcp_addr)) = targets.get(&packet.media) {
                    if packet.is_rtcp {
                        rtcp.send_to(&packet.data, *rtcp_addr).await?;
                    } else {
                        rtp.send_to(&packet.data, *rtp_addr).await?;
                    }
                }
                Ok(())
            }
            SessionSink::Discard => Ok(()),
        }
    }
}

/// Waits for the connection and writes one frame, both within `timeout`.
async fn write_interleaved(writer: &ConnWriter, timeout: Duration, channel: u8, data: &[u8]) -> Result<()> {
    let write = async { writer.lock().await.write_interleaved(channel, data).await };
    match tokio::time::timeout(timeout, write).await {
        Ok(res) => res,
        Err(_) => Err(RtspError::Timeout),
    }
}

async fn write_loop(session: Weak<ServerSession>, mut queue: mpsc::Receiver<OutPacket>, sink: SessionSink) {
    while let Some(packet) = queue.recv().await {
        let e = match sink.send(&packet).await {
            Ok(()) => continue,
            Err(e) => e,
        };
        let session = match session.upgrade() {
            Some(s) => s,
            None => return,
        };
        warn!("session {} write failed: {}", session.id(), e);
        if matches!(sink, SessionSink::Tcp { .. }) && e.is_fatal() {
            session.close_with(e);
            return;
        }
    }
    trace!("session write queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use SessionState::*;

    #[test]
    fn test_publish_path() {
        assert_eq!(next_state(Idle, Method::Announce, 0, 2), Ok(PreRecord));
        assert_eq!(next_state(PreRecord, Method::Setup, 0, 2), Ok(PreRecord));
        assert_eq!(next_state(PreRecord, Method::Setup, 1, 2), Ok(PreRecord));
        assert_eq!(next_state(PreRecord, Method::Record, 2, 2), Ok(Recording));
        assert_eq!(next_state(Recording, Method::Pause, 2, 2), Ok(PreRecord));
    }

    #[test]
    fn test_read_path() {
        assert_eq!(next_state(Idle, Method::Setup, 0, 0), Ok(PreRead));
        assert_eq!(next_state(PreRead, Method::Setup, 1, 0), Ok(PreRead));
        assert_eq!(next_state(PreRead, Method::Play, 2, 0), Ok(Playing));
        assert_eq!(next_state(Playing, Method::Pause, 2, 0), Ok(PreRead));
        assert_eq!(next_state(Playing, Method::Teardown, 2, 0), Ok(Idle));
    }

    #[test]
    fn test_invalid_orderings() {
        let invalid = StatusCode::METHOD_NOT_VALID_IN_THIS_STATE;
        assert_eq!(next_state(Recording, Method::Announce, 1, 1), Err(invalid));
        assert_eq!(next_state(PreRead, Method::Announce, 1, 0), Err(invalid));
        assert_eq!(next_state(Idle, Method::Play, 0, 0), Err(invalid));
        assert_eq!(next_state(Idle, Method::Record, 0, 0), Err(invalid));
        assert_eq!(next_state(PreRecord, Method::Play, 1, 1), Err(invalid));
        assert_eq!(next_state(PreRead, Method::Record, 1, 0), Err(invalid));
        assert_eq!(next_state(Playing, Method::Setup, 1, 0), Err(invalid));
        assert_eq!(next_state(Recording, Method::Setup, 1, 1), Err(invalid));
        assert_eq!(next_state(Idle, Method::Pause, 0, 0), Err(invalid));
        // every announced media must be set up first
        assert_eq!(next_state(PreRecord, Method::Record, 1, 2), Err(invalid));
        assert_eq!(next_state(PreRead, Method::Play, 0, 0), Err(invalid));
    }

    #[test]
    fn test_keepalive_methods_keep_state() {
        for state in [Idle, PreRead, PreRecord, Playing, Recording] {
            assert_eq!(next_state(state, Method::GetParameter, 1, 1), Ok(state));
            assert_eq!(next_state(state, Method::SetParameter, 1, 1), Ok(state));
            assert_eq!(next_state(state, Method::Options, 1, 1), Ok(state));
        }
    }

    fn session() -> Arc<ServerSession> {
        Arc::new(ServerSession::new(
            "0000000000000001".into(),
            Weak::new(),
            "127.0.0.1:5000".parse().unwrap(),
            1,
        ))
    }

    #[test]
    fn test_deliver_follows_state() {
        let s = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = seen.clone();
        s.on_packet_rtp_any(move |media, pkt| r.lock().push((media, pkt.sequence_number)));

        let raw = RTPPacket::new(96, 7, 0, 1, false, Bytes::from_static(b"x")).marshal().unwrap();
        s.deliver(0, false, &raw);
        assert!(seen.lock().is_empty());

        s.set_state(Recording);
        s.deliver(0, false, &raw);
        assert_eq!(*seen.lock(), vec![(0, 7)]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let s = session();
        s.set_state(PreRead);
        s.close();
        s.close();
        assert!(s.is_closed());
        assert_eq!(s.state(), Idle);
    }

    #[test]
    fn test_add_media_fixes_transport() {
        let s = session();
        assert_eq!(s.transport(), None);
        s.add_media(1, MediaTarget::Tcp { channels: (2, 3) }, Transport::Tcp, None, None);
        assert_eq!(s.transport(), Some(Transport::Tcp));
        assert!(s.has_media(1));
        assert!(!s.has_media(0));
        assert_eq!(s.setup_medias(), vec![1]);
    }

    #[tokio::test]
    async fn test_stalled_reader_is_closed() {
        use crate::format::rtsp::conn::{BoxedWriter, FrameWriter};

        let stalled = tokio_test::io::Builder::new().wait(Duration::from_secs(30)).build();
        let writer: ConnWriter = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(
            Box::new(stalled) as BoxedWriter,
        )));
        let sink = SessionSink::Tcp {
            writer: writer.clone(),
            channels: HashMap::from([(0, (0, 1))]),
            write_timeout: Duration::from_millis(50),
        };

        let s = session();
        s.set_state(Playing);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(write_loop(Arc::downgrade(&s), rx, sink));
        tx.send(OutPacket {
            media: 0,
            is_rtcp: false,
            data: Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(s.is_closed());
        assert_eq!(s.state(), Idle);
        // the connection is usable by others again
        assert!(tokio::time::timeout(Duration::from_secs(1), writer.lock()).await.is_ok());
    }

    #[test]
    fn test_header_value() {
        assert_eq!(
            session().header_value(Duration::from_secs(60)),
            "0000000000000001;timeout=60"
        );
    }
}
