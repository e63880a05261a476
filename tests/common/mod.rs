#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use rtspio::format::rtp::RTPPacket;
use rtspio::format::rtsp::conn::{self, BoxedReader, ConnWriter, FrameReader, InterleavedFrame, Message};
use rtspio::format::rtsp::server::{
    AnnounceCtx, DescribeCtx, Server, ServerConfig, ServerHandle, ServerHandler, ServerSession, ServerStream,
    SessionCtx, SetupCtx,
};
use rtspio::format::rtsp::{MediaDescription, Request, Response, SessionDescription, StatusCode};
use rtspio::{Result, RtspError};

/// Republishes what clients record and serves it to readers, keyed by path.
pub struct Relay {
    pub state: Arc<RelayState>,
}

#[derive(Default)]
pub struct RelayState {
    handle: Mutex<Option<ServerHandle>>,
    streams: Mutex<HashMap<String, Arc<ServerStream>>>,
    /// (media, sequence number) of every recorded RTP packet.
    pub recorded: Mutex<Vec<(usize, u16)>>,
    pub closed_sessions: Mutex<Vec<String>>,
    /// Makes `on_play` fail.
    pub refuse_play: AtomicBool,
}

impl RelayState {
    /// Publishes a stream directly, without a recording client.
    pub fn publish(&self, path: &str, description: SessionDescription) -> Arc<ServerStream> {
        let handle = self.handle.lock().clone().expect("server handle");
        let stream = Arc::new(ServerStream::new(&handle, description));
        stream.initialize().expect("initialize");
        self.streams.lock().insert(path.to_string(), stream.clone());
        stream
    }

    pub fn stream(&self, path: &str) -> Option<Arc<ServerStream>> {
        self.streams.lock().get(path).cloned()
    }
}

#[async_trait]
impl ServerHandler for Relay {
    async fn on_session_close(&self, session: &Arc<ServerSession>, _cause: &RtspError) {
        self.state.closed_sessions.lock().push(session.id().to_string());
        if session.announced_description().is_some() {
            let stream = self.state.streams.lock().remove(&session.path());
            if let Some(stream) = stream {
                stream.close();
            }
        }
    }

    async fn on_describe(&self, ctx: DescribeCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
        match self.state.stream(ctx.target.path) {
            Some(stream) => Ok((Response::ok(), Some(stream))),
            None => Ok((Response::new(StatusCode::NOT_FOUND), None)),
        }
    }

    async fn on_play(&self, _ctx: SessionCtx<'_>) -> Result<Response> {
        if self.state.refuse_play.load(Ordering::SeqCst) {
            return Err(RtspError::Protocol("playback refused".into()));
        }
        Ok(Response::ok())
    }

    async fn on_announce(&self, ctx: AnnounceCtx<'_>) -> Result<Response> {
        if self.state.stream(ctx.target.path).is_some() {
            return Ok(Response::new(StatusCode::BAD_REQUEST));
        }
        Ok(Response::ok())
    }

    async fn on_setup(&self, ctx: SetupCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
        if ctx.session.announced_description().is_some() {
            return Ok((Response::ok(), None));
        }
        match self.state.stream(ctx.target.path) {
            Some(stream) => Ok((Response::ok(), Some(stream))),
            None => Ok((Response::new(StatusCode::NOT_FOUND), None)),
        }
    }

    async fn on_record(&self, ctx: SessionCtx<'_>) -> Result<Response> {
        let description = ctx
            .session
            .announced_description()
            .ok_or_else(|| RtspError::Protocol("nothing announced".into()))?;
        let stream = self.state.publish(ctx.target.path, description);

        let state = self.state.clone();
        ctx.session.on_packet_rtp_any(move |media, packet| {
            state.recorded.lock().push((media, packet.sequence_number));
            let _ = stream.write_packet_rtp(media, packet);
        });
        Ok(Response::ok())
    }
}

pub struct TestServer {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let state = Arc::new(RelayState::default());
        let mut server = Server::new(
            ServerConfig {
                rtsp_address: "127.0.0.1:0".into(),
                ..config
            },
            Relay { state: state.clone() },
        )
        .expect("server config");
        *state.handle.lock() = Some(server.handle());

        server.start().await.expect("start");
        let addr = server.local_addr().expect("local address");
        let handle = server.handle();
        let task = tokio::spawn(async move { server.wait().await });

        Self {
            handle,
            addr,
            state,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("rtsp://{}/{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.handle.close();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
        self.state.handle.lock().take();
    }
}

pub fn description(medias: usize) -> SessionDescription {
    let mut description = SessionDescription::new();
    for i in 0..medias {
        let pt = 96 + i as u8;
        description = description.with_media(
            MediaDescription::new(if i == 0 { "video" } else { "audio" }, 0, "RTP/AVP", vec![pt])
                .with_attribute("rtpmap", &format!("{} H264/90000", pt)),
        );
    }
    description
}

pub fn packet(seq: u16) -> RTPPacket {
    RTPPacket::new(96, seq, seq as u32 * 3000, 0xCAFE, false, bytes::Bytes::from(vec![seq as u8; 16]))
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A bare RTSP connection speaking raw requests.
pub struct RawConn {
    reader: FrameReader<BoxedReader>,
    writer: ConnWriter,
    cseq: u32,
}

impl RawConn {
    pub async fn connect(addr: SocketAddr) -> Self {
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = conn::split(tcp);
        Self { reader, writer, cseq: 0 }
    }

    pub async fn request(&mut self, mut req: Request) -> Response {
        self.cseq += 1;
        req.headers.set("CSeq", self.cseq.to_string());
        self.writer.lock().await.write_request(&req).await.expect("write request");

        loop {
            match self.reader.read_message_timeout(Duration::from_secs(5)).await.expect("read") {
                Message::Response(res) => {
                    assert_eq!(res.headers.cseq(), Some(self.cseq));
                    return res;
                }
                Message::Interleaved(_) => continue,
                Message::Request(req) => panic!("unexpected request {}", req.method),
            }
        }
    }

    pub async fn next_frame(&mut self) -> InterleavedFrame {
        loop {
            match self.reader.read_message_timeout(Duration::from_secs(5)).await.expect("read") {
                Message::Interleaved(frame) => return frame,
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    /// Whether the server ends the connection, skipping pending frames.
    pub async fn closed_by_peer(&mut self) -> bool {
        loop {
            match self.reader.read_message_timeout(Duration::from_secs(5)).await {
                Ok(Message::Interleaved(_)) => continue,
                Ok(_) => return false,
                Err(RtspError::Timeout) => return false,
                Err(_) => return true,
            }
        }
    }

    pub async fn send_frame(&mut self, channel: u8, payload: &[u8]) {
        self.writer
            .lock()
            .await
            .write_interleaved(channel, payload)
            .await
            .expect("write frame");
    }
}
