//! RTSP server.
//!
//! The server accepts connections, keeps a registry of sessions and hands
//! application decisions to a [`ServerHandler`]. Content is published
//! through [`ServerStream`]s, which fan packets out to every reading session.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use rtspio::format::rtsp::server::{DescribeCtx, Server, ServerConfig, ServerHandler, ServerStream, SetupCtx};
//! use rtspio::format::rtsp::{Response, StatusCode};
//! use rtspio::Result;
//!
//! struct Camera {
//!     stream: parking_lot::Mutex<Option<Arc<ServerStream>>>,
//! }
//!
//! #[async_trait]
//! impl ServerHandler for Camera {
//!     async fn on_describe(&self, _ctx: DescribeCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
//!         match self.stream.lock().clone() {
//!             Some(stream) => Ok((Response::ok(), Some(stream))),
//!             None => Ok((Response::new(StatusCode::NOT_FOUND), None)),
//!         }
//!     }
//!
//!     async fn on_setup(&self, _ctx: SetupCtx<'_>) -> Result<(Response, Option<Arc<ServerStream>>)> {
//!         Ok((Response::ok(), self.stream.lock().clone()))
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let camera = Camera { stream: parking_lot::Mutex::new(None) };
//! let mut server = Server::new(ServerConfig::default(), camera)?;
//! server.start_and_wait().await
//! # }
//! ```

mod conn;
mod handler;
mod session;
mod stream;
mod udp;

pub use handler::{
    AnnounceCtx, ConnInfo, DescribeCtx, ParameterCtx, RequestTarget, ServerHandler, SessionCtx, SetupCtx,
};
pub use session::{ServerSession, SessionState};
pub use stream::ServerStream;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::{Result, RtspError};
use udp::{MulticastAllocator, ServerUdp};

/// Server settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address of the RTSP listener.
    pub rtsp_address: String,
    /// RTP listener address. UDP transport is enabled when both UDP
    /// addresses are set.
    pub udp_rtp_address: Option<String>,
    pub udp_rtcp_address: Option<String>,
    /// IPv4 range multicast groups are taken from, e.g. `224.1.0.0/16`.
    /// Multicast transport is enabled when set.
    pub multicast_ip_range: Option<String>,
    pub multicast_rtp_port: u16,
    pub multicast_rtcp_port: u16,
    pub multicast_ttl: u8,
    /// Serves `rtsps` when set. Incompatible with UDP and multicast.
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Inactivity after which a session without connection is closed.
    /// Also reported to clients in the `Session` header.
    pub session_timeout: Duration,
    /// Packets buffered per reading session before packets are dropped.
    pub write_queue_size: usize,
    /// Value of the `Server` header.
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtsp_address: "0.0.0.0:8554".to_string(),
            udp_rtp_address: None,
            udp_rtcp_address: None,
            multicast_ip_range: None,
            multicast_rtp_port: 8002,
            multicast_rtcp_port: 8003,
            multicast_ttl: 16,
            tls_config: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            write_queue_size: 256,
            server_name: concat!("rtspio/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("rtsp_address", &self.rtsp_address)
            .field("udp_rtp_address", &self.udp_rtp_address)
            .field("udp_rtcp_address", &self.udp_rtcp_address)
            .field("multicast_ip_range", &self.multicast_ip_range)
            .field("multicast_rtp_port", &self.multicast_rtp_port)
            .field("multicast_rtcp_port", &self.multicast_rtcp_port)
            .field("multicast_ttl", &self.multicast_ttl)
            .field("tls", &self.tls_config.is_some())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("session_timeout", &self.session_timeout)
            .field("write_queue_size", &self.write_queue_size)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.udp_rtp_address.is_some() != self.udp_rtcp_address.is_some() {
            return Err(RtspError::Protocol(
                "udp_rtp_address and udp_rtcp_address must be set together".into(),
            ));
        }
        if self.tls_config.is_some() && (self.udp_rtp_address.is_some() || self.multicast_ip_range.is_some()) {
            return Err(RtspError::Protocol(
                "TLS can't be used with UDP or multicast transport".into(),
            ));
        }
        if self.multicast_ip_range.is_some() && (self.multicast_rtp_port == 0 || self.multicast_rtcp_port == 0) {
            return Err(RtspError::Protocol("multicast ports must be set".into()));
        }
        if self.write_queue_size == 0 {
            return Err(RtspError::Protocol("write_queue_size must be positive".into()));
        }
        Ok(())
    }
}

/// State shared by the server, its connections, sessions and streams.
pub struct ServerShared {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    udp: RwLock<Option<Arc<ServerUdp>>>,
    multicast: Option<Arc<MulticastAllocator>>,
    tls: Option<TlsAcceptor>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Handle to a server, used to create streams and inspect sessions.
pub type ServerHandle = Arc<ServerShared>;

impl ServerShared {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Currently open sessions.
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn session(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Local ports of the UDP listeners, once started.
    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        self.udp.read().as_ref().map(|udp| udp.ports())
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops accepting, ends every connection and closes every session.
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("closing server");

        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close_with(RtspError::Terminated);
        }
        self.udp.write().take();
    }

    pub(crate) fn handler(&self) -> Arc<dyn ServerHandler> {
        self.handler.clone()
    }

    pub(crate) fn udp(&self) -> Option<Arc<ServerUdp>> {
        self.udp.read().clone()
    }

    pub(crate) fn multicast_allocator(&self) -> Option<Arc<MulticastAllocator>> {
        self.multicast.clone()
    }

    pub(crate) fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Unique, random session id.
    pub(crate) fn new_session_id(&self) -> String {
        let sessions = self.sessions.read();
        loop {
            let id = format!("{:016X}", rand::random::<u64>());
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert_session(&self, session: Arc<ServerSession>) {
        debug!("session {} opened", session.id());
        self.sessions.write().insert(session.id().to_string(), session);
    }

    pub(crate) fn remove_session(&self, id: &str) {
        self.sessions.write().remove(id);
        if let Some(udp) = self.udp() {
            udp.remove_routes(id);
        }
    }
}

/// An RTSP server.
pub struct Server {
    shared: ServerHandle,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Checks the configuration and prepares the server. Nothing is bound
    /// until [`start`](Self::start).
    pub fn new<H: ServerHandler + 'static>(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;

        let multicast = match &config.multicast_ip_range {
            Some(range) => Some(Arc::new(MulticastAllocator::parse(range)?)),
            None => None,
        };
        let tls = config.tls_config.clone().map(TlsAcceptor::from);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                handler: Arc::new(handler),
                sessions: RwLock::new(HashMap::new()),
                udp: RwLock::new(None),
                multicast,
                tls,
                next_id: AtomicU64::new(1),
                shutdown,
            }),
            listener: None,
            local_addr: None,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.shared.clone()
    }

    /// Binds the RTSP listener and, when configured, the UDP listeners.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.shared.config();
        if let (Some(rtp), Some(rtcp)) = (&config.udp_rtp_address, &config.udp_rtcp_address) {
            let udp = ServerUdp::bind(rtp, rtcp).await?;
            *self.shared.udp.write() = Some(Arc::new(udp));
        }

        let listener = TcpListener::bind(&config.rtsp_address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "listening on {} ({})",
            local_addr,
            if self.shared.tls.is_some() { "rtsps" } else { "rtsp" }
        );
        self.local_addr = Some(local_addr);
        self.listener = Some(listener);
        Ok(())
    }

    /// Address of the RTSP listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        self.shared.udp_ports()
    }

    /// Accepts connections until the server is closed.
    pub async fn wait(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| RtspError::Protocol("server is not started".into()))?;
        let mut shutdown = self.shared.subscribe_shutdown();

        while !*shutdown.borrow() {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((tcp, remote_addr)) => {
                        let id = self.shared.next_id();
                        tokio::spawn(conn::serve(self.shared.clone(), tcp, remote_addr, id));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = shutdown.changed() => {}
            }
        }

        info!("server closed");
        Ok(())
    }

    pub async fn start_and_wait(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.close();
    }
}
